//! Decimal helpers for order sizing and money arithmetic.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

/// Snap a price to the nearest multiple of the pair's tick size.
///
/// Remainders of exactly half a tick round away from zero.
pub fn quantize_price(price: Decimal, tick: Decimal) -> Decimal {
    if tick.is_zero() {
        return price;
    }
    let remainder = price % tick;
    let floored = price - remainder;
    if remainder * dec!(2) >= tick {
        floored + tick
    } else {
        floored
    }
}

/// Truncate a quantity to the pair's lot step. Never rounds up, so the
/// result is always fillable within the requested amount.
pub fn quantize_volume(volume: Decimal, lot_step: Decimal) -> Decimal {
    if lot_step.is_zero() {
        return volume;
    }
    volume - volume % lot_step
}

/// Base-currency volume purchasable with a quote budget at a price,
/// truncated to eight decimal places so dust never exceeds the budget.
pub fn volume_for_budget(quote_budget: Decimal, price: Decimal) -> Decimal {
    quote_budget
        .checked_div(price)
        .unwrap_or(Decimal::ZERO)
        .round_dp_with_strategy(8, RoundingStrategy::ToZero)
}

/// Part over whole, zero when the whole is zero.
pub fn ratio(part: Decimal, whole: Decimal) -> Decimal {
    part.checked_div(whole).unwrap_or(Decimal::ZERO)
}

/// Absolute move from one price to another, as a percentage of the
/// starting price.
pub fn percent_move(from: Decimal, to: Decimal) -> Decimal {
    match (to - from).checked_div(from) {
        Some(fraction) => fraction.abs() * dec!(100),
        None => Decimal::ZERO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantize_price_snaps_to_tick() {
        assert_eq!(quantize_price(dec!(102.037), dec!(0.1)), dec!(102.0));
        assert_eq!(quantize_price(dec!(102.05), dec!(0.1)), dec!(102.1));
        assert_eq!(quantize_price(dec!(97.96), dec!(0.5)), dec!(98.0));
        // Already on the grid: untouched.
        assert_eq!(quantize_price(dec!(104), dec!(0.1)), dec!(104));
        assert_eq!(quantize_price(dec!(104.123), Decimal::ZERO), dec!(104.123));
    }

    #[test]
    fn test_quantize_volume_never_rounds_up() {
        assert_eq!(quantize_volume(dec!(0.98765), dec!(0.001)), dec!(0.987));
        assert_eq!(quantize_volume(dec!(2.4999), dec!(0.5)), dec!(2.0));
        assert_eq!(quantize_volume(dec!(0.02), dec!(0.02)), dec!(0.02));
        assert_eq!(quantize_volume(dec!(3.14), Decimal::ZERO), dec!(3.14));
    }

    #[test]
    fn test_volume_for_budget_truncates_dust() {
        // $100 at $96 a unit is 1.0416666... units; the ninth decimal is
        // dropped, never carried up.
        assert_eq!(
            volume_for_budget(dec!(100), dec!(96)),
            dec!(1.04166666)
        );
        assert_eq!(volume_for_budget(dec!(100), Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn test_ratio_handles_zero_whole() {
        assert_eq!(ratio(dec!(4500), dec!(100000)), dec!(0.045));
        assert_eq!(ratio(dec!(1), Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn test_percent_move_is_signless() {
        assert_eq!(percent_move(dec!(98), dec!(96)), percent_move(dec!(98), dec!(100)));
        assert_eq!(percent_move(dec!(100), dec!(102)), dec!(2));
        assert_eq!(percent_move(Decimal::ZERO, dec!(5)), Decimal::ZERO);
    }
}
