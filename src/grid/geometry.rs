//! Grid geometry.
//!
//! Given a reference price `P`, a fractional range `R` and `N` intervals:
//! `upper = P(1+R)`, `lower = P(1-R)`, and rung `i` sits at
//! `lower + i * (upper - lower) / N` for `i` in `0..=N`, so the first and
//! last rungs land exactly on the bounds.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Dead-zone half width around the reference price: rungs within 0.1% of
/// the reference are left empty.
pub const DEAD_ZONE_BELOW: Decimal = dec!(0.999);
pub const DEAD_ZONE_ABOVE: Decimal = dec!(1.001);

/// Computed grid bounds and spacing.
#[derive(Debug, Clone, PartialEq)]
pub struct GridGeometry {
    pub lower: Decimal,
    pub upper: Decimal,
    /// Spacing as a fraction of the reference: `2R / N`
    pub spacing_fraction: Decimal,
    /// Spacing in price units: `(upper - lower) / N`
    pub spacing_absolute: Decimal,
    pub levels: u32,
}

impl GridGeometry {
    /// Compute bounds around a reference price.
    pub fn around(reference: Decimal, range: Decimal, levels: u32) -> Self {
        let upper = reference * (Decimal::ONE + range);
        let lower = reference * (Decimal::ONE - range);
        let n = Decimal::from(levels.max(1));

        Self {
            lower,
            upper,
            spacing_fraction: dec!(2) * range / n,
            spacing_absolute: (upper - lower) / n,
            levels,
        }
    }

    /// Price of rung `level`, valid for `0..=levels`.
    pub fn level_price(&self, level: u32) -> Decimal {
        self.lower + Decimal::from(level) * self.spacing_absolute
    }

    /// Placement side for a rung relative to the reference price, or
    /// `None` inside the dead zone.
    pub fn placement(&self, level: u32, reference: Decimal) -> Option<PlacementSide> {
        let price = self.level_price(level);
        if price < reference * DEAD_ZONE_BELOW {
            Some(PlacementSide::Buy)
        } else if price > reference * DEAD_ZONE_ABOVE {
            Some(PlacementSide::Sell)
        } else {
            None
        }
    }
}

/// Which side of the book a rung belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementSide {
    Buy,
    Sell,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_and_spacing() {
        let geometry = GridGeometry::around(dec!(100), dec!(0.10), 10);
        assert_eq!(geometry.lower, dec!(90));
        assert_eq!(geometry.upper, dec!(110));
        assert_eq!(geometry.spacing_fraction, dec!(0.02));
        assert_eq!(geometry.spacing_absolute, dec!(2));
    }

    #[test]
    fn test_level_prices_span_the_bounds() {
        let geometry = GridGeometry::around(dec!(100), dec!(0.10), 10);
        assert_eq!(geometry.level_price(0), geometry.lower);
        assert_eq!(geometry.level_price(10), geometry.upper);

        // Strictly monotone in the level index.
        for level in 0..10 {
            assert!(geometry.level_price(level) < geometry.level_price(level + 1));
        }
    }

    #[test]
    fn test_placement_sides_with_dead_zone() {
        let geometry = GridGeometry::around(dec!(100), dec!(0.10), 10);
        let reference = dec!(100);

        let mut buys = Vec::new();
        let mut sells = Vec::new();
        for level in 0..=10 {
            match geometry.placement(level, reference) {
                Some(PlacementSide::Buy) => buys.push(geometry.level_price(level)),
                Some(PlacementSide::Sell) => sells.push(geometry.level_price(level)),
                None => assert_eq!(geometry.level_price(level), dec!(100)),
            }
        }

        assert_eq!(buys, vec![dec!(90), dec!(92), dec!(94), dec!(96), dec!(98)]);
        assert_eq!(
            sells,
            vec![dec!(102), dec!(104), dec!(106), dec!(108), dec!(110)]
        );
    }

    #[test]
    fn test_dead_zone_is_narrow() {
        // A rung 0.05% below the reference is inside the dead zone.
        let geometry = GridGeometry::around(dec!(1000), dec!(0.001), 2);
        assert_eq!(geometry.placement(1, dec!(1000.5)), None);
    }
}
