//! Progressive drawdown protection.
//!
//! Tracks the portfolio high-water mark and drives a five-state ladder:
//!
//! | State     | Threshold | Action                                   |
//! |-----------|-----------|------------------------------------------|
//! | NORMAL    | < 5%      | none                                     |
//! | WARNING   | >= 5%     | warning alert                            |
//! | REDUCTION | >= 10%    | position sizes reduced by 25%            |
//! | EMERGENCY | >= 15%    | emergency stop, new orders blocked       |
//! | CRITICAL  | >= 20%    | emergency stop plus mandated liquidation |
//!
//! EMERGENCY and CRITICAL latch: the state cannot decay past them without
//! an explicit admin reset carrying the confirmation token. Transitions
//! are edge-triggered; a crossing is reported once, not on every tick.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use tracing::{info, warn};

/// Confirmation token required to clear a latched emergency state.
pub const EMERGENCY_RESET_TOKEN: &str = "CONFIRM_RESET_EMERGENCY_STOP";

const WARNING_THRESHOLD: Decimal = dec!(0.05);
const REDUCTION_THRESHOLD: Decimal = dec!(0.10);
const EMERGENCY_THRESHOLD: Decimal = dec!(0.15);
const CRITICAL_THRESHOLD: Decimal = dec!(0.20);

/// Position-size reduction applied in REDUCTION state and above.
const REDUCTION_FACTOR: Decimal = dec!(0.25);

/// Ladder state ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DrawdownState {
    Normal,
    Warning,
    Reduction,
    Emergency,
    Critical,
}

impl DrawdownState {
    /// State implied by a drawdown fraction, ignoring any latch.
    pub fn from_drawdown(drawdown_percent: Decimal) -> Self {
        if drawdown_percent >= CRITICAL_THRESHOLD {
            DrawdownState::Critical
        } else if drawdown_percent >= EMERGENCY_THRESHOLD {
            DrawdownState::Emergency
        } else if drawdown_percent >= REDUCTION_THRESHOLD {
            DrawdownState::Reduction
        } else if drawdown_percent >= WARNING_THRESHOLD {
            DrawdownState::Warning
        } else {
            DrawdownState::Normal
        }
    }

    /// Whether new orders are blocked in this state.
    pub fn blocks_trading(&self) -> bool {
        *self >= DrawdownState::Emergency
    }

    /// Whether every position must be liquidated.
    pub fn mandates_liquidation(&self) -> bool {
        *self == DrawdownState::Critical
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DrawdownState::Normal => "NORMAL",
            DrawdownState::Warning => "WARNING",
            DrawdownState::Reduction => "REDUCTION",
            DrawdownState::Emergency => "EMERGENCY",
            DrawdownState::Critical => "CRITICAL",
        }
    }
}

/// Append-only audit record for a ladder transition.
#[derive(Debug, Clone, Serialize)]
pub struct DrawdownEvent {
    pub timestamp: DateTime<Utc>,
    pub previous_state: DrawdownState,
    pub new_state: DrawdownState,
    pub drawdown_percent: Decimal,
    pub portfolio_high: Decimal,
    pub portfolio_value: Decimal,
    /// Fractional position-size reduction now in force, if any
    pub position_reduction: Option<Decimal>,
    pub liquidation_required: bool,
}

/// Result of feeding one portfolio value into the tracker.
#[derive(Debug, Clone)]
pub struct DrawdownUpdate {
    pub state: DrawdownState,
    pub drawdown_percent: Decimal,
    /// Set exactly once per upward crossing into a new state
    pub crossed_into: Option<DrawdownState>,
}

/// Tracks the portfolio high-water mark and the latched ladder state.
pub struct DrawdownTracker {
    portfolio_high: Decimal,
    current_drawdown: Decimal,
    /// Worst drawdown observed this session
    max_drawdown: Decimal,
    state: DrawdownState,
    /// Highest state already reported, for edge-triggered emission
    last_emitted: DrawdownState,
}

impl DrawdownTracker {
    pub fn new(initial_high: Decimal) -> Self {
        Self {
            portfolio_high: initial_high,
            current_drawdown: Decimal::ZERO,
            max_drawdown: Decimal::ZERO,
            state: DrawdownState::Normal,
            last_emitted: DrawdownState::Normal,
        }
    }

    /// Feed a new portfolio value.
    pub fn update(&mut self, portfolio_value: Decimal) -> DrawdownUpdate {
        // The high-water mark never rolls back within a session.
        if portfolio_value > self.portfolio_high {
            self.portfolio_high = portfolio_value;
        }

        self.current_drawdown = (self.portfolio_high - portfolio_value).max(Decimal::ZERO);
        let drawdown_percent = if self.portfolio_high.is_zero() {
            Decimal::ZERO
        } else {
            self.current_drawdown / self.portfolio_high
        };

        if drawdown_percent > self.max_drawdown {
            self.max_drawdown = drawdown_percent;
            warn!(
                drawdown = %drawdown_percent,
                high = %self.portfolio_high,
                value = %portfolio_value,
                "new maximum drawdown recorded"
            );
        }

        let raw_state = DrawdownState::from_drawdown(drawdown_percent);

        // EMERGENCY and above latch until an explicit reset.
        self.state = if self.state >= DrawdownState::Emergency {
            self.state.max(raw_state)
        } else {
            raw_state
        };

        let crossed_into = if self.state > self.last_emitted {
            self.last_emitted = self.state;
            Some(self.state)
        } else {
            // Re-arm lower thresholds once the drawdown recovers.
            if self.state < self.last_emitted && self.last_emitted < DrawdownState::Emergency {
                self.last_emitted = self.state;
            }
            None
        };

        DrawdownUpdate {
            state: self.state,
            drawdown_percent,
            crossed_into,
        }
    }

    /// Clear a latched emergency state. Only the fixed confirmation token
    /// is accepted; anything else leaves the latch in place.
    pub fn reset_emergency(&mut self, token: &str) -> bool {
        if token != EMERGENCY_RESET_TOKEN {
            warn!("emergency reset rejected: bad confirmation token");
            return false;
        }

        info!("emergency latch cleared by admin reset");
        self.state = DrawdownState::Normal;
        self.last_emitted = DrawdownState::Normal;
        true
    }

    /// Multiplier applied to allowed position sizes in the current state.
    pub fn position_size_factor(&self) -> Decimal {
        if self.state >= DrawdownState::Reduction {
            Decimal::ONE - REDUCTION_FACTOR
        } else {
            Decimal::ONE
        }
    }

    pub fn build_event(&self, previous: DrawdownState, portfolio_value: Decimal) -> DrawdownEvent {
        DrawdownEvent {
            timestamp: Utc::now(),
            previous_state: previous,
            new_state: self.state,
            drawdown_percent: self.drawdown_percent(),
            portfolio_high: self.portfolio_high,
            portfolio_value,
            position_reduction: (self.state >= DrawdownState::Reduction)
                .then_some(REDUCTION_FACTOR),
            liquidation_required: self.state.mandates_liquidation(),
        }
    }

    pub fn state(&self) -> DrawdownState {
        self.state
    }

    pub fn portfolio_high(&self) -> Decimal {
        self.portfolio_high
    }

    pub fn current_drawdown(&self) -> Decimal {
        self.current_drawdown
    }

    pub fn drawdown_percent(&self) -> Decimal {
        if self.portfolio_high.is_zero() {
            Decimal::ZERO
        } else {
            self.current_drawdown / self.portfolio_high
        }
    }

    /// Worst drawdown fraction observed this session.
    pub fn max_drawdown(&self) -> Decimal {
        self.max_drawdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_high_water_mark_is_monotonic() {
        let mut tracker = DrawdownTracker::new(dec!(100000));

        tracker.update(dec!(105000));
        assert_eq!(tracker.portfolio_high(), dec!(105000));

        tracker.update(dec!(95000));
        assert_eq!(tracker.portfolio_high(), dec!(105000));
        assert_eq!(tracker.current_drawdown(), dec!(10000));
    }

    #[test]
    fn test_ladder_thresholds() {
        assert_eq!(
            DrawdownState::from_drawdown(dec!(0.04)),
            DrawdownState::Normal
        );
        assert_eq!(
            DrawdownState::from_drawdown(dec!(0.05)),
            DrawdownState::Warning
        );
        assert_eq!(
            DrawdownState::from_drawdown(dec!(0.10)),
            DrawdownState::Reduction
        );
        assert_eq!(
            DrawdownState::from_drawdown(dec!(0.15)),
            DrawdownState::Emergency
        );
        assert_eq!(
            DrawdownState::from_drawdown(dec!(0.20)),
            DrawdownState::Critical
        );
    }

    #[test]
    fn test_drawdown_ladder_scenario() {
        let mut tracker = DrawdownTracker::new(dec!(100000));

        // 6% drawdown crosses into WARNING.
        let update = tracker.update(dec!(94000));
        assert_eq!(update.crossed_into, Some(DrawdownState::Warning));
        assert_eq!(update.drawdown_percent, dec!(0.06));

        // 11% crosses into REDUCTION and sizes shrink by 25%.
        let update = tracker.update(dec!(89000));
        assert_eq!(update.crossed_into, Some(DrawdownState::Reduction));
        assert_eq!(tracker.position_size_factor(), dec!(0.75));

        // 16% activates the emergency stop.
        let update = tracker.update(dec!(84000));
        assert_eq!(update.crossed_into, Some(DrawdownState::Emergency));
        assert!(update.state.blocks_trading());

        // Recovery does not clear the latch.
        let update = tracker.update(dec!(99000));
        assert_eq!(update.state, DrawdownState::Emergency);
        assert_eq!(update.crossed_into, None);

        // Only the fixed token clears it.
        assert!(!tracker.reset_emergency("please"));
        assert_eq!(tracker.state(), DrawdownState::Emergency);
        assert!(tracker.reset_emergency(EMERGENCY_RESET_TOKEN));
        assert_eq!(tracker.state(), DrawdownState::Normal);
    }

    #[test]
    fn test_crossing_emits_once_per_edge() {
        let mut tracker = DrawdownTracker::new(dec!(100000));

        assert!(tracker.update(dec!(94000)).crossed_into.is_some());
        // Further ticks inside WARNING stay quiet.
        assert!(tracker.update(dec!(94500)).crossed_into.is_none());
        assert!(tracker.update(dec!(93500)).crossed_into.is_none());

        // Recover to NORMAL, then cross WARNING again: a fresh edge.
        assert!(tracker.update(dec!(99900)).crossed_into.is_none());
        assert!(tracker.update(dec!(94000)).crossed_into.is_some());
    }

    #[test]
    fn test_critical_mandates_liquidation() {
        let mut tracker = DrawdownTracker::new(dec!(100000));
        let update = tracker.update(dec!(79000));
        assert_eq!(update.crossed_into, Some(DrawdownState::Critical));

        let event = tracker.build_event(DrawdownState::Normal, dec!(79000));
        assert!(event.liquidation_required);
        assert_eq!(event.position_reduction, Some(dec!(0.25)));
    }

    #[test]
    fn test_drawdown_never_negative() {
        let mut tracker = DrawdownTracker::new(dec!(100000));
        let update = tracker.update(dec!(120000));
        assert_eq!(tracker.current_drawdown(), Decimal::ZERO);
        assert_eq!(update.drawdown_percent, Decimal::ZERO);
    }
}
