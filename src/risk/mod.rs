//! Multi-tier risk management.
//!
//! Provides the pre-trade gate and portfolio monitoring:
//! - Exposure, cash-reserve and liquidity limits on every trade
//! - Progressive drawdown protection with a latched emergency stop
//! - Pairwise correlation monitoring across the position book
//! - Real-time risk metrics with persistence

mod correlation;
mod drawdown;
mod manager;

pub use correlation::{CorrelationBreach, CorrelationTracker};
pub use drawdown::{
    DrawdownEvent, DrawdownState, DrawdownTracker, EMERGENCY_RESET_TOKEN,
};
pub use manager::{
    AlertKind, AlertLevel, EmergencyStop, EmergencyStopHandle, LiquidityRisk, PositionRisk,
    PositionSnapshot, RiskAlert, RiskEvent, RiskLevel, RiskManager, RiskMetrics, RiskValidation,
    TradeRiskAssessment,
};
