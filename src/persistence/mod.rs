//! Table-oriented persistence for trading state.
//!
//! The trading core persists through the [`TradeStore`] contract:
//! - grid state snapshots (one row per trading pair)
//! - canonical order records
//! - positions with realized P&L
//! - portfolio and risk-metrics history
//! - risk events and profit distributions
//!
//! Two implementations ship: [`SqliteStore`] when persistence credentials
//! are configured, and [`MockStore`] when they are absent — reads return
//! well-defined defaults and writes are no-ops that log once per kind.

mod sqlite;

pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashSet;
use std::sync::Mutex;
use tracing::info;

use crate::error::TradingError;

#[cfg(test)]
use mockall::automock;

/// Grid state snapshot row, one per trading pair.
#[derive(Debug, Clone)]
pub struct GridStateRow {
    pub trading_pair: String,
    pub current_price: Decimal,
    pub grid_upper_bound: Decimal,
    pub grid_lower_bound: Decimal,
    pub grid_spacing: Decimal,
    pub total_grid_levels: u32,
    pub active_buy_orders: u32,
    pub active_sell_orders: u32,
    pub total_invested: Decimal,
    pub current_profit: Decimal,
    pub last_rebalance_time: DateTime<Utc>,
}

/// Canonical order record row.
#[derive(Debug, Clone)]
pub struct OrderRow {
    pub id: String,
    pub external_order_id: Option<String>,
    pub trading_pair: String,
    pub order_type: String,
    pub order_subtype: String,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub status: String,
    pub filled_quantity: Decimal,
    pub average_fill_price: Option<Decimal>,
    pub fees: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub strategy_id: Option<String>,
    pub grid_level: Option<i64>,
    pub profit_target: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub metadata: serde_json::Value,
}

/// Position row.
#[derive(Debug, Clone)]
pub struct PositionRow {
    pub id: String,
    pub trading_pair: String,
    pub grid_level: Option<i64>,
    pub entry_price: Decimal,
    pub size: Decimal,
    pub side: String,
    pub status: String,
    pub entry_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,
    pub realized_pnl: Option<Decimal>,
    pub strategy_type: String,
}

/// Risk metrics history row.
#[derive(Debug, Clone)]
pub struct RiskMetricsRow {
    pub timestamp: DateTime<Utc>,
    pub portfolio_value: Decimal,
    pub total_exposure: Decimal,
    pub cash_reserves: Decimal,
    pub max_drawdown: Decimal,
    pub current_drawdown: Decimal,
    pub drawdown_percent: Decimal,
    pub portfolio_high: Decimal,
    pub risk_level: String,
}

/// Profit distribution row.
#[derive(Debug, Clone)]
pub struct ProfitDistributionRow {
    pub order_id: String,
    pub total_proceeds: Decimal,
    pub reinvestment_amount: Decimal,
    pub profit_extraction: Decimal,
    pub grid_level: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

/// Table-oriented store contract used by every subsystem.
///
/// Writes are single-row and idempotent against their primary key; there
/// are no multi-statement transactions.
#[cfg_attr(test, automock)]
pub trait TradeStore: Send + Sync {
    fn save_grid_state(&self, row: &GridStateRow) -> Result<(), TradingError>;
    fn load_grid_state(&self, trading_pair: &str) -> Result<Option<GridStateRow>, TradingError>;

    fn save_order(&self, row: &OrderRow) -> Result<(), TradingError>;
    fn load_open_orders(&self) -> Result<Vec<OrderRow>, TradingError>;

    fn save_position(&self, row: &PositionRow) -> Result<(), TradingError>;

    fn record_portfolio_value(
        &self,
        timestamp: DateTime<Utc>,
        portfolio_value: Decimal,
    ) -> Result<(), TradingError>;

    fn record_risk_metrics(&self, row: &RiskMetricsRow) -> Result<(), TradingError>;

    fn record_risk_event(
        &self,
        event_type: &str,
        data: &serde_json::Value,
        snapshot: &serde_json::Value,
    ) -> Result<(), TradingError>;

    fn record_profit_distribution(&self, row: &ProfitDistributionRow) -> Result<(), TradingError>;

    /// Most recent persisted portfolio high, if any.
    fn load_portfolio_high(&self) -> Result<Option<Decimal>, TradingError>;
}

/// Default portfolio high returned by mock-persistence reads.
const MOCK_PORTFOLIO_HIGH: Decimal = dec!(100_000);

/// Mock-persistence mode: reads return defaults, writes log once per kind.
pub struct MockStore {
    logged_kinds: Mutex<HashSet<&'static str>>,
}

impl MockStore {
    pub fn new() -> Self {
        Self {
            logged_kinds: Mutex::new(HashSet::new()),
        }
    }

    fn log_once(&self, kind: &'static str) {
        let mut logged = self.logged_kinds.lock().expect("mock store lock poisoned");
        if logged.insert(kind) {
            info!(kind, "mock persistence active, writes are dropped");
        }
    }
}

impl Default for MockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TradeStore for MockStore {
    fn save_grid_state(&self, _row: &GridStateRow) -> Result<(), TradingError> {
        self.log_once("grid_state");
        Ok(())
    }

    fn load_grid_state(&self, _trading_pair: &str) -> Result<Option<GridStateRow>, TradingError> {
        Ok(None)
    }

    fn save_order(&self, _row: &OrderRow) -> Result<(), TradingError> {
        self.log_once("orders");
        Ok(())
    }

    fn load_open_orders(&self) -> Result<Vec<OrderRow>, TradingError> {
        Ok(Vec::new())
    }

    fn save_position(&self, _row: &PositionRow) -> Result<(), TradingError> {
        self.log_once("positions");
        Ok(())
    }

    fn record_portfolio_value(
        &self,
        _timestamp: DateTime<Utc>,
        _portfolio_value: Decimal,
    ) -> Result<(), TradingError> {
        self.log_once("portfolio_history");
        Ok(())
    }

    fn record_risk_metrics(&self, _row: &RiskMetricsRow) -> Result<(), TradingError> {
        self.log_once("risk_metrics_history");
        Ok(())
    }

    fn record_risk_event(
        &self,
        _event_type: &str,
        _data: &serde_json::Value,
        _snapshot: &serde_json::Value,
    ) -> Result<(), TradingError> {
        self.log_once("risk_events");
        Ok(())
    }

    fn record_profit_distribution(
        &self,
        _row: &ProfitDistributionRow,
    ) -> Result<(), TradingError> {
        self.log_once("profit_distributions");
        Ok(())
    }

    fn load_portfolio_high(&self) -> Result<Option<Decimal>, TradingError> {
        Ok(Some(MOCK_PORTFOLIO_HIGH))
    }
}
