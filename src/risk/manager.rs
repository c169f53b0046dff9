//! Risk orchestration: the single authoritative gatekeeper.
//!
//! Every prospective trade passes through [`RiskManager::validate_trade_risk`];
//! every portfolio update flows through [`RiskManager::update_portfolio_value`],
//! which recomputes the process-wide [`RiskMetrics`], every [`PositionRisk`],
//! the drawdown ladder, and the asynchronous correlation scan.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::RiskConfig;
use crate::market_data::SnapshotStore;
use crate::persistence::{RiskMetricsRow, TradeStore};
use crate::utils::decimal::ratio;
use crate::utils::events::EventHub;

use super::correlation::CorrelationTracker;
use super::drawdown::{DrawdownEvent, DrawdownState, DrawdownTracker};

/// Exposure floor above which a position joins the correlation scan.
const CORRELATION_EXPOSURE_FLOOR: Decimal = dec!(0.02);

/// Share of daily volume under which a trade is LOW liquidity risk.
const LIQUIDITY_LOW_CEILING: Decimal = dec!(0.02);

/// Dashboard risk level, derived on every update independent of the latch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
    Emergency,
}

impl RiskLevel {
    /// Piecewise derivation on `max(drawdown, exposure excess over limit)`,
    /// reusing the drawdown ladder thresholds.
    fn from_stress(stress: Decimal) -> Self {
        match DrawdownState::from_drawdown(stress) {
            DrawdownState::Normal => RiskLevel::Low,
            DrawdownState::Warning => RiskLevel::Medium,
            DrawdownState::Reduction => RiskLevel::High,
            DrawdownState::Emergency => RiskLevel::Critical,
            DrawdownState::Critical => RiskLevel::Emergency,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
            RiskLevel::Emergency => "EMERGENCY",
        }
    }
}

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
    Emergency,
}

/// Alert category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertKind {
    Exposure,
    Drawdown,
    Correlation,
    Liquidity,
    System,
}

/// A risk alert, also emitted as a JSON log line for pipeline consumption.
#[derive(Debug, Clone, Serialize)]
pub struct RiskAlert {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub level: AlertLevel,
    pub kind: AlertKind,
    pub message: String,
    pub data: serde_json::Value,
    pub acknowledged: bool,
}

impl RiskAlert {
    pub fn new(level: AlertLevel, kind: AlertKind, message: String, data: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            level,
            kind,
            message,
            data,
            acknowledged: false,
        }
    }

    /// Emit as structured log for workflow parsing.
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        match self.level {
            AlertLevel::Info => info!(target: "risk_alert", "RISK_ALERT: {}", json),
            AlertLevel::Warning => warn!(target: "risk_alert", "RISK_ALERT: {}", json),
            AlertLevel::Critical | AlertLevel::Emergency => {
                error!(target: "risk_alert", "RISK_ALERT: {}", json)
            }
        }
    }
}

/// Process-wide risk metrics, recomputed on every portfolio update.
#[derive(Debug, Clone, Serialize)]
pub struct RiskMetrics {
    pub portfolio_value: Decimal,
    pub total_exposure: Decimal,
    pub total_exposure_percent: Decimal,
    pub cash_reserves: Decimal,
    pub cash_reserves_percent: Decimal,
    pub max_drawdown: Decimal,
    pub current_drawdown: Decimal,
    pub drawdown_percent: Decimal,
    pub portfolio_high: Decimal,
    pub risk_level: RiskLevel,
    pub last_update: DateTime<Utc>,
}

impl RiskMetrics {
    fn empty(portfolio_high: Decimal) -> Self {
        Self {
            portfolio_value: Decimal::ZERO,
            total_exposure: Decimal::ZERO,
            total_exposure_percent: Decimal::ZERO,
            cash_reserves: Decimal::ZERO,
            cash_reserves_percent: Decimal::ZERO,
            max_drawdown: Decimal::ZERO,
            current_drawdown: Decimal::ZERO,
            drawdown_percent: Decimal::ZERO,
            portfolio_high,
            risk_level: RiskLevel::Low,
            last_update: Utc::now(),
        }
    }
}

/// Liquidity tier for a trade or position against the symbol's daily volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LiquidityRisk {
    Low,
    Medium,
    High,
}

impl LiquidityRisk {
    /// Tier a value against the symbol's 24 h volume: LOW under 2%,
    /// MEDIUM up to the configured order-size ceiling (5% by default),
    /// HIGH otherwise (including unknown volume).
    pub fn tier(value: Decimal, daily_volume: Option<Decimal>, high_ceiling: Decimal) -> Self {
        let Some(volume) = daily_volume.filter(|v| *v > Decimal::ZERO) else {
            return LiquidityRisk::High;
        };
        let share = value / volume;
        if share < LIQUIDITY_LOW_CEILING {
            LiquidityRisk::Low
        } else if share < high_ceiling {
            LiquidityRisk::Medium
        } else {
            LiquidityRisk::High
        }
    }
}

/// Input snapshot for one open position, passed by value on every update.
#[derive(Debug, Clone)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub size: Decimal,
    pub value: Decimal,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub stop_loss: Option<Decimal>,
}

/// Derived per-position risk.
#[derive(Debug, Clone, Serialize)]
pub struct PositionRisk {
    pub symbol: String,
    pub size: Decimal,
    pub value: Decimal,
    pub exposure_percent: Decimal,
    pub unrealized_pnl: Decimal,
    pub unrealized_pnl_percent: Decimal,
    pub stop_loss: Option<Decimal>,
    /// Value at risk below the stop: `max(0, value - stop_loss * size)`
    pub risk_amount: Decimal,
    pub liquidity_risk: LiquidityRisk,
    /// Highest pairwise correlation against the rest of the book, [0, 1]
    pub correlation_risk: f64,
}

/// Assessment attached to every gate decision.
#[derive(Debug, Clone, Serialize)]
pub struct TradeRiskAssessment {
    pub new_asset_exposure_percent: Decimal,
    pub new_total_exposure_percent: Decimal,
    pub resulting_cash_percent: Decimal,
    pub liquidity_risk: LiquidityRisk,
}

/// Gate decision for one prospective trade.
#[derive(Debug, Clone)]
pub struct RiskValidation {
    pub approved: bool,
    pub reason: Option<String>,
    /// Largest size that would pass, when the asset-exposure check fails
    pub max_allowed_size: Option<Decimal>,
    pub assessment: TradeRiskAssessment,
}

/// Append-only audit record written when the circuit breaker trips.
#[derive(Debug, Clone, Serialize)]
pub struct EmergencyStop {
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    pub drawdown_percent: Decimal,
    pub portfolio_high: Decimal,
    pub portfolio_value: Decimal,
}

/// Events published by the risk subsystem.
#[derive(Debug, Clone)]
pub enum RiskEvent {
    Alert(RiskAlert),
    Drawdown(DrawdownEvent),
    MetricsUpdated(RiskMetrics),
    EmergencyStopActivated { reason: String },
    EmergencyStopReset,
    LiquidationMandated,
}

/// Shared flag checked by the order pipeline before every submission.
#[derive(Clone, Default)]
pub struct EmergencyStopHandle {
    active: Arc<AtomicBool>,
}

impl EmergencyStopHandle {
    pub fn new() -> Self {
        Self {
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn activate(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    pub(crate) fn clear(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

struct RiskState {
    metrics: RiskMetrics,
    position_risks: HashMap<String, PositionRisk>,
    position_values: HashMap<String, Decimal>,
    drawdown: DrawdownTracker,
    correlation: CorrelationTracker,
    /// Edge-trigger latch for the portfolio exposure alert
    exposure_alerted: bool,
}

/// Portfolio risk state, pre-trade validation, drawdown protection and the
/// emergency-stop circuit breaker.
pub struct RiskManager {
    limits: RiskConfig,
    state: Mutex<RiskState>,
    store: Arc<dyn TradeStore>,
    market_data: Arc<SnapshotStore>,
    hub: EventHub<RiskEvent>,
    emergency: EmergencyStopHandle,
}

impl RiskManager {
    /// Build the risk manager, seeding the high-water mark from the store.
    pub fn new(
        limits: RiskConfig,
        store: Arc<dyn TradeStore>,
        market_data: Arc<SnapshotStore>,
    ) -> Self {
        let portfolio_high = match store.load_portfolio_high() {
            Ok(high) => high.unwrap_or(Decimal::ZERO),
            Err(e) => {
                warn!(error = %e, "failed to load portfolio high, starting fresh");
                Decimal::ZERO
            }
        };

        Self {
            limits,
            state: Mutex::new(RiskState {
                metrics: RiskMetrics::empty(portfolio_high),
                position_risks: HashMap::new(),
                position_values: HashMap::new(),
                drawdown: DrawdownTracker::new(portfolio_high),
                correlation: CorrelationTracker::new(),
                exposure_alerted: false,
            }),
            store,
            market_data,
            hub: EventHub::new("risk"),
            emergency: EmergencyStopHandle::new(),
        }
    }

    /// Register an event subscriber. Call before the loops start.
    pub fn subscribe_events(&mut self) -> mpsc::Receiver<RiskEvent> {
        self.hub.subscribe()
    }

    /// Handle shared with the order pipeline.
    pub fn emergency_handle(&self) -> EmergencyStopHandle {
        self.emergency.clone()
    }

    /// Current metrics snapshot.
    pub async fn metrics(&self) -> RiskMetrics {
        self.state.lock().await.metrics.clone()
    }

    /// Current per-position risk snapshot.
    pub async fn position_risks(&self) -> Vec<PositionRisk> {
        self.state.lock().await.position_risks.values().cloned().collect()
    }

    /// Multiplier applied to allowed position sizes by drawdown protection.
    pub async fn position_size_factor(&self) -> Decimal {
        self.state.lock().await.drawdown.position_size_factor()
    }

    /// Gate one prospective trade. Checks run in order; the first failure
    /// wins and is returned as the rejection reason.
    pub async fn validate_trade_risk(
        &self,
        symbol: &str,
        trade_size: Decimal,
        trade_value: Decimal,
    ) -> RiskValidation {
        let state = self.state.lock().await;

        let portfolio_value = state.metrics.portfolio_value;
        let existing_value = state
            .position_values
            .get(symbol)
            .copied()
            .unwrap_or(Decimal::ZERO);

        let new_asset_exposure = ratio(existing_value + trade_value, portfolio_value);
        let new_total_exposure =
            ratio(state.metrics.total_exposure + trade_value, portfolio_value);
        let resulting_cash =
            ratio(state.metrics.cash_reserves - trade_value, portfolio_value);
        let daily_volume = self.market_data.daily_volume(symbol);
        let liquidity_risk = LiquidityRisk::tier(
            trade_value,
            daily_volume,
            self.limits.max_order_volume_share,
        );

        let assessment = TradeRiskAssessment {
            new_asset_exposure_percent: new_asset_exposure,
            new_total_exposure_percent: new_total_exposure,
            resulting_cash_percent: resulting_cash,
            liquidity_risk,
        };

        let reject = |reason: String, max_allowed_size: Option<Decimal>| RiskValidation {
            approved: false,
            reason: Some(reason),
            max_allowed_size,
            assessment: assessment.clone(),
        };

        // 1. Circuit breaker.
        if self.emergency.is_active() {
            return reject("Emergency stop active".to_string(), None);
        }

        if portfolio_value <= Decimal::ZERO {
            return reject("Portfolio value unknown".to_string(), None);
        }

        // 2. Single-asset exposure cap, shrunk while drawdown protection
        //    has position reduction in force.
        let asset_cap = self.limits.max_single_asset_exposure
            * state.drawdown.position_size_factor();
        if new_asset_exposure > asset_cap {
            let allowed_value =
                (portfolio_value * asset_cap - existing_value).max(Decimal::ZERO);
            let max_allowed_size = if trade_value > Decimal::ZERO {
                Some(trade_size * allowed_value / trade_value)
            } else {
                None
            };
            return reject(
                format!(
                    "Asset exposure {:.2}% exceeds {:.2}% limit for {}",
                    new_asset_exposure * dec!(100),
                    asset_cap * dec!(100),
                    symbol
                ),
                max_allowed_size,
            );
        }

        // 3. Portfolio exposure cap.
        if new_total_exposure > self.limits.max_portfolio_exposure {
            return reject(
                format!(
                    "Total exposure {:.2}% exceeds {:.2}% limit",
                    new_total_exposure * dec!(100),
                    self.limits.max_portfolio_exposure * dec!(100)
                ),
                None,
            );
        }

        // 4. Cash reserve floor.
        if resulting_cash < self.limits.min_cash_reserves {
            return reject(
                format!(
                    "Cash reserves would fall to {:.2}%, floor is {:.2}%",
                    resulting_cash * dec!(100),
                    self.limits.min_cash_reserves * dec!(100)
                ),
                None,
            );
        }

        // 5. Liquidity: the symbol must clear the daily-volume floor and
        //    the trade must not dominate it.
        if daily_volume.unwrap_or(Decimal::ZERO) < self.limits.min_daily_volume {
            return reject(
                format!(
                    "Daily volume below {} floor for {}",
                    self.limits.min_daily_volume, symbol
                ),
                None,
            );
        }
        if liquidity_risk == LiquidityRisk::High {
            return reject(
                format!(
                    "Trade exceeds {:.0}% of daily volume for {}",
                    self.limits.max_order_volume_share * dec!(100),
                    symbol
                ),
                None,
            );
        }

        RiskValidation {
            approved: true,
            reason: None,
            max_allowed_size: None,
            assessment,
        }
    }

    /// Feed a consistent portfolio snapshot: recomputes the high-water
    /// mark, every position risk, the metrics, and runs threshold checks.
    pub async fn update_portfolio_value(
        &self,
        portfolio_value: Decimal,
        positions: Vec<PositionSnapshot>,
    ) {
        let mut events: Vec<RiskEvent> = Vec::new();

        {
            let mut state = self.state.lock().await;

            let previous_state = state.drawdown.state();
            let update = state.drawdown.update(portfolio_value);

            if let Some(crossed) = update.crossed_into {
                self.handle_drawdown_crossing(
                    &mut state,
                    previous_state,
                    crossed,
                    portfolio_value,
                    &mut events,
                );
            }

            for position in &positions {
                state
                    .correlation
                    .record_price(&position.symbol, position.current_price);
            }

            let total_exposure: Decimal = positions.iter().map(|p| p.value).sum();
            let symbols: Vec<String> = positions.iter().map(|p| p.symbol.clone()).collect();

            let mut position_risks = HashMap::new();
            let mut position_values = HashMap::new();
            for position in &positions {
                let cost_basis = position.entry_price * position.size;
                let unrealized = (position.current_price - position.entry_price) * position.size;
                let risk_amount = match position.stop_loss {
                    Some(stop) => (position.value - stop * position.size).max(Decimal::ZERO),
                    None => position.value,
                };

                position_values.insert(position.symbol.clone(), position.value);
                position_risks.insert(
                    position.symbol.clone(),
                    PositionRisk {
                        symbol: position.symbol.clone(),
                        size: position.size,
                        value: position.value,
                        exposure_percent: ratio(position.value, portfolio_value),
                        unrealized_pnl: unrealized,
                        unrealized_pnl_percent: ratio(unrealized, cost_basis) * dec!(100),
                        stop_loss: position.stop_loss,
                        risk_amount,
                        liquidity_risk: LiquidityRisk::tier(
                            position.value,
                            self.market_data.daily_volume(&position.symbol),
                            self.limits.max_order_volume_share,
                        ),
                        correlation_risk: state
                            .correlation
                            .max_correlation_for(&position.symbol, &symbols),
                    },
                );
            }
            state.position_risks = position_risks;
            state.position_values = position_values;

            let exposure_percent = ratio(total_exposure, portfolio_value);
            let cash_reserves = portfolio_value - total_exposure;

            let exposure_excess =
                (exposure_percent - self.limits.max_portfolio_exposure).max(Decimal::ZERO);
            let stress = update.drawdown_percent.max(exposure_excess);

            state.metrics = RiskMetrics {
                portfolio_value,
                total_exposure,
                total_exposure_percent: exposure_percent,
                cash_reserves,
                cash_reserves_percent: ratio(cash_reserves, portfolio_value),
                max_drawdown: state.drawdown.max_drawdown(),
                current_drawdown: state.drawdown.current_drawdown(),
                drawdown_percent: update.drawdown_percent,
                portfolio_high: state.drawdown.portfolio_high(),
                risk_level: RiskLevel::from_stress(stress),
                last_update: Utc::now(),
            };

            // Portfolio exposure alert, edge-triggered.
            if exposure_percent > self.limits.max_portfolio_exposure {
                if !state.exposure_alerted {
                    state.exposure_alerted = true;
                    let alert = RiskAlert::new(
                        AlertLevel::Critical,
                        AlertKind::Exposure,
                        format!(
                            "Portfolio exposure {:.2}% exceeds {:.2}% limit",
                            exposure_percent * dec!(100),
                            self.limits.max_portfolio_exposure * dec!(100)
                        ),
                        json!({ "exposure_percent": exposure_percent }),
                    );
                    alert.emit();
                    events.push(RiskEvent::Alert(alert));
                }
            } else {
                state.exposure_alerted = false;
            }

            // Correlation scan, off the pre-trade path.
            let exposures: Vec<(String, Decimal)> = positions
                .iter()
                .map(|p| (p.symbol.clone(), ratio(p.value, portfolio_value)))
                .collect();
            let ceiling = self.limits.max_correlation.to_f64().unwrap_or(0.80);
            for breach in
                state
                    .correlation
                    .scan(&exposures, CORRELATION_EXPOSURE_FLOOR, ceiling)
            {
                let alert = RiskAlert::new(
                    AlertLevel::Warning,
                    AlertKind::Correlation,
                    format!(
                        "Positions {} and {} are {:.2} correlated",
                        breach.symbol_a, breach.symbol_b, breach.correlation
                    ),
                    json!({
                        "symbol_a": breach.symbol_a,
                        "symbol_b": breach.symbol_b,
                        "correlation": breach.correlation,
                    }),
                );
                alert.emit();
                events.push(RiskEvent::Alert(alert));
            }

            self.persist_metrics(&state.metrics);
            events.push(RiskEvent::MetricsUpdated(state.metrics.clone()));
        }

        for event in events {
            self.hub.publish(event).await;
        }
    }

    /// React to one upward ladder crossing.
    fn handle_drawdown_crossing(
        &self,
        state: &mut RiskState,
        previous: DrawdownState,
        crossed: DrawdownState,
        portfolio_value: Decimal,
        events: &mut Vec<RiskEvent>,
    ) {
        let event = state.drawdown.build_event(previous, portfolio_value);

        let (level, message) = match crossed {
            DrawdownState::Warning => (
                AlertLevel::Warning,
                format!(
                    "Drawdown {:.2}% crossed the warning threshold",
                    event.drawdown_percent * dec!(100)
                ),
            ),
            DrawdownState::Reduction => (
                AlertLevel::Critical,
                format!(
                    "Drawdown {:.2}%: position sizes reduced by 25%",
                    event.drawdown_percent * dec!(100)
                ),
            ),
            DrawdownState::Emergency => (
                AlertLevel::Emergency,
                format!(
                    "Drawdown {:.2}%: emergency stop activated",
                    event.drawdown_percent * dec!(100)
                ),
            ),
            DrawdownState::Critical => (
                AlertLevel::Emergency,
                format!(
                    "Drawdown {:.2}%: emergency stop and full liquidation mandated",
                    event.drawdown_percent * dec!(100)
                ),
            ),
            DrawdownState::Normal => return,
        };

        let alert = RiskAlert::new(
            level,
            AlertKind::Drawdown,
            message,
            serde_json::to_value(&event).unwrap_or_default(),
        );
        alert.emit();
        events.push(RiskEvent::Alert(alert));

        if crossed >= DrawdownState::Reduction {
            let data = serde_json::to_value(&event).unwrap_or_default();
            let snapshot = serde_json::to_value(&state.metrics).unwrap_or_default();
            if let Err(e) = self.store.record_risk_event("drawdown", &data, &snapshot) {
                warn!(error = %e, "failed to persist drawdown event");
            }
            events.push(RiskEvent::Drawdown(event.clone()));
        }

        if crossed.blocks_trading() {
            self.activate_emergency_stop(
                state,
                format!("drawdown {:.2}%", event.drawdown_percent * dec!(100)),
                events,
            );
        }

        if crossed.mandates_liquidation() {
            warn!("CRITICAL drawdown: liquidation of all positions mandated");
            events.push(RiskEvent::LiquidationMandated);
        }
    }

    fn activate_emergency_stop(
        &self,
        state: &RiskState,
        reason: String,
        events: &mut Vec<RiskEvent>,
    ) {
        if self.emergency.is_active() {
            return;
        }

        // Logged synchronously before any further action.
        error!(%reason, "EMERGENCY STOP ACTIVATED");
        self.emergency.activate();

        let record = EmergencyStop {
            timestamp: Utc::now(),
            reason: reason.clone(),
            drawdown_percent: state.drawdown.drawdown_percent(),
            portfolio_high: state.drawdown.portfolio_high(),
            portfolio_value: state.metrics.portfolio_value,
        };
        let data = serde_json::to_value(&record).unwrap_or_default();
        let snapshot = serde_json::to_value(&state.metrics).unwrap_or_default();
        if let Err(e) = self
            .store
            .record_risk_event("emergency_stop", &data, &snapshot)
        {
            warn!(error = %e, "failed to persist emergency stop record");
        }

        events.push(RiskEvent::EmergencyStopActivated { reason });
    }

    /// Clear a latched emergency stop with the fixed confirmation token.
    pub async fn reset_emergency_stop(&self, token: &str) -> bool {
        let mut state = self.state.lock().await;
        if !state.drawdown.reset_emergency(token) {
            return false;
        }

        self.emergency.clear();
        let snapshot = serde_json::to_value(&state.metrics).unwrap_or_default();
        if let Err(e) =
            self.store
                .record_risk_event("emergency_stop_reset", &json!({}), &snapshot)
        {
            warn!(error = %e, "failed to persist emergency stop reset");
        }
        drop(state);

        self.hub.publish(RiskEvent::EmergencyStopReset).await;
        true
    }

    fn persist_metrics(&self, metrics: &RiskMetrics) {
        if let Err(e) = self
            .store
            .record_portfolio_value(metrics.last_update, metrics.portfolio_value)
        {
            warn!(error = %e, "failed to persist portfolio value");
        }

        let row = RiskMetricsRow {
            timestamp: metrics.last_update,
            portfolio_value: metrics.portfolio_value,
            total_exposure: metrics.total_exposure,
            cash_reserves: metrics.cash_reserves,
            max_drawdown: metrics.max_drawdown,
            current_drawdown: metrics.current_drawdown,
            drawdown_percent: metrics.drawdown_percent,
            portfolio_high: metrics.portfolio_high,
            risk_level: metrics.risk_level.as_str().to_string(),
        };
        if let Err(e) = self.store.record_risk_metrics(&row) {
            warn!(error = %e, "failed to persist risk metrics");
        }
    }

    /// Periodic risk evaluation: persists a metrics snapshot and logs the
    /// current level.
    pub async fn run_evaluation_loop(
        self: Arc<Self>,
        eval_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(eval_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let state = self.state.lock().await;
                    if state.metrics.portfolio_value > Decimal::ZERO {
                        self.persist_metrics(&state.metrics);
                    }
                    debug!(
                        risk_level = state.metrics.risk_level.as_str(),
                        drawdown = %state.metrics.drawdown_percent,
                        exposure = %state.metrics.total_exposure_percent,
                        "risk evaluation cycle"
                    );
                }
                _ = shutdown.changed() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::TickerData;
    use crate::persistence::MockStore;
    use crate::risk::drawdown::EMERGENCY_RESET_TOKEN;

    async fn manager_with_volume(daily_volume_usd: Decimal) -> RiskManager {
        let market_data = Arc::new(SnapshotStore::new(Duration::from_secs(60)));

        // VWAP 1 makes base volume equal quote volume.
        market_data
            .apply_ticker(TickerData {
                pair: "XBT/USD".to_string(),
                bid: dec!(0.9),
                ask: dec!(1.1),
                last: dec!(1),
                volume_24h: daily_volume_usd,
                vwap_24h: dec!(1),
                trade_count_24h: 10_000,
                open_24h: dec!(1),
                timestamp: Utc::now(),
            })
            .await;

        RiskManager::new(
            RiskConfig::default(),
            Arc::new(MockStore::new()),
            market_data,
        )
    }

    fn btc_position(value: Decimal) -> PositionSnapshot {
        PositionSnapshot {
            symbol: "XBT/USD".to_string(),
            size: value / dec!(50000),
            value,
            entry_price: dec!(50000),
            current_price: dec!(50000),
            stop_loss: None,
        }
    }

    #[tokio::test]
    async fn test_asset_exposure_rejection_returns_max_allowed_size() {
        let manager = manager_with_volume(dec!(10_000_000)).await;
        manager
            .update_portfolio_value(dec!(100000), vec![btc_position(dec!(4500))])
            .await;

        // $1,000 more of BTC at $50,000: size 0.02.
        let result = manager
            .validate_trade_risk("XBT/USD", dec!(0.02), dec!(1000))
            .await;

        assert!(!result.approved);
        assert!(result.reason.unwrap().contains("Asset exposure"));
        // $500 of headroom corresponds to size 0.01.
        assert_eq!(result.max_allowed_size, Some(dec!(0.01)));
        assert_eq!(result.assessment.new_asset_exposure_percent, dec!(0.055));
    }

    #[tokio::test]
    async fn test_approval_under_all_limits() {
        let manager = manager_with_volume(dec!(10_000_000)).await;
        manager
            .update_portfolio_value(dec!(100000), vec![btc_position(dec!(2000))])
            .await;

        let result = manager
            .validate_trade_risk("XBT/USD", dec!(0.02), dec!(1000))
            .await;
        assert!(result.approved, "rejected: {:?}", result.reason);
        assert_eq!(result.assessment.liquidity_risk, LiquidityRisk::Low);
    }

    #[tokio::test]
    async fn test_validation_is_monotone_in_exposure() {
        let manager = manager_with_volume(dec!(10_000_000)).await;

        let mut rejected_at: Option<Decimal> = None;
        for existing in [dec!(1000), dec!(3000), dec!(4500), dec!(4900), dec!(6000)] {
            manager
                .update_portfolio_value(dec!(100000), vec![btc_position(existing)])
                .await;
            let result = manager
                .validate_trade_risk("XBT/USD", dec!(0.02), dec!(1000))
                .await;

            if let Some(threshold) = rejected_at {
                assert!(
                    !result.approved,
                    "trade approved at exposure {existing} after rejection at {threshold}"
                );
            } else if !result.approved {
                rejected_at = Some(existing);
            }
        }
        assert!(rejected_at.is_some());
    }

    #[tokio::test]
    async fn test_low_volume_symbol_is_rejected() {
        // $500k daily volume is under the $1M floor.
        let manager = manager_with_volume(dec!(500_000)).await;
        manager
            .update_portfolio_value(dec!(100000), vec![])
            .await;

        let result = manager
            .validate_trade_risk("XBT/USD", dec!(0.02), dec!(1000))
            .await;
        assert!(!result.approved);
        assert!(result.reason.unwrap().contains("Daily volume"));
    }

    #[tokio::test]
    async fn test_oversized_trade_hits_liquidity_gate() {
        let manager = manager_with_volume(dec!(10_000_000)).await;
        // Large portfolio so the exposure checks pass.
        manager
            .update_portfolio_value(dec!(100_000_000), vec![])
            .await;

        // $600k on $10M daily volume is 6% - HIGH.
        let result = manager
            .validate_trade_risk("XBT/USD", dec!(12), dec!(600_000))
            .await;
        assert!(!result.approved);
        assert_eq!(result.assessment.liquidity_risk, LiquidityRisk::High);
    }

    #[tokio::test]
    async fn test_drawdown_ladder_activates_and_resets_emergency_stop() {
        let manager = manager_with_volume(dec!(10_000_000)).await;

        manager.update_portfolio_value(dec!(100000), vec![]).await;
        manager.update_portfolio_value(dec!(94000), vec![]).await;
        assert!(!manager.emergency_handle().is_active());

        manager.update_portfolio_value(dec!(89000), vec![]).await;
        assert!(!manager.emergency_handle().is_active());
        assert_eq!(manager.position_size_factor().await, dec!(0.75));

        manager.update_portfolio_value(dec!(84000), vec![]).await;
        assert!(manager.emergency_handle().is_active());

        let result = manager
            .validate_trade_risk("XBT/USD", dec!(0.01), dec!(500))
            .await;
        assert_eq!(result.reason.as_deref(), Some("Emergency stop active"));

        assert!(!manager.reset_emergency_stop("WRONG_TOKEN").await);
        assert!(manager.emergency_handle().is_active());

        assert!(manager.reset_emergency_stop(EMERGENCY_RESET_TOKEN).await);
        assert!(!manager.emergency_handle().is_active());
    }

    #[tokio::test]
    async fn test_metrics_identity_and_monotone_high() {
        let manager = manager_with_volume(dec!(10_000_000)).await;

        manager
            .update_portfolio_value(dec!(100000), vec![btc_position(dec!(30000))])
            .await;
        let metrics = manager.metrics().await;
        assert_eq!(
            metrics.total_exposure + metrics.cash_reserves,
            metrics.portfolio_value
        );
        assert_eq!(metrics.portfolio_high, dec!(100000));

        manager
            .update_portfolio_value(dec!(90000), vec![btc_position(dec!(30000))])
            .await;
        let metrics = manager.metrics().await;
        // High-water mark holds through the drawdown.
        assert_eq!(metrics.portfolio_high, dec!(100000));
        assert_eq!(metrics.current_drawdown, dec!(10000));
        assert_eq!(metrics.drawdown_percent, dec!(0.1));
    }

    #[tokio::test]
    async fn test_correlation_alert_fires_once_per_crossing() {
        let manager = manager_with_volume(dec!(10_000_000)).await;

        // Seed strongly correlated return windows.
        {
            let mut state = manager.state.lock().await;
            let base: Vec<f64> = (0..40)
                .map(|i| ((i * 37 % 97) as f64 - 48.0) / 480.0)
                .collect();
            state.correlation.seed_returns("XBT/USD", base.clone());
            state.correlation.seed_returns("ETH/USD", base);
        }

        let mut manager = manager;
        let mut events = manager.subscribe_events();

        let positions = vec![
            btc_position(dec!(4000)),
            PositionSnapshot {
                symbol: "ETH/USD".to_string(),
                size: dec!(1),
                value: dec!(3000),
                entry_price: dec!(3000),
                current_price: dec!(3000),
                stop_loss: None,
            },
        ];

        manager
            .update_portfolio_value(dec!(100000), positions.clone())
            .await;

        let mut correlation_alerts = 0;
        while let Ok(event) = events.try_recv() {
            if let RiskEvent::Alert(alert) = event {
                if alert.kind == AlertKind::Correlation {
                    correlation_alerts += 1;
                }
            }
        }
        assert_eq!(correlation_alerts, 1);

        // Repeating the identical update produces no duplicate alert.
        manager
            .update_portfolio_value(dec!(100000), positions)
            .await;
        while let Ok(event) = events.try_recv() {
            if let RiskEvent::Alert(alert) = event {
                assert_ne!(alert.kind, AlertKind::Correlation);
            }
        }
    }
}
