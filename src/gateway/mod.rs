//! Execution gateway.
//!
//! Thin facade in front of the order pipeline: every strategy signal is
//! risk-validated before submission, and every resulting fill is fed back
//! to the grid engine (by grid level) and to the risk manager through its
//! portfolio-value update side-channel.

use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::error::TradingError;
use crate::exchange::{ExchangeClient, OrderKind, OrderSide};
use crate::grid::GridStateManager;
use crate::market_data::SnapshotStore;
use crate::orders::{OrderEvent, OrderManager, OrderMetadata, OrderReceipt, OrderRecord, OrderRequest};
use crate::risk::{PositionSnapshot, RiskEvent, RiskManager};

/// One strategy request to trade.
#[derive(Debug, Clone)]
pub struct TradeSignal {
    pub trading_pair: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub grid_level: Option<i64>,
    pub is_profit_taking: bool,
}

/// Gate-plus-submission outcome for one signal.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub approved: bool,
    pub reason: Option<String>,
    pub max_allowed_size: Option<Decimal>,
    pub receipt: Option<OrderReceipt>,
}

/// Net position per pair, maintained from the fill stream.
#[derive(Debug, Clone, Default)]
struct BookPosition {
    size: Decimal,
    entry_price: Decimal,
}

/// Applies the risk gate before every submission and routes fills back
/// into the grid and risk subsystems.
pub struct ExecutionGateway {
    risk: Arc<RiskManager>,
    orders: Arc<OrderManager>,
    grid: Arc<GridStateManager>,
    market_data: Arc<SnapshotStore>,
    exchange: Arc<dyn ExchangeClient>,
    book: Mutex<HashMap<String, BookPosition>>,
}

impl ExecutionGateway {
    pub fn new(
        risk: Arc<RiskManager>,
        orders: Arc<OrderManager>,
        grid: Arc<GridStateManager>,
        market_data: Arc<SnapshotStore>,
        exchange: Arc<dyn ExchangeClient>,
    ) -> Self {
        Self {
            risk,
            orders,
            grid,
            market_data,
            exchange,
            book: Mutex::new(HashMap::new()),
        }
    }

    /// Risk-validate and submit one strategy signal.
    pub async fn execute_signal(&self, signal: TradeSignal) -> Result<ExecutionResult, TradingError> {
        let reference_price = signal
            .price
            .or_else(|| self.market_data.last_price(&signal.trading_pair))
            .ok_or_else(|| {
                TradingError::Validation(format!(
                    "no price available for {}",
                    signal.trading_pair
                ))
            })?;
        let trade_value = signal.quantity * reference_price;

        let validation = self
            .risk
            .validate_trade_risk(&signal.trading_pair, signal.quantity, trade_value)
            .await;

        if !validation.approved {
            info!(
                pair = %signal.trading_pair,
                reason = validation.reason.as_deref().unwrap_or("unspecified"),
                "signal rejected by risk gate"
            );
            return Ok(ExecutionResult {
                approved: false,
                reason: validation.reason,
                max_allowed_size: validation.max_allowed_size,
                receipt: None,
            });
        }

        let receipt = self
            .orders
            .place_order(OrderRequest {
                trading_pair: signal.trading_pair.clone(),
                side: signal.side,
                kind: signal.kind,
                quantity: signal.quantity,
                price: signal.price,
                strategy_id: Some("grid".to_string()),
                grid_level: signal.grid_level,
                profit_target: None,
                stop_loss: None,
                metadata: OrderMetadata {
                    is_profit_taking: signal.is_profit_taking,
                    note: None,
                },
            })
            .await?;

        Ok(ExecutionResult {
            approved: true,
            reason: None,
            max_allowed_size: None,
            receipt: Some(receipt),
        })
    }

    /// Consume the order pipeline's event stream, feeding fills back into
    /// the grid engine and refreshing the risk manager's portfolio view.
    pub async fn run_fill_pump(
        self: Arc<Self>,
        mut events: mpsc::Receiver<OrderEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(OrderEvent::OrderFilled { order, .. }) => {
                        self.on_fill(&order).await;
                    }
                    Some(OrderEvent::OrderRecordingError { external_order_id, error }) => {
                        warn!(
                            external_order_id,
                            error,
                            "unrecorded live order, manual reconciliation required"
                        );
                    }
                    Some(_) => {}
                    None => {
                        debug!("order event stream ended");
                        return;
                    }
                },
                _ = shutdown.changed() => return,
            }
        }
    }

    /// Consume the risk subsystem's event stream. A liquidation mandate
    /// cancels every open order immediately; position closure is left to
    /// the operator, who sees the emergency alerts.
    pub async fn run_risk_pump(
        self: Arc<Self>,
        mut events: mpsc::Receiver<RiskEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(RiskEvent::LiquidationMandated) => {
                        warn!("liquidation mandated, cancelling all open orders");
                        let report = self.orders.cancel_all_orders().await;
                        info!(
                            cancelled = report.cancelled.len(),
                            failed = report.failures.len(),
                            "open orders cancelled under liquidation mandate"
                        );
                    }
                    Some(RiskEvent::EmergencyStopActivated { reason }) => {
                        warn!(%reason, "emergency stop active, new orders are blocked");
                    }
                    Some(_) => {}
                    None => return,
                },
                _ = shutdown.changed() => return,
            }
        }
    }

    async fn on_fill(&self, order: &OrderRecord) {
        if let Some(level) = order.grid_level {
            let fill_price = order
                .average_fill_price
                .or(order.price)
                .unwrap_or_default();
            self.grid
                .on_order_filled(&order.trading_pair, level as u32, fill_price)
                .await;
        }

        self.apply_fill_to_book(order).await;
        if let Err(e) = self.refresh_portfolio().await {
            warn!(error = %e, "portfolio refresh after fill failed");
        }
    }

    /// Update the net per-pair position book from one terminal fill.
    async fn apply_fill_to_book(&self, order: &OrderRecord) {
        let fill_price = order
            .average_fill_price
            .or(order.price)
            .unwrap_or_default();
        let mut book = self.book.lock().await;
        let position = book.entry(order.trading_pair.clone()).or_default();

        match order.order_type {
            OrderSide::Buy => {
                let new_size = position.size + order.filled_quantity;
                if new_size > Decimal::ZERO {
                    // Weighted-average entry across the combined size.
                    position.entry_price = (position.entry_price * position.size
                        + fill_price * order.filled_quantity)
                        / new_size;
                }
                position.size = new_size;
            }
            OrderSide::Sell => {
                position.size -= order.filled_quantity;
                if position.size <= Decimal::ZERO {
                    position.size = Decimal::ZERO;
                    position.entry_price = Decimal::ZERO;
                }
            }
        }
    }

    /// Recompute the portfolio value from cash plus marked positions and
    /// hand the risk manager a consistent snapshot.
    pub async fn refresh_portfolio(&self) -> Result<(), TradingError> {
        let balances = self.exchange.get_account_balance().await?;
        let cash = balances
            .get("USD")
            .or_else(|| balances.get("ZUSD"))
            .copied()
            .unwrap_or(Decimal::ZERO);

        let book = self.book.lock().await;
        let mut positions = Vec::new();
        let mut exposure = Decimal::ZERO;
        for (pair, position) in book.iter() {
            if position.size <= Decimal::ZERO {
                continue;
            }
            let current_price = self
                .market_data
                .last_price(pair)
                .unwrap_or(position.entry_price);
            let value = position.size * current_price;
            exposure += value;
            positions.push(PositionSnapshot {
                symbol: pair.clone(),
                size: position.size,
                value,
                entry_price: position.entry_price,
                current_price,
                stop_loss: None,
            });
        }
        drop(book);

        let portfolio_value = cash + exposure;
        self.risk
            .update_portfolio_value(portfolio_value, positions)
            .await;
        Ok(())
    }
}
