//! Order management service.
//!
//! Owns the canonical order records and the mapping between internal and
//! exchange order ids. Every submission passes the emergency-stop gate,
//! the venue validator, and is persisted before being monitored by the
//! status-sync loop. Fills fan out profit distributions and accounting
//! events to the rest of the system.

use rust_decimal::Decimal;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::TradingError;
use crate::exchange::{ExchangeClient, NewOrderRequest, OpenOrderInfo, OrderSide};
use crate::persistence::{ProfitDistributionRow, TradeStore};
use crate::risk::EmergencyStopHandle;
use crate::utils::events::EventHub;

use super::types::*;

struct OrderBookState {
    /// Canonical records keyed by internal id
    orders: HashMap<String, OrderRecord>,
    /// External id -> internal id
    by_external: HashMap<String, String>,
}

/// Canonical order record owner and exchange reconciliation driver.
pub struct OrderManager {
    exchange: Arc<dyn ExchangeClient>,
    store: Arc<dyn TradeStore>,
    hub: EventHub<OrderEvent>,
    emergency: EmergencyStopHandle,
    reinvestment_percent: Decimal,
    request_timeout: Duration,
    state: Mutex<OrderBookState>,
}

impl OrderManager {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        store: Arc<dyn TradeStore>,
        emergency: EmergencyStopHandle,
        reinvestment_percent: Decimal,
        request_timeout: Duration,
    ) -> Self {
        Self {
            exchange,
            store,
            hub: EventHub::new("orders"),
            emergency,
            reinvestment_percent,
            request_timeout,
            state: Mutex::new(OrderBookState {
                orders: HashMap::new(),
                by_external: HashMap::new(),
            }),
        }
    }

    /// Register an event subscriber. Call before the loops start.
    pub fn subscribe_events(&mut self) -> mpsc::Receiver<OrderEvent> {
        self.hub.subscribe()
    }

    /// Current record for an internal order id.
    pub async fn order(&self, order_id: &str) -> Option<OrderRecord> {
        self.state.lock().await.orders.get(order_id).cloned()
    }

    /// Resolve an exchange order id to the canonical record.
    pub async fn order_by_external_id(&self, external_order_id: &str) -> Option<OrderRecord> {
        let state = self.state.lock().await;
        let order_id = state.by_external.get(external_order_id)?;
        state.orders.get(order_id).cloned()
    }

    /// All records currently in an open status.
    pub async fn open_orders(&self) -> Vec<OrderRecord> {
        self.state
            .lock()
            .await
            .orders
            .values()
            .filter(|record| record.status.is_open())
            .cloned()
            .collect()
    }

    /// Apply the external-call deadline to a client future.
    async fn with_deadline<T, F>(&self, operation: &str, fut: F) -> Result<T, TradingError>
    where
        F: Future<Output = Result<T, TradingError>>,
    {
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(TradingError::Timeout {
                operation: operation.to_string(),
                seconds: self.request_timeout.as_secs(),
            }),
        }
    }

    /// Validate, submit and record one order.
    pub async fn place_order(&self, request: OrderRequest) -> Result<OrderReceipt, TradingError> {
        let started = std::time::Instant::now();

        // 1. Circuit breaker.
        if self.emergency.is_active() {
            return Err(TradingError::Validation("Emergency stop active".into()));
        }

        if request.quantity <= Decimal::ZERO {
            return Err(TradingError::Validation("quantity must be positive".into()));
        }

        // 2. Exchange-shaped request.
        let order_id = Uuid::new_v4().to_string();
        let mut exchange_request = NewOrderRequest {
            pair: request.trading_pair.clone(),
            side: request.side,
            kind: request.kind,
            volume: request.quantity,
            price: request.price,
            client_ref: Some(order_id.clone()),
        };

        // 3. Venue validation; adjusted values must be applied.
        let validation = self
            .with_deadline("validate_order", self.exchange.validate_order(&exchange_request))
            .await?;
        if !validation.valid {
            return Err(TradingError::Validation(
                validation
                    .reason
                    .unwrap_or_else(|| "order rejected by validator".to_string()),
            ));
        }
        if let Some(price) = validation.adjusted_price {
            debug!(order_id, %price, "price adjusted to tick size");
            exchange_request.price = Some(price);
        }
        if let Some(quantity) = validation.adjusted_quantity {
            debug!(order_id, %quantity, "quantity adjusted to lot step");
            exchange_request.volume = quantity;
        }

        // 4. Submit.
        let placed = self
            .with_deadline("place_order", self.exchange.place_order(&exchange_request))
            .await?;

        info!(
            order_id,
            external_order_id = %placed.external_order_id,
            pair = %request.trading_pair,
            side = ?request.side,
            quantity = %exchange_request.volume,
            "order placed"
        );

        // 5. Persist the canonical record.
        let mut record = OrderRecord::from_request(order_id.clone(), &request);
        record.quantity = exchange_request.volume;
        record.price = exchange_request.price;
        record.external_order_id = Some(placed.external_order_id.clone());

        if let Err(e) = self.store.save_order(&record.to_row()) {
            // The order is live on the exchange but unrecorded. Surface it
            // for manual reconciliation; the next sync cycle re-checks it.
            error!(
                order_id,
                external_order_id = %placed.external_order_id,
                error = %e,
                "order placed but not recorded"
            );
            self.hub
                .publish(OrderEvent::OrderRecordingError {
                    external_order_id: placed.external_order_id.clone(),
                    error: e.to_string(),
                })
                .await;
        }

        // 6. Cache and announce.
        {
            let mut state = self.state.lock().await;
            state
                .by_external
                .insert(placed.external_order_id.clone(), order_id.clone());
            state.orders.insert(order_id.clone(), record.clone());
        }
        self.hub.publish(OrderEvent::OrderPlaced { order: record }).await;

        Ok(OrderReceipt {
            order_id,
            external_order_id: placed.external_order_id,
            execution_time_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Cancel one order on the exchange, then update the record.
    pub async fn cancel_order(&self, order_id: &str) -> Result<(), TradingError> {
        let external_order_id = {
            let state = self.state.lock().await;
            let record = state.orders.get(order_id).ok_or_else(|| {
                TradingError::Consistency(format!("unknown order id {order_id}"))
            })?;
            if !record.status.is_open() {
                return Err(TradingError::Validation(format!(
                    "order {order_id} is not open"
                )));
            }
            record.external_order_id.clone().ok_or_else(|| {
                TradingError::Consistency(format!("order {order_id} has no external id"))
            })?
        };

        self.with_deadline(
            "cancel_order",
            self.exchange.cancel_order(&external_order_id),
        )
        .await?;

        {
            let mut state = self.state.lock().await;
            if let Some(record) = state.orders.get_mut(order_id) {
                record.status = OrderStatus::Cancelled;
                record.updated_at = chrono::Utc::now();
                if let Err(e) = self.store.save_order(&record.to_row()) {
                    warn!(order_id, error = %e, "failed to persist cancellation");
                }
            }
        }

        self.hub
            .publish(OrderEvent::OrderCancelled {
                order_id: order_id.to_string(),
            })
            .await;
        Ok(())
    }

    /// Cancel every open order, collecting per-order failures.
    pub async fn cancel_all_orders(&self) -> CancelAllReport {
        let open: Vec<String> = self
            .open_orders()
            .await
            .into_iter()
            .map(|record| record.id)
            .collect();

        let mut report = CancelAllReport::default();
        for order_id in open {
            match self.cancel_order(&order_id).await {
                Ok(()) => report.cancelled.push(order_id),
                Err(e) => report.failures.push((order_id, e.to_string())),
            }
        }

        if !report.failures.is_empty() {
            warn!(
                cancelled = report.cancelled.len(),
                failed = report.failures.len(),
                "cancel-all completed with failures"
            );
        }
        report
    }

    /// One status-synchronization cycle.
    ///
    /// Internal open orders absent from the exchange's open set are
    /// resolved through a terminal status query; the exchange is ground
    /// truth for any disagreement.
    pub async fn sync_order_statuses(&self) -> Result<(), TradingError> {
        let open_records = self.open_orders().await;
        if open_records.is_empty() {
            return Ok(());
        }

        let exchange_open = self
            .with_deadline("get_open_orders", self.exchange.get_open_orders())
            .await?;

        for record in open_records {
            let Some(external_order_id) = record.external_order_id.clone() else {
                warn!(
                    order_id = %record.id,
                    "open order with no external id, skipping until reconciled"
                );
                continue;
            };

            if let Some(info) = exchange_open.get(&external_order_id) {
                // Still open; pick up partial fills.
                self.apply_exchange_info(&record.id, info).await;
                continue;
            }

            // Absent from the open set: query the terminal status.
            match self
                .with_deadline(
                    "get_order_status",
                    self.exchange.get_order_status(&external_order_id),
                )
                .await
            {
                Ok(Some(info)) => self.apply_exchange_info(&record.id, &info).await,
                Ok(None) => {
                    // The venue has no record at all; trust it and close
                    // out ours.
                    warn!(
                        order_id = %record.id,
                        external_order_id,
                        "order unknown to exchange, marking cancelled"
                    );
                    let mut state = self.state.lock().await;
                    if let Some(record) = state.orders.get_mut(&record.id) {
                        record.status = OrderStatus::Cancelled;
                        record.updated_at = chrono::Utc::now();
                        if let Err(e) = self.store.save_order(&record.to_row()) {
                            warn!(error = %e, "failed to persist reconciled order");
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        order_id = %record.id,
                        error = %e,
                        "status query failed, retrying next cycle"
                    );
                }
            }
        }

        Ok(())
    }

    /// Apply one exchange-side order view to the canonical record.
    async fn apply_exchange_info(&self, order_id: &str, info: &OpenOrderInfo) {
        let filled_transition = {
            let mut state = self.state.lock().await;
            let Some(record) = state.orders.get_mut(order_id) else {
                warn!(order_id, "record disappeared during sync");
                return;
            };

            let new_status = OrderStatus::from_exchange(info.status);
            let was_filled = record.status == OrderStatus::Filled;

            let changed = record.status != new_status
                || record.filled_quantity != info.volume_executed
                || record.fees != info.fee;
            if !changed {
                return;
            }

            record.status = new_status;
            record.filled_quantity = info.volume_executed;
            record.average_fill_price = info.average_price;
            record.fees = info.fee;
            record.updated_at = chrono::Utc::now();

            if let Err(e) = self.store.save_order(&record.to_row()) {
                warn!(order_id, error = %e, "failed to persist status update");
            }

            (!was_filled && new_status == OrderStatus::Filled).then(|| record.clone())
        };

        if let Some(record) = filled_transition {
            self.handle_filled_order(record).await;
        }
    }

    /// React to a terminal fill: distribute profit-taking proceeds and
    /// emit the accounting payload.
    async fn handle_filled_order(&self, record: OrderRecord) {
        let average_price = record.average_fill_price.unwrap_or_default();
        let net_proceeds = record.filled_quantity * average_price - record.fees;

        if record.order_type == OrderSide::Sell && record.metadata.is_profit_taking {
            let distribution = ProfitDistribution::split(
                record.id.clone(),
                net_proceeds,
                self.reinvestment_percent,
                record.grid_level,
            );

            info!(
                order_id = %record.id,
                total = %distribution.total_proceeds,
                reinvestment = %distribution.reinvestment,
                extraction = %distribution.extraction,
                "profit distributed"
            );

            if let Err(e) = self.store.record_profit_distribution(&ProfitDistributionRow {
                order_id: distribution.order_id.clone(),
                total_proceeds: distribution.total_proceeds,
                reinvestment_amount: distribution.reinvestment,
                profit_extraction: distribution.extraction,
                grid_level: distribution.grid_level,
                timestamp: distribution.timestamp,
            }) {
                warn!(error = %e, "failed to persist profit distribution");
            }

            self.hub
                .publish(OrderEvent::ProfitDistributed(distribution))
                .await;
        }

        info!(
            order_id = %record.id,
            pair = %record.trading_pair,
            side = ?record.order_type,
            filled = %record.filled_quantity,
            avg_price = %average_price,
            fees = %record.fees,
            "order filled"
        );

        self.hub
            .publish(OrderEvent::OrderFilled {
                order: record,
                net_proceeds,
            })
            .await;
    }

    /// Periodic status synchronization. Cycles run to completion before
    /// the next one starts.
    pub async fn run_sync_loop(
        self: Arc<Self>,
        sync_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(sync_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sync_order_statuses().await {
                        warn!(error = %e, "order status sync failed");
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{MockExchangeClient, OrderKind};
    use crate::persistence::{MockStore, MockTradeStore};
    use rust_decimal_macros::dec;

    fn manager_with(exchange: Arc<MockExchangeClient>) -> OrderManager {
        OrderManager::new(
            exchange,
            Arc::new(MockStore::new()),
            EmergencyStopHandle::new(),
            dec!(70),
            Duration::from_secs(30),
        )
    }

    fn grid_sell(price: Decimal, quantity: Decimal, profit_taking: bool) -> OrderRequest {
        OrderRequest {
            trading_pair: "XBT/USD".to_string(),
            side: OrderSide::Sell,
            kind: OrderKind::Limit,
            quantity,
            price: Some(price),
            strategy_id: Some("grid".to_string()),
            grid_level: Some(5),
            profit_target: None,
            stop_loss: None,
            metadata: OrderMetadata {
                is_profit_taking: profit_taking,
                note: None,
            },
        }
    }

    #[tokio::test]
    async fn test_place_order_records_and_announces() {
        let exchange = Arc::new(MockExchangeClient::new(dec!(100000)));
        let mut manager = manager_with(exchange.clone());
        let mut events = manager.subscribe_events();

        let receipt = manager
            .place_order(OrderRequest::limit(
                "XBT/USD",
                OrderSide::Buy,
                dec!(0.1),
                dec!(50000),
            ))
            .await
            .unwrap();

        let record = manager.order(&receipt.order_id).await.unwrap();
        assert_eq!(record.status, OrderStatus::Pending);
        assert_eq!(record.filled_quantity, Decimal::ZERO);
        assert_eq!(record.fees, Decimal::ZERO);
        assert_eq!(
            record.external_order_id.as_deref(),
            Some(receipt.external_order_id.as_str())
        );

        // The external-id mapping resolves back to the same record.
        let by_external = manager
            .order_by_external_id(&receipt.external_order_id)
            .await
            .unwrap();
        assert_eq!(by_external.id, receipt.order_id);

        match events.recv().await {
            Some(OrderEvent::OrderPlaced { order }) => assert_eq!(order.id, receipt.order_id),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_emergency_stop_blocks_placement() {
        let exchange = Arc::new(MockExchangeClient::new(dec!(100000)));
        let emergency = EmergencyStopHandle::new();
        let manager = OrderManager::new(
            exchange,
            Arc::new(MockStore::new()),
            emergency.clone(),
            dec!(70),
            Duration::from_secs(30),
        );

        emergency.activate();

        let result = manager
            .place_order(OrderRequest::limit(
                "XBT/USD",
                OrderSide::Buy,
                dec!(0.1),
                dec!(50000),
            ))
            .await;
        match result {
            Err(TradingError::Validation(reason)) => {
                assert_eq!(reason, "Emergency stop active")
            }
            other => panic!("expected validation rejection, got {other:?}"),
        }

        emergency.clear();
        assert!(manager
            .place_order(OrderRequest::limit(
                "XBT/USD",
                OrderSide::Buy,
                dec!(0.1),
                dec!(50000)
            ))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_validator_adjustments_are_applied() {
        let exchange = Arc::new(MockExchangeClient::new(dec!(100000)));
        let manager = manager_with(exchange.clone());

        let receipt = manager
            .place_order(OrderRequest::limit(
                "XBT/USD",
                OrderSide::Buy,
                dec!(0.123456789),
                dec!(50000.07),
            ))
            .await
            .unwrap();

        let record = manager.order(&receipt.order_id).await.unwrap();
        assert_eq!(record.price, Some(dec!(50000.1)));
        assert_eq!(record.quantity, dec!(0.12345678));
    }

    #[tokio::test]
    async fn test_sync_detects_fill_and_distributes_profit() {
        let exchange = Arc::new(MockExchangeClient::new(dec!(100000)));
        let mut manager = manager_with(exchange.clone());
        let mut events = manager.subscribe_events();

        let receipt = manager
            .place_order(grid_sell(dec!(105), dec!(2), true))
            .await
            .unwrap();

        // drain the placement event
        let _ = events.recv().await;

        // Fill on the venue at 105 with the mock fee, then let the sync
        // loop discover it by absence from the open set.
        exchange
            .fill_order(&receipt.external_order_id, dec!(105))
            .await;
        manager.sync_order_statuses().await.unwrap();

        let record = manager.order(&receipt.order_id).await.unwrap();
        assert_eq!(record.status, OrderStatus::Filled);
        assert_eq!(record.filled_quantity, dec!(2));
        assert!(record.invariants_hold());

        let mut saw_distribution = false;
        let mut saw_fill = false;
        while let Ok(event) = events.try_recv() {
            match event {
                OrderEvent::ProfitDistributed(distribution) => {
                    saw_distribution = true;
                    // net = 2 * 105 - fee; the 70/30 legs sum exactly.
                    assert_eq!(
                        distribution.reinvestment + distribution.extraction,
                        distribution.total_proceeds
                    );
                    assert_eq!(
                        distribution.reinvestment,
                        distribution.total_proceeds * dec!(0.70)
                    );
                }
                OrderEvent::OrderFilled { order, .. } => {
                    saw_fill = true;
                    assert_eq!(order.id, receipt.order_id);
                }
                _ => {}
            }
        }
        assert!(saw_distribution);
        assert!(saw_fill);
    }

    #[tokio::test]
    async fn test_plain_sell_fill_does_not_distribute() {
        let exchange = Arc::new(MockExchangeClient::new(dec!(100000)));
        let mut manager = manager_with(exchange.clone());
        let mut events = manager.subscribe_events();

        let receipt = manager
            .place_order(grid_sell(dec!(105), dec!(2), false))
            .await
            .unwrap();
        exchange
            .fill_order(&receipt.external_order_id, dec!(105))
            .await;
        manager.sync_order_statuses().await.unwrap();

        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, OrderEvent::ProfitDistributed(_)));
        }
    }

    #[tokio::test]
    async fn test_sync_is_idempotent() {
        let exchange = Arc::new(MockExchangeClient::new(dec!(100000)));
        let manager = manager_with(exchange.clone());

        let receipt = manager
            .place_order(grid_sell(dec!(105), dec!(2), false))
            .await
            .unwrap();
        exchange
            .fill_order(&receipt.external_order_id, dec!(105))
            .await;

        manager.sync_order_statuses().await.unwrap();
        let first = manager.order(&receipt.order_id).await.unwrap();

        // No venue change: a second cycle leaves the record set unchanged.
        manager.sync_order_statuses().await.unwrap();
        let second = manager.order(&receipt.order_id).await.unwrap();

        assert_eq!(first.status, second.status);
        assert_eq!(first.filled_quantity, second.filled_quantity);
        assert_eq!(first.updated_at, second.updated_at);
    }

    #[tokio::test]
    async fn test_cancel_all_reports_partial_failures() {
        let exchange = Arc::new(MockExchangeClient::new(dec!(100000)));
        let manager = manager_with(exchange.clone());

        let a = manager
            .place_order(OrderRequest::limit("XBT/USD", OrderSide::Buy, dec!(0.1), dec!(49000)))
            .await
            .unwrap();
        let b = manager
            .place_order(OrderRequest::limit("XBT/USD", OrderSide::Buy, dec!(0.1), dec!(48000)))
            .await
            .unwrap();

        // Fill B on the venue without telling the manager: its cancel will
        // fail venue-side while A cancels cleanly.
        exchange.fill_order(&b.external_order_id, dec!(48000)).await;

        let report = manager.cancel_all_orders().await;
        assert_eq!(report.cancelled, vec![a.order_id.clone()]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, b.order_id);
    }

    #[tokio::test]
    async fn test_recording_failure_emits_reconciliation_event() {
        let exchange = Arc::new(MockExchangeClient::new(dec!(100000)));

        let mut store = MockTradeStore::new();
        store
            .expect_save_order()
            .returning(|_| Err(TradingError::Persistence("disk full".into())));

        let mut manager = OrderManager::new(
            exchange,
            Arc::new(store),
            EmergencyStopHandle::new(),
            dec!(70),
            Duration::from_secs(30),
        );
        let mut events = manager.subscribe_events();

        // Placement still succeeds; the order is live on the venue.
        let receipt = manager
            .place_order(OrderRequest::limit(
                "XBT/USD",
                OrderSide::Buy,
                dec!(0.1),
                dec!(50000),
            ))
            .await
            .unwrap();

        match events.recv().await {
            Some(OrderEvent::OrderRecordingError {
                external_order_id, ..
            }) => assert_eq!(external_order_id, receipt.external_order_id),
            other => panic!("unexpected event: {other:?}"),
        }

        // The in-memory record remains authoritative.
        assert!(manager.order(&receipt.order_id).await.is_some());
    }
}
