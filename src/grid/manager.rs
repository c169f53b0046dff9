//! Grid state manager.
//!
//! Owns per-pair grid geometry and the level-to-order mapping, detects
//! fills by reconciling against the exchange's open-order set, and
//! rebalances the rungs around a new reference price.

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::GridConfig;
use crate::error::TradingError;
use crate::exchange::{ExchangeClient, NewOrderRequest, OrderKind, OrderSide};
use crate::market_data::SnapshotStore;
use crate::orders::ProfitDistribution;
use crate::persistence::{PositionRow, ProfitDistributionRow, TradeStore};
use crate::utils::decimal::{percent_move, volume_for_budget};
use crate::utils::events::EventHub;

use super::geometry::{GridGeometry, PlacementSide};
use super::state::{GridOrder, GridOrderStatus, GridState};

/// Fills at least this far (percent) from the order price count as
/// profit taking.
const PROFIT_TAKING_THRESHOLD_PERCENT: Decimal = dec!(2);

/// Events published by the grid subsystem.
#[derive(Debug, Clone)]
pub enum GridEvent {
    Initialized {
        pair: String,
        lower: Decimal,
        upper: Decimal,
        buy_orders: u32,
        sell_orders: u32,
    },
    Rebalanced {
        pair: String,
        new_price: Decimal,
        cancel_failures: usize,
    },
    LevelFilled {
        pair: String,
        level: u32,
        side: OrderSide,
        order_price: Decimal,
        fill_price: Decimal,
        realized_pnl: Decimal,
        profit_taking: bool,
    },
    TornDown {
        pair: String,
    },
}

/// Grid geometry, order placement and fill reconciliation for every
/// active trading pair.
pub struct GridStateManager {
    exchange: Arc<dyn ExchangeClient>,
    store: Arc<dyn TradeStore>,
    market_data: Arc<SnapshotStore>,
    hub: EventHub<GridEvent>,
    config: GridConfig,
    reinvestment_percent: Decimal,
    request_timeout: Duration,
    grids: Mutex<HashMap<String, GridState>>,
}

impl GridStateManager {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        store: Arc<dyn TradeStore>,
        market_data: Arc<SnapshotStore>,
        config: GridConfig,
        reinvestment_percent: Decimal,
        request_timeout: Duration,
    ) -> Self {
        Self {
            exchange,
            store,
            market_data,
            hub: EventHub::new("grid"),
            config,
            reinvestment_percent,
            request_timeout,
            grids: Mutex::new(HashMap::new()),
        }
    }

    /// Register an event subscriber. Call before the loops start.
    pub fn subscribe_events(&mut self) -> mpsc::Receiver<GridEvent> {
        self.hub.subscribe()
    }

    /// Snapshot of one pair's grid state.
    pub async fn grid_snapshot(&self, pair: &str) -> Option<GridState> {
        self.grids.lock().await.get(pair).cloned()
    }

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

    /// Create a grid around the initial price and place its rungs.
    pub async fn initialize_grid(
        &self,
        pair: &str,
        initial_price: Decimal,
    ) -> Result<(), TradingError> {
        if initial_price <= Decimal::ZERO {
            return Err(TradingError::Validation(
                "initial price must be positive".into(),
            ));
        }

        let mut grids = self.grids.lock().await;
        if grids.contains_key(pair) {
            return Err(TradingError::Validation(format!(
                "grid already active for {pair}"
            )));
        }

        let geometry =
            GridGeometry::around(initial_price, self.config.grid_range, self.config.grid_levels);
        let mut state = GridState::new(pair.to_string(), initial_price, geometry);

        self.place_rungs(&mut state, initial_price).await;
        self.persist_state(&state);

        let event = GridEvent::Initialized {
            pair: pair.to_string(),
            lower: state.geometry.lower,
            upper: state.geometry.upper,
            buy_orders: state.active_buy_orders,
            sell_orders: state.active_sell_orders,
        };

        info!(
            %pair,
            lower = %state.geometry.lower,
            upper = %state.geometry.upper,
            buys = state.active_buy_orders,
            sells = state.active_sell_orders,
            "grid initialized"
        );

        grids.insert(pair.to_string(), state);
        drop(grids);

        self.hub.publish(event).await;
        Ok(())
    }

    /// Cancel every resting rung, recompute the bounds around the new
    /// price, and re-place the grid.
    pub async fn rebalance_grid(&self, pair: &str, new_price: Decimal) -> Result<(), TradingError> {
        let mut grids = self.grids.lock().await;
        let state = grids
            .get_mut(pair)
            .ok_or_else(|| TradingError::Consistency(format!("no grid for {pair}")))?;

        // 1. Cancel all existing rungs, collecting failures.
        let mut cancel_failures = 0usize;
        let resting: Vec<GridOrder> = state.orders.values().cloned().collect();
        for order in resting {
            let Some(external_order_id) = order.external_order_id.as_deref() else {
                continue;
            };
            if let Err(e) = self
                .with_deadline("cancel_order", self.exchange.cancel_order(external_order_id))
                .await
            {
                warn!(
                    %pair,
                    level = order.level,
                    error = %e,
                    "failed to cancel rung during rebalance"
                );
                cancel_failures += 1;
            }
        }
        state.orders.clear();
        state.active_buy_orders = 0;
        state.active_sell_orders = 0;

        // 2. Recompute bounds around the new reference.
        state.geometry =
            GridGeometry::around(new_price, self.config.grid_range, self.config.grid_levels);
        state.current_price = new_price;
        state.last_rebalance_time = Utc::now();

        // 3. Re-place the rungs.
        self.place_rungs(state, new_price).await;

        // 4. Persist.
        self.persist_state(state);
        drop(grids);

        info!(%pair, %new_price, cancel_failures, "grid rebalanced");
        self.hub
            .publish(GridEvent::Rebalanced {
                pair: pair.to_string(),
                new_price,
                cancel_failures,
            })
            .await;
        Ok(())
    }

    /// Place one limit order per rung outside the dead zone.
    async fn place_rungs(&self, state: &mut GridState, reference: Decimal) {
        for level in 0..=state.geometry.levels {
            let side = match state.geometry.placement(level, reference) {
                Some(PlacementSide::Buy) => OrderSide::Buy,
                Some(PlacementSide::Sell) => OrderSide::Sell,
                None => continue,
            };

            let price = state.geometry.level_price(level);
            let size = volume_for_budget(self.config.order_size, price);

            match self.place_rung_order(state, level, side, price, size).await {
                Ok(order) => {
                    if side == OrderSide::Buy {
                        state.total_invested += order.price * order.size;
                    }
                    self.persist_open_position(state, &order);
                    state.insert_order(order);
                }
                Err(e) => {
                    warn!(
                        pair = %state.trading_pair,
                        level,
                        %price,
                        error = %e,
                        "failed to place rung, leaving level empty"
                    );
                }
            }
        }
    }

    async fn place_rung_order(
        &self,
        state: &GridState,
        level: u32,
        side: OrderSide,
        price: Decimal,
        size: Decimal,
    ) -> Result<GridOrder, TradingError> {
        let mut request = NewOrderRequest {
            pair: state.trading_pair.clone(),
            side,
            kind: OrderKind::Limit,
            volume: size,
            price: Some(price),
            client_ref: None,
        };

        let validation = self
            .with_deadline("validate_order", self.exchange.validate_order(&request))
            .await?;
        if !validation.valid {
            return Err(TradingError::Validation(
                validation
                    .reason
                    .unwrap_or_else(|| "rung rejected by validator".to_string()),
            ));
        }
        if let Some(adjusted) = validation.adjusted_price {
            request.price = Some(adjusted);
        }
        if let Some(adjusted) = validation.adjusted_quantity {
            request.volume = adjusted;
        }

        let placed = self
            .with_deadline("place_order", self.exchange.place_order(&request))
            .await?;

        debug!(
            pair = %state.trading_pair,
            level,
            side = ?side,
            price = %request.price.unwrap_or(price),
            size = %request.volume,
            external_order_id = %placed.external_order_id,
            "rung placed"
        );

        Ok(GridOrder {
            id: Uuid::new_v4().to_string(),
            level,
            price: request.price.unwrap_or(price),
            size: request.volume,
            side,
            external_order_id: Some(placed.external_order_id),
            status: GridOrderStatus::Placed,
            timestamp: Utc::now(),
        })
    }

    /// Compare the in-memory grid against the exchange's open-order set
    /// and resolve every rung whose order is no longer resting.
    pub async fn check_order_fills(&self, pair: &str) -> Result<(), TradingError> {
        let exchange_open = self
            .with_deadline("get_open_orders", self.exchange.get_open_orders())
            .await?;

        let mut grids = self.grids.lock().await;
        let Some(state) = grids.get_mut(pair) else {
            return Ok(());
        };

        let current_price = self
            .market_data
            .last_price(pair)
            .unwrap_or(state.current_price);

        let filled_levels: Vec<u32> = state
            .orders
            .iter()
            .filter(|(_, order)| {
                order
                    .external_order_id
                    .as_ref()
                    .map(|id| !exchange_open.contains_key(id))
                    .unwrap_or(false)
            })
            .map(|(level, _)| *level)
            .collect();

        if filled_levels.is_empty() {
            return Ok(());
        }

        let mut events = Vec::new();
        for level in filled_levels {
            if let Some(event) = self.resolve_fill(state, level, current_price) {
                events.push(event);
            }
        }
        self.persist_state(state);
        drop(grids);

        for event in events {
            self.hub.publish(event).await;
        }
        Ok(())
    }

    /// Feed one confirmed fill from the order pipeline (by grid level).
    pub async fn on_order_filled(&self, pair: &str, level: u32, fill_price: Decimal) {
        let mut grids = self.grids.lock().await;
        let Some(state) = grids.get_mut(pair) else {
            return;
        };
        let Some(event) = self.resolve_fill(state, level, fill_price) else {
            return;
        };
        self.persist_state(state);
        drop(grids);

        self.hub.publish(event).await;
    }

    /// Resolve one filled rung: close its position, update profit, and
    /// record a profit-taking split when the price moved far enough.
    fn resolve_fill(
        &self,
        state: &mut GridState,
        level: u32,
        current_price: Decimal,
    ) -> Option<GridEvent> {
        let order = state.remove_level(level)?;

        let realized_pnl = match order.side {
            OrderSide::Buy => (current_price - order.price) * order.size,
            OrderSide::Sell => (order.price - current_price) * order.size,
        };
        state.current_profit += realized_pnl;
        state.current_price = current_price;

        self.persist_closed_position(state, &order, realized_pnl);

        // A fill at least 2% away from the rung counts as profit taking
        // regardless of the sign of the realized P&L.
        let price_move = percent_move(order.price, current_price);
        let profit_taking = price_move >= PROFIT_TAKING_THRESHOLD_PERCENT;
        if profit_taking {
            let proceeds = order.size * current_price;
            let distribution = ProfitDistribution::split(
                order.id.clone(),
                proceeds,
                self.reinvestment_percent,
                Some(level as i64),
            );
            if let Err(e) = self.store.record_profit_distribution(&ProfitDistributionRow {
                order_id: distribution.order_id.clone(),
                total_proceeds: distribution.total_proceeds,
                reinvestment_amount: distribution.reinvestment,
                profit_extraction: distribution.extraction,
                grid_level: distribution.grid_level,
                timestamp: distribution.timestamp,
            }) {
                warn!(error = %e, "failed to persist grid profit-taking row");
            }
        }

        info!(
            pair = %state.trading_pair,
            level,
            side = ?order.side,
            order_price = %order.price,
            fill_price = %current_price,
            pnl = %realized_pnl,
            profit_taking,
            "grid level filled"
        );

        Some(GridEvent::LevelFilled {
            pair: state.trading_pair.clone(),
            level,
            side: order.side,
            order_price: order.price,
            fill_price: current_price,
            realized_pnl,
            profit_taking,
        })
    }

    /// Cancel every rung and drop the pair's grid.
    pub async fn teardown_grid(&self, pair: &str) -> Result<(), TradingError> {
        let mut grids = self.grids.lock().await;
        let mut state = grids
            .remove(pair)
            .ok_or_else(|| TradingError::Consistency(format!("no grid for {pair}")))?;

        for order in state.orders.values() {
            if let Some(external_order_id) = order.external_order_id.as_deref() {
                if let Err(e) = self
                    .with_deadline("cancel_order", self.exchange.cancel_order(external_order_id))
                    .await
                {
                    warn!(%pair, level = order.level, error = %e, "failed to cancel rung at teardown");
                }
            }
        }

        state.orders.clear();
        state.active_buy_orders = 0;
        state.active_sell_orders = 0;
        self.persist_state(&state);
        drop(grids);

        info!(%pair, "grid torn down");
        self.hub
            .publish(GridEvent::TornDown {
                pair: pair.to_string(),
            })
            .await;
        Ok(())
    }

    /// Timer-driven fill detection across every active pair.
    pub async fn run_fill_loop(
        self: Arc<Self>,
        check_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let pairs: Vec<String> =
                        self.grids.lock().await.keys().cloned().collect();
                    for pair in pairs {
                        if let Err(e) = self.check_order_fills(&pair).await {
                            warn!(%pair, error = %e, "fill detection pass failed");
                        }
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    /// Snapshot persisted on every state-affecting transition.
    fn persist_state(&self, state: &GridState) {
        if let Err(e) = self.store.save_grid_state(&state.to_row()) {
            warn!(pair = %state.trading_pair, error = %e, "failed to persist grid state");
        }
    }

    fn persist_open_position(&self, state: &GridState, order: &GridOrder) {
        let row = PositionRow {
            id: order.id.clone(),
            trading_pair: state.trading_pair.clone(),
            grid_level: Some(order.level as i64),
            entry_price: order.price,
            size: order.size,
            side: order.side.as_str().to_string(),
            status: "OPEN".to_string(),
            entry_time: order.timestamp,
            exit_time: None,
            realized_pnl: None,
            strategy_type: "grid".to_string(),
        };
        if let Err(e) = self.store.save_position(&row) {
            warn!(error = %e, "failed to persist open position");
        }
    }

    fn persist_closed_position(&self, state: &GridState, order: &GridOrder, realized_pnl: Decimal) {
        let row = PositionRow {
            id: order.id.clone(),
            trading_pair: state.trading_pair.clone(),
            grid_level: Some(order.level as i64),
            entry_price: order.price,
            size: order.size,
            side: order.side.as_str().to_string(),
            status: "CLOSED".to_string(),
            entry_time: order.timestamp,
            exit_time: Some(Utc::now()),
            realized_pnl: Some(realized_pnl),
            strategy_type: "grid".to_string(),
        };
        if let Err(e) = self.store.save_position(&row) {
            warn!(error = %e, "failed to persist closed position");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{MockExchangeClient, TickerData};
    use crate::persistence::MockStore;

    fn grid_config() -> GridConfig {
        GridConfig {
            trading_pairs: vec!["XBT/USD".to_string()],
            grid_range: dec!(0.10),
            grid_levels: 10,
            order_size: dec!(100),
        }
    }

    fn build_manager(
        exchange: Arc<MockExchangeClient>,
        market_data: Arc<SnapshotStore>,
    ) -> GridStateManager {
        GridStateManager::new(
            exchange,
            Arc::new(MockStore::new()),
            market_data,
            grid_config(),
            dec!(70),
            Duration::from_secs(30),
        )
    }

    async fn set_price(market_data: &SnapshotStore, price: Decimal) {
        market_data
            .apply_ticker(TickerData {
                pair: "XBT/USD".to_string(),
                bid: price - dec!(0.5),
                ask: price + dec!(0.5),
                last: price,
                volume_24h: dec!(1000),
                vwap_24h: price,
                trade_count_24h: 5000,
                open_24h: price,
                timestamp: Utc::now(),
            })
            .await;
    }

    #[tokio::test]
    async fn test_initial_placement_with_dead_zone() {
        let exchange = Arc::new(MockExchangeClient::new(dec!(100000)));
        let market_data = Arc::new(SnapshotStore::new(Duration::from_secs(60)));
        let manager = build_manager(exchange.clone(), market_data);

        manager.initialize_grid("XBT/USD", dec!(100)).await.unwrap();

        let state = manager.grid_snapshot("XBT/USD").await.unwrap();
        assert_eq!(state.geometry.lower, dec!(90));
        assert_eq!(state.geometry.upper, dec!(110));
        assert_eq!(state.active_buy_orders, 5);
        assert_eq!(state.active_sell_orders, 5);
        assert!(state.invariants_hold());

        let mut buy_prices: Vec<Decimal> = state
            .orders
            .values()
            .filter(|o| o.side == OrderSide::Buy)
            .map(|o| o.price)
            .collect();
        buy_prices.sort();
        assert_eq!(
            buy_prices,
            vec![dec!(90), dec!(92), dec!(94), dec!(96), dec!(98)]
        );

        let mut sell_prices: Vec<Decimal> = state
            .orders
            .values()
            .filter(|o| o.side == OrderSide::Sell)
            .map(|o| o.price)
            .collect();
        sell_prices.sort();
        assert_eq!(
            sell_prices,
            vec![dec!(102), dec!(104), dec!(106), dec!(108), dec!(110)]
        );

        // The reference rung stays empty.
        assert!(!state.orders.contains_key(&5));
        assert_eq!(exchange.open_order_count().await, 10);
    }

    #[tokio::test]
    async fn test_duplicate_initialization_is_rejected() {
        let exchange = Arc::new(MockExchangeClient::new(dec!(100000)));
        let market_data = Arc::new(SnapshotStore::new(Duration::from_secs(60)));
        let manager = build_manager(exchange, market_data);

        manager.initialize_grid("XBT/USD", dec!(100)).await.unwrap();
        assert!(manager.initialize_grid("XBT/USD", dec!(100)).await.is_err());
    }

    #[tokio::test]
    async fn test_fill_detection_by_absence() {
        let exchange = Arc::new(MockExchangeClient::new(dec!(100000)));
        let market_data = Arc::new(SnapshotStore::new(Duration::from_secs(60)));
        let mut manager = build_manager(exchange.clone(), market_data.clone());
        let mut events = manager.subscribe_events();

        manager.initialize_grid("XBT/USD", dec!(100)).await.unwrap();
        let _ = events.recv().await; // Initialized

        // The sell rung at 102 fills on the venue; price barely moved.
        let state = manager.grid_snapshot("XBT/USD").await.unwrap();
        let sell = state.orders.get(&6).cloned().unwrap();
        assert_eq!(sell.price, dec!(102));
        exchange
            .fill_order(sell.external_order_id.as_deref().unwrap(), dec!(102))
            .await;
        set_price(&market_data, dec!(102)).await;

        manager.check_order_fills("XBT/USD").await.unwrap();

        let state = manager.grid_snapshot("XBT/USD").await.unwrap();
        assert!(!state.orders.contains_key(&6));
        assert_eq!(state.active_sell_orders, 4);
        assert!(state.invariants_hold());

        match events.recv().await {
            Some(GridEvent::LevelFilled {
                level,
                side,
                profit_taking,
                realized_pnl,
                ..
            }) => {
                assert_eq!(level, 6);
                assert_eq!(side, OrderSide::Sell);
                assert!(!profit_taking);
                assert_eq!(realized_pnl, Decimal::ZERO);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_far_fill_records_profit_taking_even_at_a_loss() {
        let exchange = Arc::new(MockExchangeClient::new(dec!(100000)));
        let market_data = Arc::new(SnapshotStore::new(Duration::from_secs(60)));
        let mut manager = build_manager(exchange.clone(), market_data.clone());
        let mut events = manager.subscribe_events();

        manager.initialize_grid("XBT/USD", dec!(100)).await.unwrap();
        let _ = events.recv().await;

        // The buy rung at 98 fills while the market trades 2.04% lower:
        // a losing fill, still booked as profit taking.
        let state = manager.grid_snapshot("XBT/USD").await.unwrap();
        let buy = state.orders.get(&4).cloned().unwrap();
        assert_eq!(buy.price, dec!(98));
        exchange
            .fill_order(buy.external_order_id.as_deref().unwrap(), dec!(96))
            .await;
        set_price(&market_data, dec!(96)).await;

        manager.check_order_fills("XBT/USD").await.unwrap();

        match events.recv().await {
            Some(GridEvent::LevelFilled {
                profit_taking,
                realized_pnl,
                ..
            }) => {
                assert!(profit_taking);
                assert!(realized_pnl < Decimal::ZERO);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rebalance_moves_the_grid() {
        let exchange = Arc::new(MockExchangeClient::new(dec!(100000)));
        let market_data = Arc::new(SnapshotStore::new(Duration::from_secs(60)));
        let manager = build_manager(exchange.clone(), market_data);

        manager.initialize_grid("XBT/USD", dec!(100)).await.unwrap();
        manager.rebalance_grid("XBT/USD", dec!(120)).await.unwrap();

        let state = manager.grid_snapshot("XBT/USD").await.unwrap();
        assert_eq!(state.geometry.lower, dec!(108));
        assert_eq!(state.geometry.upper, dec!(132));
        assert_eq!(state.current_price, dec!(120));
        assert_eq!(state.active_buy_orders, 5);
        assert_eq!(state.active_sell_orders, 5);
        assert!(state.invariants_hold());

        // Old rungs are gone from the venue, only the new grid rests.
        assert_eq!(exchange.open_order_count().await, 10);
    }

    #[tokio::test]
    async fn test_teardown_cancels_everything() {
        let exchange = Arc::new(MockExchangeClient::new(dec!(100000)));
        let market_data = Arc::new(SnapshotStore::new(Duration::from_secs(60)));
        let manager = build_manager(exchange.clone(), market_data);

        manager.initialize_grid("XBT/USD", dec!(100)).await.unwrap();
        manager.teardown_grid("XBT/USD").await.unwrap();

        assert!(manager.grid_snapshot("XBT/USD").await.is_none());
        assert_eq!(exchange.open_order_count().await, 0);
    }

    #[tokio::test]
    async fn test_fill_feed_from_order_pipeline() {
        let exchange = Arc::new(MockExchangeClient::new(dec!(100000)));
        let market_data = Arc::new(SnapshotStore::new(Duration::from_secs(60)));
        let mut manager = build_manager(exchange.clone(), market_data);
        let mut events = manager.subscribe_events();

        manager.initialize_grid("XBT/USD", dec!(100)).await.unwrap();
        let _ = events.recv().await;

        manager.on_order_filled("XBT/USD", 7, dec!(104)).await;

        let state = manager.grid_snapshot("XBT/USD").await.unwrap();
        assert!(!state.orders.contains_key(&7));
        assert!(state.invariants_hold());

        match events.recv().await {
            Some(GridEvent::LevelFilled { level, .. }) => assert_eq!(level, 7),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
