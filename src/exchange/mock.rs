//! Mock exchange venue for paper trading and tests.
//!
//! Simulates the order book side of the venue contract: orders rest in an
//! open set until test code or the price feed fills them, balances move on
//! fills, and the open-order set behaves exactly like the live endpoint so
//! fill detection can be exercised without a network.

use super::rate_limit::RateLimiter;
use super::traits::ExchangeClient;
use super::types::*;
use crate::error::TradingError;
use crate::utils::decimal::{quantize_price, quantize_volume};
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Mutable venue state behind the mock.
#[derive(Debug, Default)]
struct MockVenueState {
    /// Every order ever accepted, keyed by external id
    orders: HashMap<String, OpenOrderInfo>,
    /// Balances by currency
    balances: HashMap<String, Decimal>,
    /// Last trade price per pair
    prices: HashMap<String, Decimal>,
}

/// Mock client that simulates exchange API responses.
pub struct MockExchangeClient {
    state: Arc<RwLock<MockVenueState>>,
    order_id_counter: AtomicU64,
    limiter: Option<Arc<RateLimiter>>,
    /// Taker fee rate applied to simulated fills
    fee_rate: Decimal,
    /// Trading rules applied by the validator
    spec: PairSpec,
}

impl MockExchangeClient {
    /// Create a mock venue with the given starting cash balance (USD).
    pub fn new(initial_cash: Decimal) -> Self {
        let mut balances = HashMap::new();
        balances.insert("USD".to_string(), initial_cash);

        Self {
            state: Arc::new(RwLock::new(MockVenueState {
                orders: HashMap::new(),
                balances,
                prices: HashMap::new(),
            })),
            order_id_counter: AtomicU64::new(1),
            limiter: None,
            fee_rate: dec!(0.0026), // taker fee
            spec: PairSpec {
                pair: String::new(),
                price_tick: dec!(0.1),
                lot_step: dec!(0.00000001),
                min_volume: dec!(0.0001),
            },
        }
    }

    /// Attach the shared rate-limit budget, as the live client does.
    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    async fn acquire(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }
    }

    /// Set the simulated last price for a pair, filling any resting limit
    /// order the move crosses.
    pub async fn set_price(&self, pair: &str, price: Decimal) {
        let mut state = self.state.write().await;
        state.prices.insert(pair.to_string(), price);

        let fee_rate = self.fee_rate;
        for order in state.orders.values_mut() {
            if order.pair != pair || order.status.is_terminal() {
                continue;
            }
            let Some(limit) = order.price else { continue };
            let crossed = match order.side {
                OrderSide::Buy => price <= limit,
                OrderSide::Sell => price >= limit,
            };
            if crossed {
                order.volume_executed = order.volume;
                order.average_price = Some(limit);
                order.fee = (order.volume * limit * fee_rate).round_dp(8);
                order.status = ExchangeOrderStatus::Closed;
                debug!(
                    external_order_id = %order.external_order_id,
                    %limit,
                    "mock limit order crossed"
                );
            }
        }
    }

    /// Set a currency balance directly.
    pub async fn set_balance(&self, currency: &str, amount: Decimal) {
        self.state
            .write()
            .await
            .balances
            .insert(currency.to_string(), amount);
    }

    /// Fill an open order at the given price, moving it to `Closed`.
    ///
    /// Returns false when the id is unknown or already terminal.
    pub async fn fill_order(&self, external_order_id: &str, fill_price: Decimal) -> bool {
        let mut state = self.state.write().await;
        let Some(order) = state.orders.get_mut(external_order_id) else {
            return false;
        };
        if order.status.is_terminal() {
            return false;
        }

        order.volume_executed = order.volume;
        order.average_price = Some(fill_price);
        order.fee = (order.volume * fill_price * self.fee_rate).round_dp(8);
        order.status = ExchangeOrderStatus::Closed;

        info!(
            external_order_id,
            price = %fill_price,
            "mock order filled"
        );
        true
    }

    /// Number of orders currently resting in the open set.
    pub async fn open_order_count(&self) -> usize {
        self.state
            .read()
            .await
            .orders
            .values()
            .filter(|o| !o.status.is_terminal())
            .count()
    }

    fn next_order_id(&self) -> String {
        format!("MOCK-{}", self.order_id_counter.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl ExchangeClient for MockExchangeClient {
    async fn place_order(&self, order: &NewOrderRequest) -> Result<PlacedOrder, TradingError> {
        self.acquire().await;

        if order.volume <= Decimal::ZERO {
            return Err(TradingError::Validation("volume must be positive".into()));
        }

        let mut state = self.state.write().await;
        let external_order_id = self.next_order_id();

        // Market orders fill immediately at the simulated last price.
        let (status, volume_executed, average_price, fee) = match order.kind {
            OrderKind::Market => {
                let price = state.prices.get(&order.pair).copied().ok_or_else(|| {
                    TradingError::Exchange(format!("no price for pair {}", order.pair))
                })?;
                let fee = (order.volume * price * self.fee_rate).round_dp(8);
                (ExchangeOrderStatus::Closed, order.volume, Some(price), fee)
            }
            _ => (ExchangeOrderStatus::Open, Decimal::ZERO, None, Decimal::ZERO),
        };

        let descriptor = format!(
            "{} {} {} @ {}",
            order.side.as_str(),
            order.volume,
            order.pair,
            order
                .price
                .map(|p| p.to_string())
                .unwrap_or_else(|| "market".to_string()),
        );

        state.orders.insert(
            external_order_id.clone(),
            OpenOrderInfo {
                external_order_id: external_order_id.clone(),
                pair: order.pair.clone(),
                side: order.side,
                kind: order.kind,
                price: order.price,
                volume: order.volume,
                volume_executed,
                average_price,
                fee,
                status,
            },
        );

        debug!(external_order_id, %descriptor, "mock order accepted");

        Ok(PlacedOrder {
            external_order_id,
            descriptor,
        })
    }

    async fn cancel_order(&self, external_order_id: &str) -> Result<CancelResult, TradingError> {
        self.acquire().await;

        let mut state = self.state.write().await;
        let order = state
            .orders
            .get_mut(external_order_id)
            .ok_or_else(|| TradingError::Exchange("EOrder:Unknown order".into()))?;

        if order.status.is_terminal() {
            return Err(TradingError::Exchange("EOrder:Unknown order".into()));
        }

        order.status = ExchangeOrderStatus::Canceled;
        Ok(CancelResult {
            count: 1,
            pending: false,
        })
    }

    async fn get_open_orders(&self) -> Result<HashMap<String, OpenOrderInfo>, TradingError> {
        self.acquire().await;

        Ok(self
            .state
            .read()
            .await
            .orders
            .iter()
            .filter(|(_, order)| !order.status.is_terminal())
            .map(|(id, order)| (id.clone(), order.clone()))
            .collect())
    }

    async fn get_order_status(
        &self,
        external_order_id: &str,
    ) -> Result<Option<OpenOrderInfo>, TradingError> {
        self.acquire().await;

        Ok(self
            .state
            .read()
            .await
            .orders
            .get(external_order_id)
            .cloned())
    }

    async fn get_account_balance(&self) -> Result<HashMap<String, Decimal>, TradingError> {
        self.acquire().await;
        Ok(self.state.read().await.balances.clone())
    }

    async fn validate_order(
        &self,
        order: &NewOrderRequest,
    ) -> Result<OrderValidation, TradingError> {
        if order.volume <= Decimal::ZERO {
            return Ok(OrderValidation {
                valid: false,
                reason: Some("volume must be positive".into()),
                ..Default::default()
            });
        }
        if order.kind == OrderKind::Limit && order.price.map_or(true, |p| p <= Decimal::ZERO) {
            return Ok(OrderValidation {
                valid: false,
                reason: Some("limit orders require a positive price".into()),
                ..Default::default()
            });
        }

        let adjusted_quantity = quantize_volume(order.volume, self.spec.lot_step);
        if adjusted_quantity < self.spec.min_volume {
            return Ok(OrderValidation {
                valid: false,
                reason: Some(format!(
                    "volume {} below pair minimum {}",
                    adjusted_quantity, self.spec.min_volume
                )),
                ..Default::default()
            });
        }

        let adjusted_price = order.price.map(|p| quantize_price(p, self.spec.price_tick));

        Ok(OrderValidation {
            valid: true,
            reason: None,
            adjusted_price: adjusted_price.filter(|&p| Some(p) != order.price),
            adjusted_quantity: (adjusted_quantity != order.volume).then_some(adjusted_quantity),
        })
    }
}
