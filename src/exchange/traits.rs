//! Venue-agnostic exchange client contract.
//!
//! The trading core consumes this trait only; concrete venues (REST
//! client, mock venue) implement it. Every implementation is expected to
//! acquire the shared rate-limit budget before each outbound call and to
//! enforce the configured request deadline.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::error::TradingError;
use crate::exchange::types::{
    CancelResult, NewOrderRequest, OpenOrderInfo, OrderValidation, PlacedOrder,
};

/// Order placement, cancellation and account queries against a venue.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Submit an order. Returns the venue-assigned id and descriptor.
    async fn place_order(&self, order: &NewOrderRequest) -> Result<PlacedOrder, TradingError>;

    /// Cancel one order by its external id.
    async fn cancel_order(&self, external_order_id: &str) -> Result<CancelResult, TradingError>;

    /// All currently open orders for this account, keyed by external id.
    async fn get_open_orders(&self) -> Result<HashMap<String, OpenOrderInfo>, TradingError>;

    /// Terminal or live status of one order; `None` when the venue has no
    /// record of the id.
    async fn get_order_status(
        &self,
        external_order_id: &str,
    ) -> Result<Option<OpenOrderInfo>, TradingError>;

    /// Account balances keyed by currency.
    async fn get_account_balance(&self) -> Result<HashMap<String, Decimal>, TradingError>;

    /// Pre-submission validation against the pair's trading rules.
    ///
    /// May return adjusted price/quantity which callers must apply.
    async fn validate_order(
        &self,
        order: &NewOrderRequest,
    ) -> Result<OrderValidation, TradingError>;
}
