//! Type definitions for the exchange API surface.
//!
//! All monetary fields arrive from the venue as decimal strings and are
//! parsed into `Decimal` at the serde boundary.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// The side that closes a position opened on this side.
    pub fn opposite(&self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

/// Order subtype accepted by the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrderKind {
    Market,
    Limit,
    StopLoss,
    TakeProfit,
}

impl OrderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::Market => "market",
            OrderKind::Limit => "limit",
            OrderKind::StopLoss => "stop-loss",
            OrderKind::TakeProfit => "take-profit",
        }
    }
}

/// Terminal and non-terminal statuses reported by the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeOrderStatus {
    Pending,
    Open,
    Closed,
    Canceled,
    Expired,
}

impl ExchangeOrderStatus {
    /// Whether no further fills can occur.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExchangeOrderStatus::Closed
                | ExchangeOrderStatus::Canceled
                | ExchangeOrderStatus::Expired
        )
    }
}

/// Exchange-shaped order request.
#[derive(Debug, Clone, Serialize)]
pub struct NewOrderRequest {
    /// Trading pair in venue notation (e.g. "XBT/USD")
    pub pair: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    /// Base-currency quantity
    pub volume: Decimal,
    /// Limit price; None for market orders
    pub price: Option<Decimal>,
    /// Client-assigned reference carried through to order updates
    pub client_ref: Option<String>,
}

/// Acknowledgement returned when an order is accepted.
#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub external_order_id: String,
    /// Human-readable order description from the venue
    pub descriptor: String,
}

/// Result of a cancel request.
#[derive(Debug, Clone)]
pub struct CancelResult {
    /// Number of orders affected
    pub count: u32,
    /// True when the cancel is queued rather than immediate
    pub pending: bool,
}

/// State of one order as reported by the venue.
#[derive(Debug, Clone)]
pub struct OpenOrderInfo {
    pub external_order_id: String,
    pub pair: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub price: Option<Decimal>,
    pub volume: Decimal,
    pub volume_executed: Decimal,
    pub average_price: Option<Decimal>,
    pub fee: Decimal,
    pub status: ExchangeOrderStatus,
}

/// Outcome of pre-submission validation.
///
/// The validator may adjust price to the pair's tick size and quantity to
/// its lot step; callers must apply the adjusted values before submitting.
#[derive(Debug, Clone, Default)]
pub struct OrderValidation {
    pub valid: bool,
    pub reason: Option<String>,
    pub adjusted_price: Option<Decimal>,
    pub adjusted_quantity: Option<Decimal>,
}

/// Trading rules for one pair.
#[derive(Debug, Clone)]
pub struct PairSpec {
    pub pair: String,
    /// Smallest price increment
    pub price_tick: Decimal,
    /// Smallest quantity increment
    pub lot_step: Decimal,
    /// Minimum order quantity
    pub min_volume: Decimal,
}

/// Normalized ticker snapshot.
///
/// Carries the bid/ask/last triple plus the 24h statistics the venue
/// publishes alongside it.
#[derive(Debug, Clone)]
pub struct TickerData {
    pub pair: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
    pub volume_24h: Decimal,
    pub vwap_24h: Decimal,
    pub trade_count_24h: u64,
    pub open_24h: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// One price level of the order book.
#[derive(Debug, Clone)]
pub struct BookLevel {
    pub price: Decimal,
    pub volume: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Normalized order book snapshot, bids and asks in price-time priority.
#[derive(Debug, Clone)]
pub struct BookData {
    pub pair: String,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub timestamp: DateTime<Utc>,
}

/// Normalized public trade.
#[derive(Debug, Clone)]
pub struct TradeData {
    pub pair: String,
    pub price: Decimal,
    pub volume: Decimal,
    pub side: OrderSide,
    pub timestamp: DateTime<Utc>,
}

/// Normalized OHLC candle.
#[derive(Debug, Clone)]
pub struct OhlcData {
    pub pair: String,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Push update for an order owned by this account.
#[derive(Debug, Clone)]
pub struct OrderUpdateData {
    pub external_order_id: String,
    pub status: ExchangeOrderStatus,
    pub volume_executed: Decimal,
    pub average_price: Option<Decimal>,
    pub fee: Decimal,
}

/// Events delivered by the exchange push stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Connected,
    Disconnected,
    Ticker(TickerData),
    OrderBook(BookData),
    Trade(TradeData),
    Ohlc(OhlcData),
    OrderUpdate(OrderUpdateData),
    BalanceUpdate(HashMap<String, Decimal>),
    Error(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_side_opposite() {
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
        assert_eq!(OrderSide::Sell.opposite(), OrderSide::Buy);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(ExchangeOrderStatus::Closed.is_terminal());
        assert!(ExchangeOrderStatus::Canceled.is_terminal());
        assert!(ExchangeOrderStatus::Expired.is_terminal());
        assert!(!ExchangeOrderStatus::Open.is_terminal());
        assert!(!ExchangeOrderStatus::Pending.is_terminal());
    }

    #[test]
    fn test_order_request_serializes_sides_lowercase() {
        let request = NewOrderRequest {
            pair: "XBT/USD".to_string(),
            side: OrderSide::Buy,
            kind: OrderKind::StopLoss,
            volume: dec!(0.5),
            price: Some(dec!(42000)),
            client_ref: None,
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["side"], "buy");
        assert_eq!(json["kind"], "stop-loss");
    }
}
