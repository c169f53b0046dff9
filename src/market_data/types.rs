//! Normalized market-data shapes kept by the snapshot store.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::exchange::{BookLevel, OrderSide};

/// Latest ticker state for a symbol, enriched with derived fields.
#[derive(Debug, Clone)]
pub struct ProcessedTicker {
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
    /// Ask minus bid
    pub spread: Decimal,
    pub volume_24h: Decimal,
    /// Percent change derived from the price history ring
    pub change_24h: Decimal,
    pub vwap_24h: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Latest order book for a symbol, bids descending and asks ascending.
#[derive(Debug, Clone)]
pub struct ProcessedOrderBook {
    pub symbol: String,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub timestamp: DateTime<Utc>,
}

/// One public trade.
#[derive(Debug, Clone)]
pub struct ProcessedTrade {
    pub symbol: String,
    pub price: Decimal,
    pub volume: Decimal,
    pub side: OrderSide,
    pub timestamp: DateTime<Utc>,
}

/// Point-in-time view of everything known about a symbol.
#[derive(Debug, Clone, Default)]
pub struct MarketDataSnapshot {
    pub ticker: Option<ProcessedTicker>,
    pub order_book: Option<ProcessedOrderBook>,
    pub recent_trades: Vec<ProcessedTrade>,
    pub last_update: Option<DateTime<Utc>>,
}

/// Events published by the market-data subsystem.
#[derive(Debug, Clone)]
pub enum MarketDataEvent {
    /// A ticker was applied for the symbol.
    Tick { symbol: String, price: Decimal },
    /// The symbol has received no update for longer than the stale window.
    StaleData { symbol: String, age_secs: u64 },
}
