//! Market-data snapshot store.
//!
//! Per-symbol latest ticker/book/trades with a stale-data watchdog and a
//! price-history ring backing the 24 h change derivation.

mod store;
mod types;

pub use store::SnapshotStore;
pub use types::{
    MarketDataEvent, MarketDataSnapshot, ProcessedOrderBook, ProcessedTicker, ProcessedTrade,
};
