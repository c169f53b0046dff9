//! # Grid Harvester
//!
//! An automated grid-trading backend: layered limit orders around a
//! reference price, fill tracking against the exchange's open-order set,
//! profit recycling between reinvestment and extraction, and a multi-tier
//! risk gate with progressive drawdown protection.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `exchange`: Venue client contract, Kraken REST/WebSocket, mock venue
//! - `market_data`: Per-symbol snapshot store with stale-data watchdog
//! - `grid`: Grid geometry, level-to-order map, fill detection, rebalance
//! - `orders`: Canonical order records, status sync, profit distribution
//! - `risk`: Pre-trade gate, drawdown ladder, emergency stop, correlation
//! - `gateway`: Risk-gated execution facade and fill fan-out
//! - `persistence`: Table-oriented store (SQLite or mock mode)
//! - `utils`: Shared utilities, decimal arithmetic and event fan-out

pub mod config;
pub mod error;
pub mod exchange;
pub mod gateway;
pub mod grid;
pub mod market_data;
pub mod orders;
pub mod persistence;
pub mod risk;
pub mod utils;

pub use config::Config;
pub use error::TradingError;
