//! Exchange integration.
//!
//! Provides the venue-agnostic client contract plus:
//! - Kraken REST implementation (orders, balances, validation)
//! - WebSocket market stream with reconnect supervision
//! - Mock venue for paper trading and tests
//! - Shared rate-limit budget for all outbound calls

mod kraken;
pub mod mock;
pub mod rate_limit;
mod stream;
mod traits;
mod types;

pub use kraken::KrakenClient;
pub use mock::MockExchangeClient;
pub use rate_limit::RateLimiter;
pub use stream::MarketStream;
pub use traits::ExchangeClient;
pub use types::*;
