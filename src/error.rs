//! Error taxonomy for the trading core.
//!
//! Errors are split by how callers recover from them:
//! - `Validation` and `Exchange` surface synchronously and are never retried
//! - `Transport` is retried by the transport layer before it reaches here
//! - `Timeout` leaves the retry decision to the caller
//! - `Persistence` is non-fatal; in-memory state stays authoritative
//! - `Consistency` is reconciled against the exchange on the next sync cycle

use thiserror::Error;

/// Unified error type used at the subsystem seams.
#[derive(Debug, Error)]
pub enum TradingError {
    /// Pre-flight rejection: bad symbol, non-positive size or price,
    /// insufficient balance, risk-gate rejection.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Network-level failure after the transport retry budget is exhausted.
    #[error("transport error: {0}")]
    Transport(String),

    /// An external call exceeded its deadline.
    #[error("deadline exceeded after {seconds}s: {operation}")]
    Timeout { operation: String, seconds: u64 },

    /// Business error returned by the exchange (insufficient funds,
    /// price out of band, unknown order).
    #[error("exchange rejected request: {0}")]
    Exchange(String),

    /// Store write or read failure. Non-fatal for the trading loop.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Internal state disagrees with itself (missing order id, counter drift).
    #[error("consistency error: {0}")]
    Consistency(String),
}

impl TradingError {
    /// Whether the caller may retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TradingError::Transport(_) | TradingError::Timeout { .. })
    }
}

impl From<reqwest::Error> for TradingError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TradingError::Timeout {
                operation: err
                    .url()
                    .map(|u| u.path().to_string())
                    .unwrap_or_else(|| "http request".to_string()),
                seconds: 0,
            }
        } else {
            TradingError::Transport(err.to_string())
        }
    }
}

impl From<rusqlite::Error> for TradingError {
    fn from(err: rusqlite::Error) -> Self {
        TradingError::Persistence(err.to_string())
    }
}
