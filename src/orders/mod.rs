//! Order management and execution pipeline.
//!
//! Canonical order records, exchange-id mapping, status reconciliation
//! and profit-distribution fan-out.

mod manager;
mod types;

pub use manager::OrderManager;
pub use types::{
    CancelAllReport, OrderEvent, OrderMetadata, OrderReceipt, OrderRecord, OrderRequest,
    OrderStatus, ProfitDistribution,
};
