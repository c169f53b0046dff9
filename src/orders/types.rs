//! Canonical order records and order-pipeline events.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::exchange::{ExchangeOrderStatus, OrderKind, OrderSide};
use crate::persistence::OrderRow;

/// Tolerance when comparing filled quantity against order quantity.
const FILL_EPSILON: Decimal = dec!(0.000000001);

/// Internal order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Open,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// Map an exchange-reported status into the internal taxonomy.
    pub fn from_exchange(status: ExchangeOrderStatus) -> Self {
        match status {
            ExchangeOrderStatus::Pending => OrderStatus::Pending,
            ExchangeOrderStatus::Open => OrderStatus::Open,
            ExchangeOrderStatus::Closed => OrderStatus::Filled,
            ExchangeOrderStatus::Canceled => OrderStatus::Cancelled,
            ExchangeOrderStatus::Expired => OrderStatus::Expired,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::Open)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Open => "open",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Expired => "expired",
        }
    }
}

/// Free-form order annotations carried through to fill handling.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderMetadata {
    /// Marks a sell whose proceeds are split on fill
    #[serde(default)]
    pub is_profit_taking: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Caller-facing order request.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub trading_pair: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub strategy_id: Option<String>,
    pub grid_level: Option<i64>,
    pub profit_target: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub metadata: OrderMetadata,
}

impl OrderRequest {
    /// Plain limit order with no strategy annotations.
    pub fn limit(
        trading_pair: impl Into<String>,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
    ) -> Self {
        Self {
            trading_pair: trading_pair.into(),
            side,
            kind: OrderKind::Limit,
            quantity,
            price: Some(price),
            strategy_id: None,
            grid_level: None,
            profit_target: None,
            stop_loss: None,
            metadata: OrderMetadata::default(),
        }
    }
}

/// Canonical internal record for any order, grid or not.
#[derive(Debug, Clone)]
pub struct OrderRecord {
    pub id: String,
    pub external_order_id: Option<String>,
    pub trading_pair: String,
    pub order_type: OrderSide,
    pub order_subtype: OrderKind,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub status: OrderStatus,
    pub filled_quantity: Decimal,
    pub average_fill_price: Option<Decimal>,
    pub fees: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub strategy_id: Option<String>,
    pub grid_level: Option<i64>,
    pub profit_target: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub metadata: OrderMetadata,
}

impl OrderRecord {
    pub fn from_request(id: String, request: &OrderRequest) -> Self {
        let now = Utc::now();
        Self {
            id,
            external_order_id: None,
            trading_pair: request.trading_pair.clone(),
            order_type: request.side,
            order_subtype: request.kind,
            quantity: request.quantity,
            price: request.price,
            status: OrderStatus::Pending,
            filled_quantity: Decimal::ZERO,
            average_fill_price: None,
            fees: Decimal::ZERO,
            created_at: now,
            updated_at: now,
            strategy_id: request.strategy_id.clone(),
            grid_level: request.grid_level,
            profit_target: request.profit_target,
            stop_loss: request.stop_loss,
            metadata: request.metadata.clone(),
        }
    }

    /// Record invariant: `filled_quantity <= quantity`, and filled status
    /// exactly when the order is fully executed (within epsilon).
    pub fn invariants_hold(&self) -> bool {
        if self.filled_quantity > self.quantity + FILL_EPSILON {
            return false;
        }
        let fully_filled = (self.quantity - self.filled_quantity).abs() <= FILL_EPSILON;
        match self.status {
            OrderStatus::Filled => fully_filled,
            _ => true,
        }
    }

    pub fn to_row(&self) -> OrderRow {
        OrderRow {
            id: self.id.clone(),
            external_order_id: self.external_order_id.clone(),
            trading_pair: self.trading_pair.clone(),
            order_type: self.order_type.as_str().to_string(),
            order_subtype: self.order_subtype.as_str().to_string(),
            quantity: self.quantity,
            price: self.price,
            status: self.status.as_str().to_string(),
            filled_quantity: self.filled_quantity,
            average_fill_price: self.average_fill_price,
            fees: self.fees,
            created_at: self.created_at,
            updated_at: self.updated_at,
            strategy_id: self.strategy_id.clone(),
            grid_level: self.grid_level,
            profit_target: self.profit_target,
            stop_loss: self.stop_loss,
            metadata: serde_json::to_value(&self.metadata).unwrap_or(serde_json::Value::Null),
        }
    }
}

/// Result of a successful placement.
#[derive(Debug, Clone)]
pub struct OrderReceipt {
    pub order_id: String,
    pub external_order_id: String,
    pub execution_time_ms: u64,
}

/// One 70/30 split of net sell proceeds.
#[derive(Debug, Clone, Serialize)]
pub struct ProfitDistribution {
    pub order_id: String,
    pub total_proceeds: Decimal,
    pub reinvestment: Decimal,
    pub extraction: Decimal,
    pub grid_level: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

impl ProfitDistribution {
    /// Split net proceeds, retaining `reinvestment_percent` as working
    /// capital. The extraction leg is the exact remainder, so the two
    /// always sum to the net proceeds.
    pub fn split(
        order_id: String,
        net_proceeds: Decimal,
        reinvestment_percent: Decimal,
        grid_level: Option<i64>,
    ) -> Self {
        let reinvestment = net_proceeds * reinvestment_percent / dec!(100);
        let extraction = net_proceeds - reinvestment;
        Self {
            order_id,
            total_proceeds: net_proceeds,
            reinvestment,
            extraction,
            grid_level,
            timestamp: Utc::now(),
        }
    }
}

/// Report of a cancel-all pass; partial success is reported, not retried.
#[derive(Debug, Clone, Default)]
pub struct CancelAllReport {
    pub cancelled: Vec<String>,
    pub failures: Vec<(String, String)>,
}

/// Events published by the order pipeline.
#[derive(Debug, Clone)]
pub enum OrderEvent {
    OrderPlaced {
        order: OrderRecord,
    },
    /// Full accounting payload for a terminal fill.
    OrderFilled {
        order: OrderRecord,
        net_proceeds: Decimal,
    },
    OrderCancelled {
        order_id: String,
    },
    /// The order is live on the exchange but could not be recorded;
    /// an operator must reconcile manually.
    OrderRecordingError {
        external_order_id: String,
        error: String,
    },
    ProfitDistributed(ProfitDistribution),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping_from_exchange() {
        assert_eq!(
            OrderStatus::from_exchange(ExchangeOrderStatus::Closed),
            OrderStatus::Filled
        );
        assert_eq!(
            OrderStatus::from_exchange(ExchangeOrderStatus::Canceled),
            OrderStatus::Cancelled
        );
        assert_eq!(
            OrderStatus::from_exchange(ExchangeOrderStatus::Expired),
            OrderStatus::Expired
        );
        assert_eq!(
            OrderStatus::from_exchange(ExchangeOrderStatus::Open),
            OrderStatus::Open
        );
    }

    #[test]
    fn test_record_invariants() {
        let request = OrderRequest::limit("XBT/USD", OrderSide::Buy, dec!(1), dec!(50000));
        let mut record = OrderRecord::from_request("order-1".into(), &request);
        assert!(record.invariants_hold());

        record.filled_quantity = dec!(0.5);
        record.status = OrderStatus::Open;
        assert!(record.invariants_hold());

        // Filled status requires a full fill.
        record.status = OrderStatus::Filled;
        assert!(!record.invariants_hold());

        record.filled_quantity = dec!(1);
        assert!(record.invariants_hold());

        // Overfill is always a violation.
        record.filled_quantity = dec!(1.1);
        assert!(!record.invariants_hold());
    }

    #[test]
    fn test_profit_split_scenario() {
        // Sell fills at 105 x 2 with 0.50 fees: net 209.50.
        let net = dec!(105) * dec!(2) - dec!(0.50);
        let split = ProfitDistribution::split("order-1".into(), net, dec!(70), Some(5));

        assert_eq!(split.total_proceeds, dec!(209.50));
        assert_eq!(split.reinvestment, dec!(146.65));
        assert_eq!(split.extraction, dec!(62.85));
    }

    #[test]
    fn test_profit_split_sums_exactly() {
        for net in [dec!(0), dec!(0.01), dec!(123.4567), dec!(99999.999999)] {
            let split = ProfitDistribution::split("order".into(), net, dec!(70), None);
            assert_eq!(split.reinvestment + split.extraction, net);
        }
    }

    #[test]
    fn test_metadata_serializes_camel_case() {
        let metadata = OrderMetadata {
            is_profit_taking: true,
            note: None,
        };
        let json = serde_json::to_value(&metadata).unwrap();
        assert_eq!(json["isProfitTaking"], true);
    }
}
