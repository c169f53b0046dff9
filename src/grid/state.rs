//! Per-pair grid state and the level-to-order mapping.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::exchange::OrderSide;
use crate::persistence::GridStateRow;

use super::geometry::GridGeometry;

/// Lifecycle of one grid order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridOrderStatus {
    Pending,
    Placed,
    Filled,
    Cancelled,
}

/// One resting order at a grid level.
#[derive(Debug, Clone)]
pub struct GridOrder {
    pub id: String,
    pub level: u32,
    pub price: Decimal,
    pub size: Decimal,
    pub side: OrderSide,
    pub external_order_id: Option<String>,
    pub status: GridOrderStatus,
    pub timestamp: DateTime<Utc>,
}

impl GridOrder {
    /// Placed and filled orders must carry the venue's id.
    pub fn invariants_hold(&self, geometry: &GridGeometry) -> bool {
        if matches!(self.status, GridOrderStatus::Placed | GridOrderStatus::Filled)
            && self.external_order_id.is_none()
        {
            return false;
        }
        self.price >= geometry.lower && self.price <= geometry.upper
    }
}

/// Grid state for one trading pair.
#[derive(Debug, Clone)]
pub struct GridState {
    pub trading_pair: String,
    pub current_price: Decimal,
    pub geometry: GridGeometry,
    pub active_buy_orders: u32,
    pub active_sell_orders: u32,
    pub total_invested: Decimal,
    pub current_profit: Decimal,
    pub last_rebalance_time: DateTime<Utc>,
    /// At most one order per grid level
    pub orders: HashMap<u32, GridOrder>,
}

impl GridState {
    pub fn new(trading_pair: String, current_price: Decimal, geometry: GridGeometry) -> Self {
        Self {
            trading_pair,
            current_price,
            geometry,
            active_buy_orders: 0,
            active_sell_orders: 0,
            total_invested: Decimal::ZERO,
            current_profit: Decimal::ZERO,
            last_rebalance_time: Utc::now(),
            orders: HashMap::new(),
        }
    }

    /// Install an order at its level, replacing any previous occupant,
    /// and keep the side counters in line with the map.
    pub fn insert_order(&mut self, order: GridOrder) {
        let side = order.side;
        if let Some(previous) = self.orders.insert(order.level, order) {
            self.decrement_side(previous.side);
        }
        match side {
            OrderSide::Buy => self.active_buy_orders += 1,
            OrderSide::Sell => self.active_sell_orders += 1,
        }
    }

    fn decrement_side(&mut self, side: OrderSide) {
        match side {
            OrderSide::Buy => self.active_buy_orders = self.active_buy_orders.saturating_sub(1),
            OrderSide::Sell => self.active_sell_orders = self.active_sell_orders.saturating_sub(1),
        }
    }

    /// Remove a level's order, keeping the counters consistent.
    pub fn remove_level(&mut self, level: u32) -> Option<GridOrder> {
        let order = self.orders.remove(&level)?;
        self.decrement_side(order.side);
        Some(order)
    }

    /// Counter invariant: the side counters equal the actual tallies, and
    /// every order individually holds its own invariants.
    pub fn invariants_hold(&self) -> bool {
        let buys = self
            .orders
            .values()
            .filter(|o| o.side == OrderSide::Buy)
            .count() as u32;
        let sells = self
            .orders
            .values()
            .filter(|o| o.side == OrderSide::Sell)
            .count() as u32;

        self.active_buy_orders == buys
            && self.active_sell_orders == sells
            && self
                .orders
                .values()
                .all(|order| order.invariants_hold(&self.geometry))
    }

    /// Persistence row for the current state.
    pub fn to_row(&self) -> GridStateRow {
        GridStateRow {
            trading_pair: self.trading_pair.clone(),
            current_price: self.current_price,
            grid_upper_bound: self.geometry.upper,
            grid_lower_bound: self.geometry.lower,
            grid_spacing: self.geometry.spacing_fraction,
            total_grid_levels: self.geometry.levels,
            active_buy_orders: self.active_buy_orders,
            active_sell_orders: self.active_sell_orders,
            total_invested: self.total_invested,
            current_profit: self.current_profit,
            last_rebalance_time: self.last_rebalance_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn order_at(level: u32, price: Decimal, side: OrderSide) -> GridOrder {
        GridOrder {
            id: format!("grid-{level}"),
            level,
            price,
            size: dec!(0.01),
            side,
            external_order_id: Some(format!("EXT-{level}")),
            status: GridOrderStatus::Placed,
            timestamp: Utc::now(),
        }
    }

    fn state_with_orders() -> GridState {
        let geometry = GridGeometry::around(dec!(100), dec!(0.10), 10);
        let mut state = GridState::new("XBT/USD".to_string(), dec!(100), geometry);
        state.insert_order(order_at(2, dec!(94), OrderSide::Buy));
        state.insert_order(order_at(4, dec!(98), OrderSide::Buy));
        state.insert_order(order_at(7, dec!(104), OrderSide::Sell));
        state
    }

    #[test]
    fn test_counters_track_side_tallies() {
        let mut state = state_with_orders();
        assert_eq!(state.active_buy_orders, 2);
        assert_eq!(state.active_sell_orders, 1);
        assert!(state.invariants_hold());
        assert_eq!(
            state.active_buy_orders + state.active_sell_orders,
            state.orders.len() as u32
        );

        state.remove_level(2);
        assert_eq!(state.active_buy_orders, 1);
        assert!(state.invariants_hold());

        // Removing an empty level changes nothing.
        assert!(state.remove_level(9).is_none());
        assert!(state.invariants_hold());
    }

    #[test]
    fn test_one_order_per_level() {
        let mut state = state_with_orders();
        // Replacing level 7 swaps the occupant without double counting.
        state.insert_order(order_at(7, dec!(106), OrderSide::Sell));
        assert_eq!(state.orders.len(), 3);
        assert_eq!(state.active_sell_orders, 1);
        assert!(state.invariants_hold());
    }

    #[test]
    fn test_placed_order_requires_external_id() {
        let mut state = state_with_orders();
        let mut order = order_at(8, dec!(106), OrderSide::Sell);
        order.external_order_id = None;
        state.insert_order(order);
        assert!(!state.invariants_hold());
    }

    #[test]
    fn test_out_of_bounds_price_violates_invariants() {
        let mut state = state_with_orders();
        state.insert_order(order_at(9, dec!(120), OrderSide::Sell));
        assert!(!state.invariants_hold());
    }
}
