//! SQLite implementation of the table store.
//!
//! Decimals are stored as TEXT to round-trip exactly. Every write is a
//! single-row upsert keyed on the table's primary key, so repeated writes
//! of the same logical row are idempotent.

use super::{
    GridStateRow, OrderRow, PositionRow, ProfitDistributionRow, RiskMetricsRow, TradeStore,
};
use crate::error::TradingError;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::{debug, info};

/// SQLite-backed table store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn parse_decimal(text: &str) -> Decimal {
    Decimal::from_str(text).unwrap_or_default()
}

fn parse_timestamp(text: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl SqliteStore {
    /// Open (or create) the database and initialize the schema.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, TradingError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| TradingError::Persistence(e.to_string()))?;
            }
        }

        let conn = Connection::open(db_path.as_ref())?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        info!("sqlite store initialized at {:?}", db_path.as_ref());
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self, TradingError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), TradingError> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        conn.execute_batch(
            r#"
            -- Grid state snapshots (one row per trading pair)
            CREATE TABLE IF NOT EXISTS grid_state (
                trading_pair TEXT PRIMARY KEY,
                current_price TEXT NOT NULL,
                grid_upper_bound TEXT NOT NULL,
                grid_lower_bound TEXT NOT NULL,
                grid_spacing TEXT NOT NULL,
                total_grid_levels INTEGER NOT NULL,
                active_buy_orders INTEGER NOT NULL,
                active_sell_orders INTEGER NOT NULL,
                total_invested TEXT NOT NULL,
                current_profit TEXT NOT NULL,
                last_rebalance_time TEXT NOT NULL
            );

            -- Canonical order records
            CREATE TABLE IF NOT EXISTS orders (
                id TEXT PRIMARY KEY,
                external_order_id TEXT UNIQUE,
                trading_pair TEXT NOT NULL,
                order_type TEXT NOT NULL,
                order_subtype TEXT NOT NULL,
                quantity TEXT NOT NULL,
                price TEXT,
                status TEXT NOT NULL,
                filled_quantity TEXT NOT NULL,
                average_fill_price TEXT,
                fees TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                strategy_id TEXT,
                grid_level INTEGER,
                profit_target TEXT,
                stop_loss TEXT,
                metadata TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);
            CREATE INDEX IF NOT EXISTS idx_orders_pair ON orders(trading_pair);

            -- Positions
            CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                trading_pair TEXT NOT NULL,
                grid_level INTEGER,
                entry_price TEXT NOT NULL,
                size TEXT NOT NULL,
                side TEXT NOT NULL,
                status TEXT NOT NULL,
                entry_time TEXT NOT NULL,
                exit_time TEXT,
                realized_pnl TEXT,
                strategy_type TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_positions_pair ON positions(trading_pair);

            -- Portfolio value history
            CREATE TABLE IF NOT EXISTS portfolio_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                portfolio_value TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_portfolio_timestamp ON portfolio_history(timestamp);

            -- Risk metrics history
            CREATE TABLE IF NOT EXISTS risk_metrics_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                portfolio_value TEXT NOT NULL,
                total_exposure TEXT NOT NULL,
                cash_reserves TEXT NOT NULL,
                max_drawdown TEXT NOT NULL,
                current_drawdown TEXT NOT NULL,
                drawdown_percent TEXT NOT NULL,
                portfolio_high TEXT NOT NULL,
                risk_level TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_risk_metrics_timestamp
                ON risk_metrics_history(timestamp);

            -- Risk events (append-only audit)
            CREATE TABLE IF NOT EXISTS risk_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                event_type TEXT NOT NULL,
                data TEXT NOT NULL,
                snapshot TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_risk_events_timestamp ON risk_events(timestamp);

            -- Profit distributions
            CREATE TABLE IF NOT EXISTS profit_distributions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                order_id TEXT NOT NULL,
                total_proceeds TEXT NOT NULL,
                reinvestment_amount TEXT NOT NULL,
                profit_extraction TEXT NOT NULL,
                grid_level INTEGER,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_profit_order ON profit_distributions(order_id);
            "#,
        )?;

        debug!("database schema initialized");
        Ok(())
    }
}

impl TradeStore for SqliteStore {
    fn save_grid_state(&self, row: &GridStateRow) -> Result<(), TradingError> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        conn.execute(
            r#"
            INSERT INTO grid_state (trading_pair, current_price, grid_upper_bound,
                                    grid_lower_bound, grid_spacing, total_grid_levels,
                                    active_buy_orders, active_sell_orders, total_invested,
                                    current_profit, last_rebalance_time)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(trading_pair) DO UPDATE SET
                current_price = ?2,
                grid_upper_bound = ?3,
                grid_lower_bound = ?4,
                grid_spacing = ?5,
                total_grid_levels = ?6,
                active_buy_orders = ?7,
                active_sell_orders = ?8,
                total_invested = ?9,
                current_profit = ?10,
                last_rebalance_time = ?11
            "#,
            params![
                row.trading_pair,
                row.current_price.to_string(),
                row.grid_upper_bound.to_string(),
                row.grid_lower_bound.to_string(),
                row.grid_spacing.to_string(),
                row.total_grid_levels,
                row.active_buy_orders,
                row.active_sell_orders,
                row.total_invested.to_string(),
                row.current_profit.to_string(),
                row.last_rebalance_time.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn load_grid_state(&self, trading_pair: &str) -> Result<Option<GridStateRow>, TradingError> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        let row = conn
            .query_row(
                r#"
                SELECT trading_pair, current_price, grid_upper_bound, grid_lower_bound,
                       grid_spacing, total_grid_levels, active_buy_orders, active_sell_orders,
                       total_invested, current_profit, last_rebalance_time
                FROM grid_state WHERE trading_pair = ?1
                "#,
                params![trading_pair],
                |row| {
                    Ok(GridStateRow {
                        trading_pair: row.get(0)?,
                        current_price: parse_decimal(&row.get::<_, String>(1)?),
                        grid_upper_bound: parse_decimal(&row.get::<_, String>(2)?),
                        grid_lower_bound: parse_decimal(&row.get::<_, String>(3)?),
                        grid_spacing: parse_decimal(&row.get::<_, String>(4)?),
                        total_grid_levels: row.get(5)?,
                        active_buy_orders: row.get(6)?,
                        active_sell_orders: row.get(7)?,
                        total_invested: parse_decimal(&row.get::<_, String>(8)?),
                        current_profit: parse_decimal(&row.get::<_, String>(9)?),
                        last_rebalance_time: parse_timestamp(&row.get::<_, String>(10)?),
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn save_order(&self, row: &OrderRow) -> Result<(), TradingError> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        conn.execute(
            r#"
            INSERT INTO orders (id, external_order_id, trading_pair, order_type, order_subtype,
                                quantity, price, status, filled_quantity, average_fill_price,
                                fees, created_at, updated_at, strategy_id, grid_level,
                                profit_target, stop_loss, metadata)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
            ON CONFLICT(id) DO UPDATE SET
                external_order_id = ?2,
                status = ?8,
                filled_quantity = ?9,
                average_fill_price = ?10,
                fees = ?11,
                updated_at = ?13
            "#,
            params![
                row.id,
                row.external_order_id,
                row.trading_pair,
                row.order_type,
                row.order_subtype,
                row.quantity.to_string(),
                row.price.map(|p| p.to_string()),
                row.status,
                row.filled_quantity.to_string(),
                row.average_fill_price.map(|p| p.to_string()),
                row.fees.to_string(),
                row.created_at.to_rfc3339(),
                row.updated_at.to_rfc3339(),
                row.strategy_id,
                row.grid_level,
                row.profit_target.map(|p| p.to_string()),
                row.stop_loss.map(|p| p.to_string()),
                row.metadata.to_string(),
            ],
        )?;
        Ok(())
    }

    fn load_open_orders(&self) -> Result<Vec<OrderRow>, TradingError> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        let mut stmt = conn.prepare(
            r#"
            SELECT id, external_order_id, trading_pair, order_type, order_subtype,
                   quantity, price, status, filled_quantity, average_fill_price,
                   fees, created_at, updated_at, strategy_id, grid_level,
                   profit_target, stop_loss, metadata
            FROM orders
            WHERE status IN ('pending', 'open')
            "#,
        )?;

        let rows: Vec<OrderRow> = stmt
            .query_map([], |row| {
                Ok(OrderRow {
                    id: row.get(0)?,
                    external_order_id: row.get(1)?,
                    trading_pair: row.get(2)?,
                    order_type: row.get(3)?,
                    order_subtype: row.get(4)?,
                    quantity: parse_decimal(&row.get::<_, String>(5)?),
                    price: row.get::<_, Option<String>>(6)?.map(|p| parse_decimal(&p)),
                    status: row.get(7)?,
                    filled_quantity: parse_decimal(&row.get::<_, String>(8)?),
                    average_fill_price: row
                        .get::<_, Option<String>>(9)?
                        .map(|p| parse_decimal(&p)),
                    fees: parse_decimal(&row.get::<_, String>(10)?),
                    created_at: parse_timestamp(&row.get::<_, String>(11)?),
                    updated_at: parse_timestamp(&row.get::<_, String>(12)?),
                    strategy_id: row.get(13)?,
                    grid_level: row.get(14)?,
                    profit_target: row
                        .get::<_, Option<String>>(15)?
                        .map(|p| parse_decimal(&p)),
                    stop_loss: row.get::<_, Option<String>>(16)?.map(|p| parse_decimal(&p)),
                    metadata: serde_json::from_str(&row.get::<_, String>(17)?)
                        .unwrap_or(serde_json::Value::Null),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(rows)
    }

    fn save_position(&self, row: &PositionRow) -> Result<(), TradingError> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        conn.execute(
            r#"
            INSERT INTO positions (id, trading_pair, grid_level, entry_price, size, side,
                                   status, entry_time, exit_time, realized_pnl, strategy_type)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(id) DO UPDATE SET
                status = ?7,
                exit_time = ?9,
                realized_pnl = ?10
            "#,
            params![
                row.id,
                row.trading_pair,
                row.grid_level,
                row.entry_price.to_string(),
                row.size.to_string(),
                row.side,
                row.status,
                row.entry_time.to_rfc3339(),
                row.exit_time.map(|t| t.to_rfc3339()),
                row.realized_pnl.map(|p| p.to_string()),
                row.strategy_type,
            ],
        )?;
        Ok(())
    }

    fn record_portfolio_value(
        &self,
        timestamp: DateTime<Utc>,
        portfolio_value: Decimal,
    ) -> Result<(), TradingError> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        conn.execute(
            "INSERT INTO portfolio_history (timestamp, portfolio_value) VALUES (?1, ?2)",
            params![timestamp.to_rfc3339(), portfolio_value.to_string()],
        )?;
        Ok(())
    }

    fn record_risk_metrics(&self, row: &RiskMetricsRow) -> Result<(), TradingError> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        conn.execute(
            r#"
            INSERT INTO risk_metrics_history (timestamp, portfolio_value, total_exposure,
                                              cash_reserves, max_drawdown, current_drawdown,
                                              drawdown_percent, portfolio_high, risk_level)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                row.timestamp.to_rfc3339(),
                row.portfolio_value.to_string(),
                row.total_exposure.to_string(),
                row.cash_reserves.to_string(),
                row.max_drawdown.to_string(),
                row.current_drawdown.to_string(),
                row.drawdown_percent.to_string(),
                row.portfolio_high.to_string(),
                row.risk_level,
            ],
        )?;
        Ok(())
    }

    fn record_risk_event(
        &self,
        event_type: &str,
        data: &serde_json::Value,
        snapshot: &serde_json::Value,
    ) -> Result<(), TradingError> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        conn.execute(
            r#"
            INSERT INTO risk_events (timestamp, event_type, data, snapshot)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                Utc::now().to_rfc3339(),
                event_type,
                data.to_string(),
                snapshot.to_string(),
            ],
        )?;
        Ok(())
    }

    fn record_profit_distribution(&self, row: &ProfitDistributionRow) -> Result<(), TradingError> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        conn.execute(
            r#"
            INSERT INTO profit_distributions (order_id, total_proceeds, reinvestment_amount,
                                              profit_extraction, grid_level, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                row.order_id,
                row.total_proceeds.to_string(),
                row.reinvestment_amount.to_string(),
                row.profit_extraction.to_string(),
                row.grid_level,
                row.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn load_portfolio_high(&self) -> Result<Option<Decimal>, TradingError> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        let high: Option<String> = conn
            .query_row(
                r#"
                SELECT portfolio_high FROM risk_metrics_history
                ORDER BY id DESC LIMIT 1
                "#,
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(high.map(|h| parse_decimal(&h)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_grid_row() -> GridStateRow {
        GridStateRow {
            trading_pair: "XBT/USD".to_string(),
            current_price: dec!(50000),
            grid_upper_bound: dec!(55000),
            grid_lower_bound: dec!(45000),
            grid_spacing: dec!(0.02),
            total_grid_levels: 10,
            active_buy_orders: 5,
            active_sell_orders: 5,
            total_invested: dec!(1000),
            current_profit: dec!(12.5),
            last_rebalance_time: Utc::now(),
        }
    }

    #[test]
    fn test_grid_state_round_trip() {
        let store = SqliteStore::in_memory().unwrap();
        store.save_grid_state(&sample_grid_row()).unwrap();

        let loaded = store.load_grid_state("XBT/USD").unwrap().unwrap();
        assert_eq!(loaded.current_price, dec!(50000));
        assert_eq!(loaded.total_grid_levels, 10);
        assert_eq!(loaded.current_profit, dec!(12.5));

        assert!(store.load_grid_state("ETH/USD").unwrap().is_none());
    }

    #[test]
    fn test_grid_state_upsert_is_idempotent() {
        let store = SqliteStore::in_memory().unwrap();
        let mut row = sample_grid_row();
        store.save_grid_state(&row).unwrap();

        row.current_price = dec!(51000);
        store.save_grid_state(&row).unwrap();
        store.save_grid_state(&row).unwrap();

        let loaded = store.load_grid_state("XBT/USD").unwrap().unwrap();
        assert_eq!(loaded.current_price, dec!(51000));
    }

    #[test]
    fn test_order_save_and_open_filter() {
        let store = SqliteStore::in_memory().unwrap();
        let now = Utc::now();

        let mut order = OrderRow {
            id: "order-1".to_string(),
            external_order_id: Some("EXT-1".to_string()),
            trading_pair: "XBT/USD".to_string(),
            order_type: "buy".to_string(),
            order_subtype: "limit".to_string(),
            quantity: dec!(0.1),
            price: Some(dec!(50000)),
            status: "open".to_string(),
            filled_quantity: Decimal::ZERO,
            average_fill_price: None,
            fees: Decimal::ZERO,
            created_at: now,
            updated_at: now,
            strategy_id: Some("grid".to_string()),
            grid_level: Some(3),
            profit_target: None,
            stop_loss: Some(dec!(45000)),
            metadata: serde_json::json!({"isProfitTaking": false}),
        };
        store.save_order(&order).unwrap();
        assert_eq!(store.load_open_orders().unwrap().len(), 1);

        order.status = "filled".to_string();
        order.filled_quantity = dec!(0.1);
        order.average_fill_price = Some(dec!(50010));
        store.save_order(&order).unwrap();
        assert!(store.load_open_orders().unwrap().is_empty());
    }

    #[test]
    fn test_portfolio_high_tracks_latest_metrics_row() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.load_portfolio_high().unwrap().is_none());

        for high in [dec!(100000), dec!(105000)] {
            store
                .record_risk_metrics(&RiskMetricsRow {
                    timestamp: Utc::now(),
                    portfolio_value: high,
                    total_exposure: dec!(40000),
                    cash_reserves: high - dec!(40000),
                    max_drawdown: Decimal::ZERO,
                    current_drawdown: Decimal::ZERO,
                    drawdown_percent: Decimal::ZERO,
                    portfolio_high: high,
                    risk_level: "LOW".to_string(),
                })
                .unwrap();
        }

        assert_eq!(store.load_portfolio_high().unwrap(), Some(dec!(105000)));
    }

    #[test]
    fn test_profit_distribution_insert() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .record_profit_distribution(&ProfitDistributionRow {
                order_id: "order-1".to_string(),
                total_proceeds: dec!(209.50),
                reinvestment_amount: dec!(146.65),
                profit_extraction: dec!(62.85),
                grid_level: Some(5),
                timestamp: Utc::now(),
            })
            .unwrap();
    }
}
