//! Per-symbol market-data snapshot store.
//!
//! Keeps the latest ticker and order book, a bounded ring of recent
//! trades, and a price-history ring used to derive the 24 h change.
//! Updates are applied in exchange-timestamp order per symbol; a watchdog
//! emits `StaleData` for symbols that have gone silent.

use super::types::*;
use crate::exchange::{BookData, StreamEvent, TickerData, TradeData};
use crate::utils::events::EventHub;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Maximum trades retained per symbol.
const TRADE_RING_CAPACITY: usize = 100;

/// Maximum price samples retained per symbol (one-per-minute budget).
const PRICE_HISTORY_CAPACITY: usize = 1440;

#[derive(Debug, Default)]
struct SymbolState {
    ticker: Option<ProcessedTicker>,
    order_book: Option<ProcessedOrderBook>,
    recent_trades: VecDeque<ProcessedTrade>,
    price_history: VecDeque<(DateTime<Utc>, Decimal)>,
    last_update: Option<DateTime<Utc>>,
}

impl SymbolState {
    /// Percent change between the oldest and newest history samples.
    fn change_24h(&self) -> Decimal {
        match (self.price_history.front(), self.price_history.back()) {
            (Some((_, oldest)), Some((_, latest))) if !oldest.is_zero() => {
                (latest - oldest) / oldest * dec!(100)
            }
            _ => Decimal::ZERO,
        }
    }
}

/// Snapshot store shared read-only with other subsystems.
pub struct SnapshotStore {
    symbols: RwLock<HashMap<String, SymbolState>>,
    hub: EventHub<MarketDataEvent>,
    stale_after: Duration,
}

impl SnapshotStore {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            symbols: RwLock::new(HashMap::new()),
            hub: EventHub::new("market_data"),
            stale_after,
        }
    }

    /// Register an event subscriber. Call before the loops start.
    pub fn subscribe_events(&mut self) -> mpsc::Receiver<MarketDataEvent> {
        self.hub.subscribe()
    }

    /// Apply a ticker update, dropping out-of-order frames.
    pub async fn apply_ticker(&self, ticker: TickerData) {
        let event = {
            let mut symbols = self.symbols.write().expect("snapshot store lock poisoned");
            let state = symbols.entry(ticker.pair.clone()).or_default();

            if let Some(existing) = &state.ticker {
                if ticker.timestamp < existing.timestamp {
                    debug!(symbol = %ticker.pair, "dropping out-of-order ticker");
                    return;
                }
            }

            state.price_history.push_back((ticker.timestamp, ticker.last));
            while state.price_history.len() > PRICE_HISTORY_CAPACITY {
                state.price_history.pop_front();
            }

            state.ticker = Some(ProcessedTicker {
                symbol: ticker.pair.clone(),
                bid: ticker.bid,
                ask: ticker.ask,
                last: ticker.last,
                spread: ticker.ask - ticker.bid,
                volume_24h: ticker.volume_24h,
                change_24h: state.change_24h(),
                vwap_24h: ticker.vwap_24h,
                timestamp: ticker.timestamp,
            });
            state.last_update = Some(Utc::now());

            MarketDataEvent::Tick {
                symbol: ticker.pair,
                price: ticker.last,
            }
        };

        self.hub.publish(event).await;
    }

    /// Apply an order book update, keeping price-time priority ordering.
    pub fn apply_order_book(&self, book: BookData) {
        let mut symbols = self.symbols.write().expect("snapshot store lock poisoned");
        let state = symbols.entry(book.pair.clone()).or_default();

        let mut bids = book.bids;
        bids.sort_by(|a, b| b.price.cmp(&a.price).then(a.timestamp.cmp(&b.timestamp)));
        let mut asks = book.asks;
        asks.sort_by(|a, b| a.price.cmp(&b.price).then(a.timestamp.cmp(&b.timestamp)));

        state.order_book = Some(ProcessedOrderBook {
            symbol: book.pair,
            bids,
            asks,
            timestamp: book.timestamp,
        });
        state.last_update = Some(Utc::now());
    }

    /// Record a public trade in the bounded ring.
    pub fn apply_trade(&self, trade: TradeData) {
        let mut symbols = self.symbols.write().expect("snapshot store lock poisoned");
        let state = symbols.entry(trade.pair.clone()).or_default();

        state.recent_trades.push_back(ProcessedTrade {
            symbol: trade.pair,
            price: trade.price,
            volume: trade.volume,
            side: trade.side,
            timestamp: trade.timestamp,
        });
        while state.recent_trades.len() > TRADE_RING_CAPACITY {
            state.recent_trades.pop_front();
        }
        state.last_update = Some(Utc::now());
    }

    /// Full snapshot for one symbol.
    pub fn snapshot(&self, symbol: &str) -> MarketDataSnapshot {
        let symbols = self.symbols.read().expect("snapshot store lock poisoned");
        symbols
            .get(symbol)
            .map(|state| MarketDataSnapshot {
                ticker: state.ticker.clone(),
                order_book: state.order_book.clone(),
                recent_trades: state.recent_trades.iter().cloned().collect(),
                last_update: state.last_update,
            })
            .unwrap_or_default()
    }

    /// Latest trade price for a symbol.
    pub fn last_price(&self, symbol: &str) -> Option<Decimal> {
        let symbols = self.symbols.read().expect("snapshot store lock poisoned");
        symbols.get(symbol).and_then(|s| s.ticker.as_ref()).map(|t| t.last)
    }

    /// 24 h quote volume for a symbol, in quote currency.
    ///
    /// The venue reports base-currency volume; it is converted at VWAP.
    pub fn daily_volume(&self, symbol: &str) -> Option<Decimal> {
        let symbols = self.symbols.read().expect("snapshot store lock poisoned");
        symbols
            .get(symbol)
            .and_then(|s| s.ticker.as_ref())
            .map(|t| t.volume_24h * t.vwap_24h)
    }

    /// Symbols whose last update is older than the stale window.
    pub fn stale_symbols(&self, now: DateTime<Utc>) -> Vec<(String, u64)> {
        let symbols = self.symbols.read().expect("snapshot store lock poisoned");
        symbols
            .iter()
            .filter_map(|(symbol, state)| {
                let last = state.last_update?;
                let age = (now - last).num_seconds().max(0) as u64;
                (age >= self.stale_after.as_secs()).then(|| (symbol.clone(), age))
            })
            .collect()
    }

    /// Consume the exchange stream, applying events in arrival order.
    pub async fn run_ingest(
        self: Arc<Self>,
        mut events: mpsc::Receiver<StreamEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(StreamEvent::Ticker(ticker)) => self.apply_ticker(ticker).await,
                    Some(StreamEvent::OrderBook(book)) => self.apply_order_book(book),
                    Some(StreamEvent::Trade(trade)) => self.apply_trade(trade),
                    Some(StreamEvent::Connected) => info!("market stream connected"),
                    Some(StreamEvent::Disconnected) => warn!("market stream disconnected"),
                    Some(StreamEvent::Error(message)) => warn!(%message, "market stream error"),
                    Some(_) => {}
                    None => {
                        info!("market stream ended");
                        return;
                    }
                },
                _ = shutdown.changed() => return,
            }
        }
    }

    /// Periodic stale-data scan.
    pub async fn run_watchdog(
        self: Arc<Self>,
        scan_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(scan_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    for (symbol, age_secs) in self.stale_symbols(Utc::now()) {
                        warn!(%symbol, age_secs, "market data is stale");
                        self.hub
                            .publish(MarketDataEvent::StaleData { symbol, age_secs })
                            .await;
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{BookLevel, OrderSide};
    use chrono::TimeDelta;

    fn ticker_at(price: Decimal, timestamp: DateTime<Utc>) -> TickerData {
        TickerData {
            pair: "XBT/USD".to_string(),
            bid: price - dec!(5),
            ask: price + dec!(5),
            last: price,
            volume_24h: dec!(120),
            vwap_24h: price,
            trade_count_24h: 1000,
            open_24h: dec!(49000),
            timestamp,
        }
    }

    #[tokio::test]
    async fn test_ticker_updates_derive_spread_and_change() {
        let store = SnapshotStore::new(Duration::from_secs(60));
        let t0 = Utc::now();

        store.apply_ticker(ticker_at(dec!(50000), t0)).await;
        store
            .apply_ticker(ticker_at(dec!(51000), t0 + TimeDelta::seconds(60)))
            .await;

        let snapshot = store.snapshot("XBT/USD");
        let ticker = snapshot.ticker.unwrap();
        assert_eq!(ticker.last, dec!(51000));
        assert_eq!(ticker.spread, dec!(10));
        // (51000 - 50000) / 50000 * 100 = 2%
        assert_eq!(ticker.change_24h, dec!(2));
    }

    #[tokio::test]
    async fn test_out_of_order_ticker_is_dropped() {
        let store = SnapshotStore::new(Duration::from_secs(60));
        let t0 = Utc::now();

        store
            .apply_ticker(ticker_at(dec!(50000), t0 + TimeDelta::seconds(10)))
            .await;
        store.apply_ticker(ticker_at(dec!(49000), t0)).await;

        assert_eq!(store.last_price("XBT/USD"), Some(dec!(50000)));
    }

    #[tokio::test]
    async fn test_trade_ring_is_bounded() {
        let store = SnapshotStore::new(Duration::from_secs(60));

        for i in 0..150 {
            store.apply_trade(TradeData {
                pair: "XBT/USD".to_string(),
                price: dec!(50000) + Decimal::from(i),
                volume: dec!(0.01),
                side: OrderSide::Buy,
                timestamp: Utc::now(),
            });
        }

        let snapshot = store.snapshot("XBT/USD");
        assert_eq!(snapshot.recent_trades.len(), 100);
        // Oldest 50 were evicted.
        assert_eq!(snapshot.recent_trades[0].price, dec!(50050));
    }

    #[tokio::test]
    async fn test_order_book_sorted_by_price() {
        let store = SnapshotStore::new(Duration::from_secs(60));
        let now = Utc::now();
        let level = |price: Decimal| BookLevel {
            price,
            volume: dec!(1),
            timestamp: now,
        };

        store.apply_order_book(BookData {
            pair: "XBT/USD".to_string(),
            bids: vec![level(dec!(49990)), level(dec!(50000)), level(dec!(49995))],
            asks: vec![level(dec!(50020)), level(dec!(50010)), level(dec!(50015))],
            timestamp: now,
        });

        let book = store.snapshot("XBT/USD").order_book.unwrap();
        assert_eq!(book.bids[0].price, dec!(50000));
        assert_eq!(book.asks[0].price, dec!(50010));
    }

    #[tokio::test]
    async fn test_stale_detection() {
        let store = SnapshotStore::new(Duration::from_secs(60));
        store.apply_ticker(ticker_at(dec!(50000), Utc::now())).await;

        assert!(store.stale_symbols(Utc::now()).is_empty());

        let later = Utc::now() + TimeDelta::seconds(120);
        let stale = store.stale_symbols(later);
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].0, "XBT/USD");
        assert!(stale[0].1 >= 60);
    }

    #[tokio::test]
    async fn test_tick_events_reach_subscribers() {
        let mut store = SnapshotStore::new(Duration::from_secs(60));
        let mut events = store.subscribe_events();

        store.apply_ticker(ticker_at(dec!(50000), Utc::now())).await;

        match events.recv().await {
            Some(MarketDataEvent::Tick { symbol, price }) => {
                assert_eq!(symbol, "XBT/USD");
                assert_eq!(price, dec!(50000));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
