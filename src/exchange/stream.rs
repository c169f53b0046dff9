//! Exchange WebSocket stream supervisor.
//!
//! Connects to the venue's public stream, normalizes payloads into typed
//! [`StreamEvent`]s, and reconnects with exponential backoff (5 s start,
//! doubling, capped at 30 s, at most 10 attempts).

use crate::exchange::types::*;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

const WS_URL: &str = "wss://ws.kraken.com";

const RECONNECT_BASE: Duration = Duration::from_secs(5);
const RECONNECT_CAP: Duration = Duration::from_secs(30);
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Deadline on the TCP/TLS handshake, matching the default external-call
/// deadline used by the REST paths.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Public market-data stream for a fixed set of pairs.
pub struct MarketStream {
    url: String,
    pairs: Vec<String>,
}

impl MarketStream {
    pub fn new(pairs: Vec<String>) -> Self {
        Self {
            url: WS_URL.to_string(),
            pairs,
        }
    }

    /// Drive the stream until shutdown, reconnecting on failure.
    ///
    /// Emits `Connected`/`Disconnected` transitions and a final `Error`
    /// event when the reconnect budget is exhausted.
    pub async fn run(self, tx: mpsc::Sender<StreamEvent>, mut shutdown: watch::Receiver<bool>) {
        let mut attempts = 0u32;
        let mut backoff = RECONNECT_BASE;

        loop {
            if *shutdown.borrow() {
                return;
            }

            // The session gets its own shutdown handle so this level can
            // still race the connect phase against shutdown.
            let mut session_shutdown = shutdown.clone();
            let outcome = tokio::select! {
                outcome = self.connect_once(&tx, &mut session_shutdown) => outcome,
                _ = shutdown.changed() => {
                    info!("stream shutting down during connect");
                    return;
                }
            };

            match outcome {
                Ok(clean_shutdown) => {
                    if clean_shutdown {
                        return;
                    }
                    // Connection lived; reset the backoff schedule.
                    attempts = 0;
                    backoff = RECONNECT_BASE;
                }
                Err(e) => {
                    attempts += 1;
                    warn!(attempt = attempts, error = %e, "stream connection failed");

                    if attempts >= MAX_RECONNECT_ATTEMPTS {
                        error!("reconnect budget exhausted, stream stopping");
                        let _ = tx
                            .send(StreamEvent::Error(
                                "reconnect budget exhausted".to_string(),
                            ))
                            .await;
                        return;
                    }
                }
            }

            let _ = tx.send(StreamEvent::Disconnected).await;

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => return,
            }
            backoff = (backoff * 2).min(RECONNECT_CAP);
        }
    }

    /// One connection lifetime. Returns Ok(true) on requested shutdown,
    /// Ok(false) when the server closed the connection.
    async fn connect_once(
        &self,
        tx: &mpsc::Sender<StreamEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<bool> {
        info!(url = %self.url, "connecting to market stream");

        let (ws_stream, _) = match tokio::time::timeout(CONNECT_TIMEOUT, connect_async(&self.url))
            .await
        {
            Ok(connected) => connected.context("Failed to connect to WebSocket")?,
            Err(_) => anyhow::bail!(
                "connection attempt exceeded {}s deadline",
                CONNECT_TIMEOUT.as_secs()
            ),
        };
        let (mut write, mut read) = ws_stream.split();

        for channel in ["ticker", "book", "trade", "ohlc"] {
            let subscribe = json!({
                "event": "subscribe",
                "pair": self.pairs,
                "subscription": {"name": channel},
            });
            write
                .send(Message::Text(subscribe.to_string().into()))
                .await
                .context("Failed to send subscription")?;
        }

        let _ = tx.send(StreamEvent::Connected).await;

        loop {
            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        for event in parse_message(&text) {
                            if tx.send(event).await.is_err() {
                                warn!("stream event receiver dropped");
                                return Ok(true);
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_))) => {
                        debug!("received ping");
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("stream closed by server");
                        return Ok(false);
                    }
                    Some(Err(e)) => {
                        error!("stream error: {e}");
                        return Ok(false);
                    }
                    None => return Ok(false),
                    _ => {}
                },
                _ = shutdown.changed() => {
                    info!("stream shutting down");
                    return Ok(true);
                }
            }
        }
    }
}

/// Parse one raw frame into zero or more normalized events.
///
/// Data frames are arrays `[channel_id, payload, channel_name, pair]`;
/// objects carry subscription and system events.
fn parse_message(text: &str) -> Vec<StreamEvent> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => return Vec::new(),
    };

    let Some(frame) = value.as_array() else {
        // System/subscription events carry no market data.
        return Vec::new();
    };
    if frame.len() < 4 {
        return Vec::new();
    }

    let channel = frame[frame.len() - 2].as_str().unwrap_or_default();
    let pair = frame[frame.len() - 1].as_str().unwrap_or_default().to_string();
    let payload = &frame[1];

    match channel {
        "ticker" => parse_ticker(pair, payload).map(StreamEvent::Ticker).into_iter().collect(),
        "trade" => parse_trades(pair, payload),
        c if c.starts_with("ohlc") => {
            parse_ohlc(pair, payload).map(StreamEvent::Ohlc).into_iter().collect()
        }
        c if c.starts_with("book") => {
            // Book updates may carry separate ask and bid payload objects.
            let payloads = &frame[1..frame.len() - 2];
            parse_book(pair, payloads)
                .map(StreamEvent::OrderBook)
                .into_iter()
                .collect()
        }
        _ => Vec::new(),
    }
}

fn dec_at(value: &Value, indices: &[usize]) -> Option<Decimal> {
    let mut current = value;
    for &i in indices {
        current = current.get(i)?;
    }
    Decimal::from_str(current.as_str()?).ok()
}

fn ts_from_secs(value: &Value) -> DateTime<Utc> {
    let seconds = value
        .as_str()
        .and_then(|s| f64::from_str(s).ok())
        .or_else(|| value.as_f64())
        .unwrap_or_default();
    DateTime::from_timestamp(seconds as i64, ((seconds.fract()) * 1e9) as u32)
        .unwrap_or_else(Utc::now)
}

fn parse_ticker(pair: String, payload: &Value) -> Option<TickerData> {
    Some(TickerData {
        pair,
        ask: dec_at(&payload["a"], &[0])?,
        bid: dec_at(&payload["b"], &[0])?,
        last: dec_at(&payload["c"], &[0])?,
        volume_24h: dec_at(&payload["v"], &[1])?,
        vwap_24h: dec_at(&payload["p"], &[1])?,
        trade_count_24h: payload["t"].get(1).and_then(Value::as_u64).unwrap_or(0),
        open_24h: dec_at(&payload["o"], &[1])?,
        timestamp: Utc::now(),
    })
}

fn parse_trades(pair: String, payload: &Value) -> Vec<StreamEvent> {
    let Some(trades) = payload.as_array() else {
        return Vec::new();
    };

    trades
        .iter()
        .filter_map(|entry| {
            let side = match entry.get(3).and_then(Value::as_str) {
                Some("s") => OrderSide::Sell,
                _ => OrderSide::Buy,
            };
            Some(StreamEvent::Trade(TradeData {
                pair: pair.clone(),
                price: dec_at(entry, &[0])?,
                volume: dec_at(entry, &[1])?,
                side,
                timestamp: ts_from_secs(entry.get(2)?),
            }))
        })
        .collect()
}

fn parse_ohlc(pair: String, payload: &Value) -> Option<OhlcData> {
    Some(OhlcData {
        pair,
        open: dec_at(payload, &[2])?,
        high: dec_at(payload, &[3])?,
        low: dec_at(payload, &[4])?,
        close: dec_at(payload, &[5])?,
        volume: dec_at(payload, &[7])?,
        timestamp: ts_from_secs(payload.get(0)?),
    })
}

fn parse_book(pair: String, payloads: &[Value]) -> Option<BookData> {
    let levels = |keys: [&str; 2]| -> Vec<BookLevel> {
        payloads
            .iter()
            .flat_map(|payload| keys.iter().filter_map(|key| payload.get(key)))
            .filter_map(Value::as_array)
            .flatten()
            .filter_map(|entry| {
                Some(BookLevel {
                    price: dec_at(entry, &[0])?,
                    volume: dec_at(entry, &[1])?,
                    timestamp: ts_from_secs(entry.get(2)?),
                })
            })
            .collect()
    };

    // Snapshot frames use "bs"/"as", incremental updates "b"/"a".
    let bids = levels(["bs", "b"]);
    let asks = levels(["as", "a"]);
    if bids.is_empty() && asks.is_empty() {
        return None;
    }

    Some(BookData {
        pair,
        bids,
        asks,
        timestamp: Utc::now(),
    })
}
