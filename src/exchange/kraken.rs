//! Kraken REST API client.

use crate::config::{ExchangeConfig, ExecutionConfig};
use crate::error::TradingError;
use crate::exchange::rate_limit::RateLimiter;
use crate::exchange::traits::ExchangeClient;
use crate::exchange::types::*;
use crate::utils::decimal::{quantize_price, quantize_volume};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::{Digest, Sha256, Sha512};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{debug, instrument};

const BASE_URL: &str = "https://api.kraken.com";

/// Kraken API client for spot trading.
pub struct KrakenClient {
    http: Client,
    api_key: String,
    api_secret: String,
    base_url: String,
    limiter: Arc<RateLimiter>,
    nonce: AtomicU64,
    /// Trading rules per pair, fetched lazily
    pair_specs: RwLock<HashMap<String, PairSpec>>,
}

/// Response envelope shared by every endpoint.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    error: Vec<String>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct AddOrderResult {
    descr: AddOrderDescr,
    txid: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AddOrderDescr {
    order: String,
}

#[derive(Debug, Deserialize)]
struct CancelOrderResult {
    count: u32,
    #[serde(default)]
    pending: bool,
}

#[derive(Debug, Deserialize)]
struct OpenOrdersResult {
    open: HashMap<String, RawOrderInfo>,
}

#[derive(Debug, Deserialize)]
struct RawOrderInfo {
    status: String,
    descr: RawOrderDescr,
    #[serde(with = "rust_decimal::serde::str")]
    vol: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    vol_exec: Decimal,
    /// Average fill price; "0.00000" until the first fill
    #[serde(with = "rust_decimal::serde::str")]
    price: Decimal,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    fee: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct RawOrderDescr {
    pair: String,
    #[serde(rename = "type")]
    side: String,
    ordertype: String,
    price: String,
}

#[derive(Debug, Deserialize)]
struct RawPairInfo {
    #[serde(default)]
    wsname: Option<String>,
    pair_decimals: u32,
    lot_decimals: u32,
    #[serde(default)]
    ordermin: Option<String>,
    #[serde(default)]
    tick_size: Option<String>,
}

impl KrakenClient {
    /// Create a new Kraken client from configuration.
    pub fn new(
        config: &ExchangeConfig,
        execution: &ExecutionConfig,
        limiter: Arc<RateLimiter>,
    ) -> Result<Self, TradingError> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(execution.request_timeout_secs))
            .build()
            .map_err(|e| TradingError::Transport(format!("Failed to create HTTP client: {e}")))?;

        let nonce_seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| TradingError::Transport(e.to_string()))?
            .as_millis() as u64;

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            base_url: BASE_URL.to_string(),
            limiter,
            nonce: AtomicU64::new(nonce_seed),
            pair_specs: RwLock::new(HashMap::new()),
        })
    }

    /// Strictly increasing nonce for private calls.
    fn next_nonce(&self) -> u64 {
        self.nonce.fetch_add(1, Ordering::SeqCst)
    }

    /// Generate the API-Sign header: HMAC-SHA512 over the URI path and
    /// SHA256(nonce + postdata), keyed with the base64-decoded secret.
    fn sign(&self, path: &str, nonce: u64, postdata: &str) -> Result<String, TradingError> {
        let secret = B64
            .decode(&self.api_secret)
            .map_err(|_| TradingError::Validation("API secret is not valid base64".into()))?;

        let mut hasher = Sha256::new();
        hasher.update(nonce.to_string().as_bytes());
        hasher.update(postdata.as_bytes());
        let digest = hasher.finalize();

        let mut mac = Hmac::<Sha512>::new_from_slice(&secret)
            .map_err(|e| TradingError::Validation(format!("Invalid API secret: {e}")))?;
        mac.update(path.as_bytes());
        mac.update(&digest);

        Ok(B64.encode(mac.finalize().into_bytes()))
    }

    /// Convert "XBT/USD" into the REST pair name "XBTUSD".
    fn rest_pair(pair: &str) -> String {
        pair.replace('/', "")
    }

    /// Unwrap the response envelope, mapping venue errors to the taxonomy.
    fn unwrap_envelope<T>(envelope: Envelope<T>) -> Result<T, TradingError> {
        if let Some(message) = envelope.error.first() {
            return Err(TradingError::Exchange(message.clone()));
        }
        envelope
            .result
            .ok_or_else(|| TradingError::Transport("response carried no result".into()))
    }

    async fn public_get<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> Result<T, TradingError> {
        self.limiter.acquire().await;

        let url = format!("{}/0/public/{}", self.base_url, endpoint);
        let response = self.http.get(&url).query(query).send().await?;
        let envelope: Envelope<T> = response.json().await?;
        Self::unwrap_envelope(envelope)
    }

    async fn private_post<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        mut params: Vec<(String, String)>,
    ) -> Result<T, TradingError> {
        self.limiter.acquire().await;

        let nonce = self.next_nonce();
        params.insert(0, ("nonce".to_string(), nonce.to_string()));

        let postdata: String = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let path = format!("/0/private/{}", endpoint);
        let signature = self.sign(&path, nonce, &postdata)?;

        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .post(&url)
            .header("API-Key", &self.api_key)
            .header("API-Sign", signature)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(postdata)
            .send()
            .await?;

        let envelope: Envelope<T> = response.json().await?;
        Self::unwrap_envelope(envelope)
    }

    fn parse_status(status: &str) -> ExchangeOrderStatus {
        match status {
            "pending" => ExchangeOrderStatus::Pending,
            "open" => ExchangeOrderStatus::Open,
            "closed" => ExchangeOrderStatus::Closed,
            "canceled" => ExchangeOrderStatus::Canceled,
            "expired" => ExchangeOrderStatus::Expired,
            other => {
                debug!(status = other, "unrecognized order status, treating as open");
                ExchangeOrderStatus::Open
            }
        }
    }

    fn parse_order_info(external_order_id: &str, raw: &RawOrderInfo) -> OpenOrderInfo {
        let side = match raw.descr.side.as_str() {
            "sell" => OrderSide::Sell,
            _ => OrderSide::Buy,
        };
        let kind = match raw.descr.ordertype.as_str() {
            "market" => OrderKind::Market,
            "stop-loss" => OrderKind::StopLoss,
            "take-profit" => OrderKind::TakeProfit,
            _ => OrderKind::Limit,
        };

        OpenOrderInfo {
            external_order_id: external_order_id.to_string(),
            pair: raw.descr.pair.clone(),
            side,
            kind,
            price: Decimal::from_str(&raw.descr.price).ok().filter(|p| !p.is_zero()),
            volume: raw.vol,
            volume_executed: raw.vol_exec,
            average_price: (!raw.price.is_zero()).then_some(raw.price),
            fee: raw.fee.unwrap_or_default(),
            status: Self::parse_status(&raw.status),
        }
    }

    /// Fetch and cache the trading rules for one pair.
    async fn pair_spec(&self, pair: &str) -> Result<PairSpec, TradingError> {
        if let Some(spec) = self.pair_specs.read().await.get(pair) {
            return Ok(spec.clone());
        }

        let rest_pair = Self::rest_pair(pair);
        let result: HashMap<String, RawPairInfo> = self
            .public_get("AssetPairs", &[("pair", rest_pair.clone())])
            .await?;

        let raw = result
            .values()
            .find(|info| {
                info.wsname.as_deref() == Some(pair)
                    || result.len() == 1
            })
            .ok_or_else(|| TradingError::Exchange(format!("unknown pair {pair}")))?;

        let price_tick = raw
            .tick_size
            .as_deref()
            .and_then(|t| Decimal::from_str(t).ok())
            .unwrap_or_else(|| Decimal::new(1, raw.pair_decimals));
        let lot_step = Decimal::new(1, raw.lot_decimals);
        let min_volume = raw
            .ordermin
            .as_deref()
            .and_then(|m| Decimal::from_str(m).ok())
            .unwrap_or(lot_step);

        let spec = PairSpec {
            pair: pair.to_string(),
            price_tick,
            lot_step,
            min_volume,
        };

        self.pair_specs
            .write()
            .await
            .insert(pair.to_string(), spec.clone());
        Ok(spec)
    }
}

#[async_trait]
impl ExchangeClient for KrakenClient {
    #[instrument(skip(self, order), fields(pair = %order.pair))]
    async fn place_order(&self, order: &NewOrderRequest) -> Result<PlacedOrder, TradingError> {
        let mut params = vec![
            ("pair".to_string(), Self::rest_pair(&order.pair)),
            ("type".to_string(), order.side.as_str().to_string()),
            ("ordertype".to_string(), order.kind.as_str().to_string()),
            ("volume".to_string(), order.volume.to_string()),
        ];

        if let Some(price) = order.price {
            params.push(("price".to_string(), price.to_string()));
        }
        if let Some(client_ref) = &order.client_ref {
            params.push(("cl_ord_id".to_string(), client_ref.clone()));
        }

        debug!(?order, "placing order");

        let result: AddOrderResult = self.private_post("AddOrder", params).await?;
        let external_order_id = result
            .txid
            .into_iter()
            .next()
            .ok_or_else(|| TradingError::Exchange("AddOrder returned no txid".into()))?;

        Ok(PlacedOrder {
            external_order_id,
            descriptor: result.descr.order,
        })
    }

    #[instrument(skip(self))]
    async fn cancel_order(&self, external_order_id: &str) -> Result<CancelResult, TradingError> {
        let params = vec![("txid".to_string(), external_order_id.to_string())];
        let result: CancelOrderResult = self.private_post("CancelOrder", params).await?;

        Ok(CancelResult {
            count: result.count,
            pending: result.pending,
        })
    }

    #[instrument(skip(self))]
    async fn get_open_orders(&self) -> Result<HashMap<String, OpenOrderInfo>, TradingError> {
        let result: OpenOrdersResult = self.private_post("OpenOrders", Vec::new()).await?;

        Ok(result
            .open
            .iter()
            .map(|(id, raw)| (id.clone(), Self::parse_order_info(id, raw)))
            .collect())
    }

    #[instrument(skip(self))]
    async fn get_order_status(
        &self,
        external_order_id: &str,
    ) -> Result<Option<OpenOrderInfo>, TradingError> {
        let params = vec![("txid".to_string(), external_order_id.to_string())];
        let result: Result<HashMap<String, RawOrderInfo>, TradingError> =
            self.private_post("QueryOrders", params).await;

        match result {
            Ok(orders) => Ok(orders
                .get(external_order_id)
                .map(|raw| Self::parse_order_info(external_order_id, raw))),
            Err(TradingError::Exchange(message)) if message.contains("Unknown order") => Ok(None),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    async fn get_account_balance(&self) -> Result<HashMap<String, Decimal>, TradingError> {
        let result: HashMap<String, String> = self.private_post("Balance", Vec::new()).await?;

        result
            .into_iter()
            .map(|(currency, amount)| {
                Decimal::from_str(&amount)
                    .map(|value| (currency, value))
                    .map_err(|e| TradingError::Exchange(format!("bad balance amount: {e}")))
            })
            .collect()
    }

    async fn validate_order(
        &self,
        order: &NewOrderRequest,
    ) -> Result<OrderValidation, TradingError> {
        if order.volume <= Decimal::ZERO {
            return Ok(OrderValidation {
                valid: false,
                reason: Some("volume must be positive".into()),
                ..Default::default()
            });
        }
        if order.kind == OrderKind::Limit && order.price.map_or(true, |p| p <= Decimal::ZERO) {
            return Ok(OrderValidation {
                valid: false,
                reason: Some("limit orders require a positive price".into()),
                ..Default::default()
            });
        }

        let spec = self.pair_spec(&order.pair).await?;

        let adjusted_quantity = quantize_volume(order.volume, spec.lot_step);
        if adjusted_quantity < spec.min_volume {
            return Ok(OrderValidation {
                valid: false,
                reason: Some(format!(
                    "volume {} below pair minimum {}",
                    adjusted_quantity, spec.min_volume
                )),
                ..Default::default()
            });
        }

        let adjusted_price = order.price.map(|p| quantize_price(p, spec.price_tick));

        Ok(OrderValidation {
            valid: true,
            reason: None,
            adjusted_price: adjusted_price.filter(|&p| Some(p) != order.price),
            adjusted_quantity: (adjusted_quantity != order.volume).then_some(adjusted_quantity),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rest_pair_strips_separator() {
        assert_eq!(KrakenClient::rest_pair("XBT/USD"), "XBTUSD");
        assert_eq!(KrakenClient::rest_pair("ETHUSD"), "ETHUSD");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            KrakenClient::parse_status("closed"),
            ExchangeOrderStatus::Closed
        );
        assert_eq!(
            KrakenClient::parse_status("canceled"),
            ExchangeOrderStatus::Canceled
        );
        assert_eq!(
            KrakenClient::parse_status("expired"),
            ExchangeOrderStatus::Expired
        );
        assert_eq!(KrakenClient::parse_status("open"), ExchangeOrderStatus::Open);
    }

    #[test]
    fn test_envelope_error_maps_to_exchange_error() {
        let envelope: Envelope<CancelOrderResult> = Envelope {
            error: vec!["EOrder:Unknown order".to_string()],
            result: None,
        };
        let err = KrakenClient::unwrap_envelope(envelope).unwrap_err();
        assert!(matches!(err, TradingError::Exchange(_)));
    }
}
