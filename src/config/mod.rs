//! Configuration management for the grid-trading backend.
//!
//! Loads settings from environment variables and config files. A small set
//! of bare environment keys (`REINVESTMENT_PERCENT`, `SUPABASE_URL`,
//! `SUPABASE_SERVICE_ROLE_KEY`, `EXCHANGE_API_KEY`, `EXCHANGE_API_SECRET`)
//! is recognized on top of the `GRID__`-prefixed hierarchy.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Exchange API credentials
    #[serde(default)]
    pub exchange: ExchangeConfig,
    /// Grid geometry and placement parameters
    #[serde(default)]
    pub grid: GridConfig,
    /// Risk management thresholds
    #[serde(default)]
    pub risk: RiskConfig,
    /// Profit distribution parameters
    #[serde(default)]
    pub profit: ProfitConfig,
    /// Persistence endpoint; missing credentials select mock mode
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Execution timing and rate limiting
    #[serde(default)]
    pub execution: ExecutionConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ExchangeConfig {
    /// API key for authentication
    #[serde(default)]
    pub api_key: String,
    /// Secret key for signing requests
    #[serde(default)]
    pub api_secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GridConfig {
    /// Trading pairs to run grids on (exchange notation, e.g. "XBT/USD")
    #[serde(default = "default_trading_pairs")]
    pub trading_pairs: Vec<String>,
    /// Half-width of the grid around the reference price (fractional)
    #[serde(default = "default_grid_range")]
    pub grid_range: Decimal,
    /// Number of grid intervals between the bounds
    #[serde(default = "default_grid_levels")]
    pub grid_levels: u32,
    /// Quote-currency size of each grid order
    #[serde(default = "default_order_size")]
    pub order_size: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    /// Maximum portfolio exposure as a fraction of portfolio value
    #[serde(default = "default_max_portfolio_exposure")]
    pub max_portfolio_exposure: Decimal,
    /// Minimum cash reserves as a fraction of portfolio value
    #[serde(default = "default_min_cash_reserves")]
    pub min_cash_reserves: Decimal,
    /// Maximum exposure to a single asset
    #[serde(default = "default_max_single_asset_exposure")]
    pub max_single_asset_exposure: Decimal,
    /// Maximum exposure to a single sector
    #[serde(default = "default_max_sector_exposure")]
    pub max_sector_exposure: Decimal,
    /// Maximum tolerated pairwise position correlation
    #[serde(default = "default_max_correlation")]
    pub max_correlation: Decimal,
    /// Minimum 24h volume (USD) for a traded symbol
    #[serde(default = "default_min_daily_volume")]
    pub min_daily_volume: Decimal,
    /// Maximum single-order size as a fraction of daily volume
    #[serde(default = "default_max_order_volume_share")]
    pub max_order_volume_share: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProfitConfig {
    /// Portion of net proceeds retained as working capital (percent).
    /// The remainder is extracted.
    #[serde(default = "default_reinvestment_percent")]
    pub reinvestment_percent: Decimal,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PersistenceConfig {
    /// Persistence endpoint URL; absent selects mock-persistence mode
    #[serde(default)]
    pub supabase_url: Option<String>,
    /// Service role key for the persistence endpoint
    #[serde(default)]
    pub supabase_service_role_key: Option<String>,
    /// Local database path backing the table store
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// Deadline for every external call, in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Shared exchange rate-limit budget, requests per minute
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u32,
    /// Order status synchronization cadence, in seconds
    #[serde(default = "default_order_sync_interval")]
    pub order_sync_interval_secs: u64,
    /// Risk metrics evaluation cadence, in seconds
    #[serde(default = "default_risk_eval_interval")]
    pub risk_eval_interval_secs: u64,
    /// Market-data health scan cadence, in seconds
    #[serde(default = "default_market_scan_interval")]
    pub market_scan_interval_secs: u64,
    /// Age after which a symbol's market data counts as stale, in seconds
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
}

// Default value functions

fn default_trading_pairs() -> Vec<String> {
    vec!["XBT/USD".to_string()]
}

fn default_grid_range() -> Decimal {
    Decimal::new(10, 2) // 0.10
}

fn default_grid_levels() -> u32 {
    10
}

fn default_order_size() -> Decimal {
    Decimal::new(100, 0) // 100 USD per rung
}

fn default_max_portfolio_exposure() -> Decimal {
    Decimal::new(80, 2) // 0.80
}

fn default_min_cash_reserves() -> Decimal {
    Decimal::new(20, 2) // 0.20
}

fn default_max_single_asset_exposure() -> Decimal {
    Decimal::new(5, 2) // 0.05
}

fn default_max_sector_exposure() -> Decimal {
    Decimal::new(30, 2) // 0.30
}

fn default_max_correlation() -> Decimal {
    Decimal::new(80, 2) // 0.80
}

fn default_min_daily_volume() -> Decimal {
    Decimal::new(1_000_000, 0) // $1M
}

fn default_max_order_volume_share() -> Decimal {
    Decimal::new(5, 2) // 0.05
}

fn default_reinvestment_percent() -> Decimal {
    Decimal::new(70, 0) // 70%
}

fn default_db_path() -> String {
    "data/grid_harvester.db".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_rate_limit() -> u32 {
    60
}

fn default_order_sync_interval() -> u64 {
    5
}

fn default_risk_eval_interval() -> u64 {
    10
}

fn default_market_scan_interval() -> u64 {
    30
}

fn default_stale_after() -> u64 {
    60
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            trading_pairs: default_trading_pairs(),
            grid_range: default_grid_range(),
            grid_levels: default_grid_levels(),
            order_size: default_order_size(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_portfolio_exposure: default_max_portfolio_exposure(),
            min_cash_reserves: default_min_cash_reserves(),
            max_single_asset_exposure: default_max_single_asset_exposure(),
            max_sector_exposure: default_max_sector_exposure(),
            max_correlation: default_max_correlation(),
            min_daily_volume: default_min_daily_volume(),
            max_order_volume_share: default_max_order_volume_share(),
        }
    }
}

impl Default for ProfitConfig {
    fn default() -> Self {
        Self {
            reinvestment_percent: default_reinvestment_percent(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            rate_limit_per_minute: default_rate_limit(),
            order_sync_interval_secs: default_order_sync_interval(),
            risk_eval_interval_secs: default_risk_eval_interval(),
            market_scan_interval_secs: default_market_scan_interval(),
            stale_after_secs: default_stale_after(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exchange: ExchangeConfig::default(),
            grid: GridConfig::default(),
            risk: RiskConfig::default(),
            profit: ProfitConfig::default(),
            persistence: PersistenceConfig::default(),
            execution: ExecutionConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .prefix("GRID"),
            )
            .build()
            .context("Failed to build configuration")?;

        let mut config: Config = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.apply_recognized_env_keys()?;
        Ok(config)
    }

    /// Apply the bare environment keys recognized by the deployment surface.
    fn apply_recognized_env_keys(&mut self) -> Result<()> {
        if let Ok(value) = std::env::var("REINVESTMENT_PERCENT") {
            self.profit.reinvestment_percent = Decimal::from_str(&value)
                .with_context(|| format!("Invalid REINVESTMENT_PERCENT: {value}"))?;
        }
        if let Ok(value) = std::env::var("SUPABASE_URL") {
            self.persistence.supabase_url = Some(value);
        }
        if let Ok(value) = std::env::var("SUPABASE_SERVICE_ROLE_KEY") {
            self.persistence.supabase_service_role_key = Some(value);
        }
        if let Ok(value) = std::env::var("EXCHANGE_API_KEY") {
            self.exchange.api_key = value;
        }
        if let Ok(value) = std::env::var("EXCHANGE_API_SECRET") {
            self.exchange.api_secret = value;
        }
        Ok(())
    }

    /// Whether persistence credentials are present.
    ///
    /// Missing values put the system in mock-persistence mode: reads return
    /// defaults and writes log once per kind.
    pub fn persistence_configured(&self) -> bool {
        self.persistence.supabase_url.is_some()
            && self.persistence.supabase_service_role_key.is_some()
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.grid.grid_range > Decimal::ZERO && self.grid.grid_range < Decimal::ONE,
            "grid_range must be between 0 and 1"
        );

        anyhow::ensure!(self.grid.grid_levels >= 2, "grid_levels must be at least 2");

        anyhow::ensure!(
            self.grid.order_size > Decimal::ZERO,
            "order_size must be positive"
        );

        anyhow::ensure!(
            self.risk.max_portfolio_exposure > Decimal::ZERO
                && self.risk.max_portfolio_exposure <= Decimal::ONE,
            "max_portfolio_exposure must be between 0 and 1"
        );

        anyhow::ensure!(
            self.risk.min_cash_reserves >= Decimal::ZERO
                && self.risk.min_cash_reserves < Decimal::ONE,
            "min_cash_reserves must be between 0 and 1"
        );

        anyhow::ensure!(
            self.profit.reinvestment_percent >= Decimal::ZERO
                && self.profit.reinvestment_percent <= Decimal::ONE_HUNDRED,
            "reinvestment_percent must be between 0 and 100"
        );

        anyhow::ensure!(
            self.execution.request_timeout_secs > 0,
            "request_timeout_secs must be positive"
        );

        Ok(())
    }
}
