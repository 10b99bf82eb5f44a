//! Configuration management for the grid controller.
//!
//! Loads settings from environment variables and config files.

mod strategy;

pub use strategy::{
    AdvancedSettingsUpdate, AnchorMode, ConfigSnapshot, DynamicTpConfig, GridSettingsUpdate,
    MacdFilterConfig, MacdFilterUpdate, MarginMode, ReactivationMode, RiskParametersUpdate,
    SpacingType, StrategyConfig, MAX_LEVERAGE, MAX_TOTAL_ORDERS, SUPPORTED_TIMEFRAMES,
};

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Binance API credentials
    #[serde(default)]
    pub binance: BinanceConfig,
    /// Controller runtime settings
    #[serde(default)]
    pub controller: ControllerSettings,
    /// Liquidation risk banding
    #[serde(default)]
    pub risk: RiskBands,
    /// Strategy parameters used when `start` is called without a config
    #[serde(default)]
    pub strategy: StrategyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinanceConfig {
    /// API key for authentication
    #[serde(default)]
    pub api_key: String,
    /// Secret key for signing requests
    #[serde(default)]
    pub secret_key: String,
    /// Use testnet instead of production
    #[serde(default)]
    pub testnet: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSettings {
    /// Account the controller trades for
    #[serde(default = "default_account_id")]
    pub account_id: String,
    /// Perpetual contract symbol
    #[serde(default = "default_symbol")]
    pub symbol: String,
    /// Seconds between market snapshot polls
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Timeout applied to every exchange call
    #[serde(default = "default_exchange_timeout_secs")]
    pub exchange_timeout_secs: u64,
    /// Placement attempts per level per reconciliation pass
    #[serde(default = "default_max_place_attempts")]
    pub max_place_attempts: u32,
    /// First retry delay; doubles on each attempt
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Ceiling for the retry delay
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Price drift from the ladder reference, in percent, that regenerates the ladder
    #[serde(default = "default_ladder_drift_percent")]
    pub ladder_drift_percent: Decimal,
    /// Decimal places for order prices
    #[serde(default = "default_price_decimals")]
    pub price_decimals: u32,
    /// Decimal places for order quantities
    #[serde(default = "default_quantity_decimals")]
    pub quantity_decimals: u32,
    /// Capacity of the per-account command queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// SQLite database path
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Starting balance for paper trading
    #[serde(default = "default_paper_balance")]
    pub paper_balance: Decimal,
}

/// Leverage thresholds for the liquidation risk band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskBands {
    /// Highest leverage still reported as `low`
    #[serde(default = "default_low_max_leverage")]
    pub low_max_leverage: u32,
    /// Highest leverage still reported as `medium`
    #[serde(default = "default_medium_max_leverage")]
    pub medium_max_leverage: u32,
}

// Default value functions
fn default_account_id() -> String {
    "default".to_string()
}

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_exchange_timeout_secs() -> u64 {
    10
}

fn default_max_place_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    250
}

fn default_retry_max_delay_ms() -> u64 {
    4_000
}

fn default_ladder_drift_percent() -> Decimal {
    Decimal::new(10, 1) // 1.0%
}

fn default_price_decimals() -> u32 {
    2
}

fn default_quantity_decimals() -> u32 {
    3
}

fn default_queue_capacity() -> usize {
    256
}

fn default_db_path() -> String {
    "data/grid_state.db".to_string()
}

fn default_paper_balance() -> Decimal {
    Decimal::new(10_000, 0)
}

fn default_low_max_leverage() -> u32 {
    10
}

fn default_medium_max_leverage() -> u32 {
    25
}

impl AppConfig {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("GRID"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.controller.symbol.is_empty(),
            "controller.symbol must not be empty"
        );

        anyhow::ensure!(
            self.controller.poll_interval_secs >= 1,
            "controller.poll_interval_secs must be at least 1"
        );

        anyhow::ensure!(
            self.controller.exchange_timeout_secs >= 1,
            "controller.exchange_timeout_secs must be at least 1"
        );

        anyhow::ensure!(
            self.controller.max_place_attempts >= 1,
            "controller.max_place_attempts must be at least 1"
        );

        anyhow::ensure!(
            self.controller.ladder_drift_percent > Decimal::ZERO,
            "controller.ladder_drift_percent must be positive"
        );

        anyhow::ensure!(
            self.risk.low_max_leverage < self.risk.medium_max_leverage,
            "risk.low_max_leverage must be below risk.medium_max_leverage"
        );

        self.strategy
            .validate()
            .map_err(|e| anyhow::anyhow!("strategy: {}", e))
    }
}

impl ControllerSettings {
    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_secs(self.exchange_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            binance: BinanceConfig {
                api_key: String::new(),
                secret_key: String::new(),
                testnet: true,
            },
            controller: ControllerSettings::default(),
            risk: RiskBands::default(),
            strategy: StrategyConfig::default(),
        }
    }
}

impl Default for BinanceConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            secret_key: String::new(),
            testnet: false,
        }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            account_id: default_account_id(),
            symbol: default_symbol(),
            poll_interval_secs: default_poll_interval_secs(),
            exchange_timeout_secs: default_exchange_timeout_secs(),
            max_place_attempts: default_max_place_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            ladder_drift_percent: default_ladder_drift_percent(),
            price_decimals: default_price_decimals(),
            quantity_decimals: default_quantity_decimals(),
            queue_capacity: default_queue_capacity(),
            db_path: default_db_path(),
            paper_balance: default_paper_balance(),
        }
    }
}

impl Default for RiskBands {
    fn default() -> Self {
        Self {
            low_max_leverage: default_low_max_leverage(),
            medium_max_leverage: default_medium_max_leverage(),
        }
    }
}
