//! Venue-agnostic exchange capability consumed by the controller.
//!
//! The controller never talks to a venue directly; it depends on
//! [`ExchangeGateway`], which the Binance REST adapter and the paper exchange
//! both implement. Tests script it with the generated `MockExchangeGateway`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::config::{MacdFilterConfig, MarginMode};

/// Failures reported by an exchange call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExchangeError {
    /// No answer within the call timeout; the outcome is unknown.
    #[error("request timed out")]
    Timeout,
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("insufficient margin: {0}")]
    InsufficientMargin(String),
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("order not found: {0}")]
    NotFound(String),
}

impl ExchangeError {
    /// Errors worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeError::Timeout | ExchangeError::RateLimited(_) | ExchangeError::Transient(_)
        )
    }
}

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Momentum classification reported alongside the MACD values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MacdTrend {
    Bullish,
    Bearish,
    Neutral,
}

/// MACD indicator values for the configured timeframe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MacdSnapshot {
    pub line: Decimal,
    pub signal: Decimal,
    pub histogram: Decimal,
    pub trend: MacdTrend,
}

/// Market data consumed on every tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub price: Decimal,
    /// Current funding rate, in percent (0.01 = 0.01%)
    pub funding_rate_percent: Decimal,
    pub macd: MacdSnapshot,
    pub timestamp: DateTime<Utc>,
}

/// Limit order placement request.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub quantity: Decimal,
    /// Idempotency key; lets an unknown-outcome placement be looked up later
    pub client_order_id: String,
    /// Take-profit orders only reduce an existing position
    pub reduce_only: bool,
}

/// Order lifecycle as reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeOrderState {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl ExchangeOrderState {
    /// Still resting on the book.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            ExchangeOrderState::New | ExchangeOrderState::PartiallyFilled
        )
    }

    /// Gone from the book without filling.
    pub fn is_dead(&self) -> bool {
        matches!(
            self,
            ExchangeOrderState::Cancelled | ExchangeOrderState::Rejected | ExchangeOrderState::Expired
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderStatusReport {
    pub order_id: String,
    pub client_order_id: String,
    pub state: ExchangeOrderState,
    pub filled_quantity: Decimal,
    /// Average fill price, zero when nothing filled
    pub avg_price: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenPosition {
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub side: OrderSide,
}

/// Exchange capability needed by the grid controller.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Current price, funding rate and MACD for `symbol`.
    async fn get_market_snapshot(
        &self,
        symbol: &str,
        macd: &MacdFilterConfig,
    ) -> Result<MarketSnapshot, ExchangeError>;

    /// Push leverage and margin mode for `symbol` before trading.
    async fn configure_symbol(
        &self,
        symbol: &str,
        leverage: u32,
        margin_mode: MarginMode,
    ) -> Result<(), ExchangeError>;

    /// Place a limit order, returning the exchange order id.
    async fn place_order(&self, request: &OrderRequest) -> Result<String, ExchangeError>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError>;

    /// Look an order up by client order id. `None` if the exchange never saw it.
    async fn get_order_status(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> Result<Option<OrderStatusReport>, ExchangeError>;

    async fn get_open_positions(&self, symbol: &str) -> Result<Vec<OpenPosition>, ExchangeError>;
}

/// Bound an exchange call; an elapsed timer becomes [`ExchangeError::Timeout`].
pub async fn with_timeout<T, F>(timeout: Duration, call: F) -> Result<T, ExchangeError>
where
    F: Future<Output = Result<T, ExchangeError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(ExchangeError::Timeout),
    }
}
