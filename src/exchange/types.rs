//! Type definitions for Binance USDⓈ-M futures API responses.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::traits::{ExchangeOrderState, OrderSide};

/// Mark price and funding information for a perpetual contract.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PremiumIndex {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub mark_price: Decimal,
    /// Funding rate as a fraction (0.0001 = 0.01%)
    #[serde(rename = "lastFundingRate", with = "rust_decimal::serde::str")]
    pub funding_rate: Decimal,
    pub next_funding_time: i64,
}

/// Close price of one kline row: `[open_time, open, high, low, close, ...]`.
pub fn kline_close(row: &[serde_json::Value]) -> Option<Decimal> {
    row.get(4)?.as_str()?.parse().ok()
}

/// Order status as reported by Binance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BinanceOrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
    ExpiredInMatch,
}

impl From<BinanceOrderStatus> for ExchangeOrderState {
    fn from(status: BinanceOrderStatus) -> Self {
        match status {
            BinanceOrderStatus::New => ExchangeOrderState::New,
            BinanceOrderStatus::PartiallyFilled => ExchangeOrderState::PartiallyFilled,
            BinanceOrderStatus::Filled => ExchangeOrderState::Filled,
            BinanceOrderStatus::Canceled => ExchangeOrderState::Cancelled,
            BinanceOrderStatus::Rejected => ExchangeOrderState::Rejected,
            BinanceOrderStatus::Expired | BinanceOrderStatus::ExpiredInMatch => {
                ExchangeOrderState::Expired
            }
        }
    }
}

/// Order response from the exchange.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub order_id: i64,
    pub symbol: String,
    pub status: BinanceOrderStatus,
    pub client_order_id: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub avg_price: Option<Decimal>,
    #[serde(with = "rust_decimal::serde::str")]
    pub orig_qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub executed_qty: Decimal,
    pub side: OrderSide,
    pub update_time: i64,
}

/// Futures position risk entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRisk {
    pub symbol: String,
    /// Signed amount, negative for shorts
    #[serde(with = "rust_decimal::serde::str")]
    pub position_amt: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub entry_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub mark_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub liquidation_price: Decimal,
}

/// Error body returned with non-2xx responses.
#[derive(Debug, Clone, Deserialize)]
pub struct BinanceApiError {
    pub code: i64,
    pub msg: String,
}

/// Margin type for positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarginType {
    Isolated,
    Crossed,
}
