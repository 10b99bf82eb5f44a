//! Binance USDⓈ-M futures REST adapter.

use crate::config::{BinanceConfig, MacdFilterConfig, MarginMode};
use crate::exchange::indicators;
use crate::exchange::traits::*;
use crate::exchange::types::*;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::de::DeserializeOwned;
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, warn};

const FUTURES_BASE_URL: &str = "https://fapi.binance.com";
const FUTURES_TESTNET_URL: &str = "https://testnet.binancefuture.com";

/// Extra klines fetched beyond the MACD warm-up so the EMAs settle.
const KLINE_WARMUP: u32 = 100;
const MAX_KLINES: u32 = 1500;

// Binance error codes with dedicated handling
const CODE_TIMEOUT_UNKNOWN_STATUS: i64 = -1007;
const CODE_CANCEL_REJECTED: i64 = -2011;
const CODE_ORDER_DOES_NOT_EXIST: i64 = -2013;
const CODE_INSUFFICIENT_MARGIN: i64 = -2019;
const CODE_NO_NEED_TO_CHANGE_MARGIN: i64 = -4046;

/// Binance futures client implementing [`ExchangeGateway`].
pub struct BinanceFuturesClient {
    http: Client,
    api_key: String,
    secret_key: String,
    base_url: String,
}

impl BinanceFuturesClient {
    /// Create a new client from configuration.
    pub fn new(config: &BinanceConfig) -> Result<Self> {
        let base_url = if config.testnet {
            FUTURES_TESTNET_URL
        } else {
            FUTURES_BASE_URL
        };
        Self::with_base_url(config, base_url)
    }

    /// Create a client against an explicit base URL.
    pub fn with_base_url(config: &BinanceConfig, base_url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            secret_key: config.secret_key.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Generate HMAC-SHA256 signature for authenticated requests.
    fn sign(&self, query_string: &str) -> String {
        // HMAC accepts keys of any length, so this never fails
        let mut mac = match Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return String::new(),
        };
        mac.update(query_string.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Get current timestamp in milliseconds.
    fn timestamp() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn encode_query(params: &[(&str, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    async fn public_get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let url = format!("{}{}?{}", self.base_url, path, Self::encode_query(params));
        let response = self.http.get(&url).send().await.map_err(map_transport_error)?;
        Self::decode(response).await
    }

    async fn signed_request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        mut params: Vec<(&str, String)>,
    ) -> Result<T, ExchangeError> {
        params.push(("recvWindow", "5000".to_string()));
        params.push(("timestamp", Self::timestamp().to_string()));
        let query = Self::encode_query(&params);
        let signature = self.sign(&query);
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

        let response = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(map_transport_error)?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ExchangeError> {
        let status = response.status();
        let body = response.text().await.map_err(map_transport_error)?;

        if !status.is_success() {
            return Err(map_api_error(status, &body));
        }

        serde_json::from_str(&body)
            .map_err(|e| ExchangeError::Transient(format!("failed to decode response: {}", e)))
    }

    async fn fetch_closes(
        &self,
        symbol: &str,
        macd: &MacdFilterConfig,
    ) -> Result<Vec<Decimal>, ExchangeError> {
        let limit = (macd.slow_period + macd.signal_period + KLINE_WARMUP).min(MAX_KLINES);
        let rows: Vec<Vec<serde_json::Value>> = self
            .public_get(
                "/fapi/v1/klines",
                &[
                    ("symbol", symbol.to_string()),
                    ("interval", macd.timeframe.clone()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;

        Ok(rows.iter().filter_map(|row| kline_close(row)).collect())
    }
}

/// Map an HTTP failure onto the exchange error taxonomy.
fn map_api_error(status: StatusCode, body: &str) -> ExchangeError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
        return ExchangeError::RateLimited(body.to_string());
    }
    if status.is_server_error() {
        return ExchangeError::Transient(format!("HTTP {}: {}", status, body));
    }

    match serde_json::from_str::<BinanceApiError>(body) {
        Ok(api) => match api.code {
            CODE_TIMEOUT_UNKNOWN_STATUS => ExchangeError::Timeout,
            CODE_INSUFFICIENT_MARGIN => ExchangeError::InsufficientMargin(api.msg),
            CODE_ORDER_DOES_NOT_EXIST | CODE_CANCEL_REJECTED => ExchangeError::NotFound(api.msg),
            code => ExchangeError::Rejected(format!("{} ({})", api.msg, code)),
        },
        Err(_) => ExchangeError::Rejected(format!("HTTP {}: {}", status, body)),
    }
}

fn map_transport_error(err: reqwest::Error) -> ExchangeError {
    if err.is_timeout() {
        ExchangeError::Timeout
    } else {
        ExchangeError::Transient(err.to_string())
    }
}

#[async_trait]
impl ExchangeGateway for BinanceFuturesClient {
    #[instrument(skip(self, macd))]
    async fn get_market_snapshot(
        &self,
        symbol: &str,
        macd: &MacdFilterConfig,
    ) -> Result<MarketSnapshot, ExchangeError> {
        let index: PremiumIndex = self
            .public_get("/fapi/v1/premiumIndex", &[("symbol", symbol.to_string())])
            .await?;

        let closes = self.fetch_closes(symbol, macd).await?;
        let macd_snapshot = indicators::macd(
            &closes,
            macd.fast_period as usize,
            macd.slow_period as usize,
            macd.signal_period as usize,
        )
        .ok_or_else(|| {
            ExchangeError::Transient(format!(
                "only {} klines available for MACD on {}",
                closes.len(),
                macd.timeframe
            ))
        })?;

        debug!(
            %symbol,
            price = %index.mark_price,
            funding_rate = %index.funding_rate,
            histogram = %macd_snapshot.histogram,
            "Fetched market snapshot"
        );

        Ok(MarketSnapshot {
            symbol: index.symbol,
            price: index.mark_price,
            funding_rate_percent: index.funding_rate * dec!(100),
            macd: macd_snapshot,
            timestamp: Utc::now(),
        })
    }

    #[instrument(skip(self))]
    async fn configure_symbol(
        &self,
        symbol: &str,
        leverage: u32,
        margin_mode: MarginMode,
    ) -> Result<(), ExchangeError> {
        let margin_type = match margin_mode {
            MarginMode::Crossed => "CROSSED",
            MarginMode::Isolated => "ISOLATED",
        };

        let margin_result: Result<serde_json::Value, ExchangeError> = self
            .signed_request(
                Method::POST,
                "/fapi/v1/marginType",
                vec![
                    ("symbol", symbol.to_string()),
                    ("marginType", margin_type.to_string()),
                ],
            )
            .await;

        match margin_result {
            Ok(_) => {}
            // Already in the requested mode
            Err(ExchangeError::Rejected(msg))
                if msg.contains(&format!("({})", CODE_NO_NEED_TO_CHANGE_MARGIN)) => {}
            Err(e) => return Err(e),
        }

        let _: serde_json::Value = self
            .signed_request(
                Method::POST,
                "/fapi/v1/leverage",
                vec![
                    ("symbol", symbol.to_string()),
                    ("leverage", leverage.to_string()),
                ],
            )
            .await?;

        Ok(())
    }

    #[instrument(skip(self), fields(client_order_id = %request.client_order_id))]
    async fn place_order(&self, request: &OrderRequest) -> Result<String, ExchangeError> {
        let mut params = vec![
            ("symbol", request.symbol.clone()),
            ("side", request.side.as_str().to_string()),
            ("type", "LIMIT".to_string()),
            ("timeInForce", "GTC".to_string()),
            ("quantity", request.quantity.normalize().to_string()),
            ("price", request.price.normalize().to_string()),
            ("newClientOrderId", request.client_order_id.clone()),
        ];
        if request.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }

        let response: OrderResponse = self
            .signed_request(Method::POST, "/fapi/v1/order", params)
            .await?;

        Ok(response.order_id.to_string())
    }

    #[instrument(skip(self))]
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        let _: OrderResponse = self
            .signed_request(
                Method::DELETE,
                "/fapi/v1/order",
                vec![
                    ("symbol", symbol.to_string()),
                    ("orderId", order_id.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_order_status(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> Result<Option<OrderStatusReport>, ExchangeError> {
        let result: Result<OrderResponse, ExchangeError> = self
            .signed_request(
                Method::GET,
                "/fapi/v1/order",
                vec![
                    ("symbol", symbol.to_string()),
                    ("origClientOrderId", client_order_id.to_string()),
                ],
            )
            .await;

        match result {
            Ok(order) => Ok(Some(OrderStatusReport {
                order_id: order.order_id.to_string(),
                client_order_id: order.client_order_id,
                state: order.status.into(),
                filled_quantity: order.executed_qty,
                avg_price: order.avg_price.unwrap_or(Decimal::ZERO),
            })),
            Err(ExchangeError::NotFound(msg)) => {
                warn!(%client_order_id, %msg, "Order unknown to exchange");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    async fn get_open_positions(&self, symbol: &str) -> Result<Vec<OpenPosition>, ExchangeError> {
        let risks: Vec<PositionRisk> = self
            .signed_request(
                Method::GET,
                "/fapi/v2/positionRisk",
                vec![("symbol", symbol.to_string())],
            )
            .await?;

        Ok(risks
            .into_iter()
            .filter(|p| p.position_amt != Decimal::ZERO)
            .map(|p| OpenPosition {
                entry_price: p.entry_price,
                quantity: p.position_amt.abs(),
                side: if p.position_amt > Decimal::ZERO {
                    OrderSide::Buy
                } else {
                    OrderSide::Sell
                },
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(server: &MockServer) -> BinanceFuturesClient {
        let config = BinanceConfig {
            api_key: "key".to_string(),
            secret_key: "secret".to_string(),
            testnet: true,
        };
        BinanceFuturesClient::with_base_url(&config, &server.uri()).unwrap()
    }

    fn order_request() -> OrderRequest {
        OrderRequest {
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            price: dec!(96000),
            quantity: dec!(0.01),
            client_order_id: "g1-n1-1".to_string(),
            reduce_only: false,
        }
    }

    #[test]
    fn test_api_error_mapping() {
        let margin = map_api_error(
            StatusCode::BAD_REQUEST,
            r#"{"code":-2019,"msg":"Margin is insufficient."}"#,
        );
        assert!(matches!(margin, ExchangeError::InsufficientMargin(_)));

        let price = map_api_error(
            StatusCode::BAD_REQUEST,
            r#"{"code":-4016,"msg":"Limit price can't be higher than 105000."}"#,
        );
        assert!(matches!(price, ExchangeError::Rejected(_)));

        let busy = map_api_error(StatusCode::SERVICE_UNAVAILABLE, "busy");
        assert!(busy.is_transient());
    }

    #[tokio::test]
    async fn test_snapshot_combines_premium_index_and_klines() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/fapi/v1/premiumIndex"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "symbol": "BTCUSDT",
                "markPrice": "96500.00",
                "lastFundingRate": "0.00010000",
                "nextFundingTime": 1700000000000i64
            })))
            .mount(&server)
            .await;

        let klines: Vec<serde_json::Value> = (1..=80)
            .map(|i| {
                json!([i, "0", "0", "0", format!("{}", 90000 + i * i), "0", i, "0", 0, "0", "0", "0"])
            })
            .collect();
        Mock::given(method("GET"))
            .and(path("/fapi/v1/klines"))
            .respond_with(ResponseTemplate::new(200).set_body_json(klines))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let snapshot = client
            .get_market_snapshot("BTCUSDT", &MacdFilterConfig::default())
            .await
            .unwrap();

        assert_eq!(snapshot.price, dec!(96500.00));
        assert_eq!(snapshot.funding_rate_percent, dec!(0.01));
        assert_eq!(snapshot.macd.trend, MacdTrend::Bullish);
    }

    #[tokio::test]
    async fn test_place_order_insufficient_margin() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/fapi/v1/order"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "code": -2019,
                "msg": "Margin is insufficient."
            })))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let result = client.place_order(&order_request()).await;
        assert!(matches!(result, Err(ExchangeError::InsufficientMargin(_))));
    }

    #[tokio::test]
    async fn test_rate_limit_is_transient() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/fapi/v1/order"))
            .respond_with(ResponseTemplate::new(429).set_body_string("Too many requests"))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let err = client.place_order(&order_request()).await.unwrap_err();
        assert!(matches!(err, ExchangeError::RateLimited(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_unknown_order_status_is_none() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/fapi/v1/order"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "code": -2013,
                "msg": "Order does not exist."
            })))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let status = client.get_order_status("BTCUSDT", "g1-n1-1").await.unwrap();
        assert!(status.is_none());
    }

    #[tokio::test]
    async fn test_positions_filter_flat_entries() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/fapi/v2/positionRisk"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {
                    "symbol": "BTCUSDT",
                    "positionAmt": "-0.020",
                    "entryPrice": "97000.0",
                    "markPrice": "96500.0",
                    "liquidationPrice": "105000.0"
                },
                {
                    "symbol": "BTCUSDT",
                    "positionAmt": "0.000",
                    "entryPrice": "0.0",
                    "markPrice": "96500.0",
                    "liquidationPrice": "0"
                }
            ])))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let positions = client.get_open_positions("BTCUSDT").await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].side, OrderSide::Sell);
        assert_eq!(positions[0].quantity, dec!(0.020));
    }
}
