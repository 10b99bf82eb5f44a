//! Paper exchange for dry runs and controller tests.
//!
//! Limit orders rest in memory and fill when the simulated price crosses
//! them. Failures can be queued to exercise the retry and recovery paths.

use super::traits::*;
use crate::config::{MacdFilterConfig, MarginMode};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// A scripted outcome for an upcoming `place_order` call.
#[derive(Debug, Clone)]
pub enum PlaceFault {
    /// Reject the call with this error; nothing is placed
    Fail(ExchangeError),
    /// Accept the order but report a timeout to the caller
    AcceptThenTimeout,
}

#[derive(Debug, Clone)]
struct PaperOrder {
    order_id: String,
    request: OrderRequest,
    state: ExchangeOrderState,
    filled_quantity: Decimal,
}

/// Net position held on the paper account.
#[derive(Debug, Clone, Default)]
pub struct PaperPosition {
    /// Signed quantity, negative for shorts
    pub quantity: Decimal,
    pub entry_price: Decimal,
}

/// Simulated account state.
#[derive(Debug)]
pub struct PaperTradingState {
    pub initial_balance: Decimal,
    pub balance: Decimal,
    pub position: PaperPosition,
    pub realized_pnl: Decimal,
    pub total_trading_fees: Decimal,
    pub fill_count: u64,
    pub leverage: Option<u32>,
    pub margin_mode: Option<MarginMode>,
}

#[derive(Debug)]
struct MarketState {
    symbol: String,
    price: Decimal,
    funding_rate_percent: Decimal,
    macd: MacdSnapshot,
}

/// In-memory exchange implementing [`ExchangeGateway`].
pub struct PaperExchange {
    state: Arc<RwLock<PaperTradingState>>,
    market: Arc<RwLock<MarketState>>,
    orders: Arc<RwLock<HashMap<String, PaperOrder>>>,
    faults: Arc<RwLock<VecDeque<PlaceFault>>>,
    order_id_counter: AtomicU64,
    place_calls: AtomicU64,
    /// Maker fee rate (0.02%)
    fee_rate: Decimal,
}

impl PaperExchange {
    pub fn new(symbol: &str, initial_balance: Decimal, price: Decimal) -> Self {
        let state = PaperTradingState {
            initial_balance,
            balance: initial_balance,
            position: PaperPosition::default(),
            realized_pnl: Decimal::ZERO,
            total_trading_fees: Decimal::ZERO,
            fill_count: 0,
            leverage: None,
            margin_mode: None,
        };

        Self {
            state: Arc::new(RwLock::new(state)),
            market: Arc::new(RwLock::new(MarketState {
                symbol: symbol.to_string(),
                price,
                funding_rate_percent: Decimal::ZERO,
                macd: MacdSnapshot {
                    line: Decimal::ZERO,
                    signal: Decimal::ZERO,
                    histogram: Decimal::ZERO,
                    trend: MacdTrend::Neutral,
                },
            })),
            orders: Arc::new(RwLock::new(HashMap::new())),
            faults: Arc::new(RwLock::new(VecDeque::new())),
            order_id_counter: AtomicU64::new(1),
            place_calls: AtomicU64::new(0),
            fee_rate: dec!(0.0002),
        }
    }

    /// Move the market and fill every resting order the new price crosses.
    pub async fn set_price(&self, price: Decimal) {
        self.market.write().await.price = price;

        let crossed: Vec<String> = self
            .orders
            .read()
            .await
            .values()
            .filter(|o| o.state.is_open())
            .filter(|o| match o.request.side {
                OrderSide::Buy => price <= o.request.price,
                OrderSide::Sell => price >= o.request.price,
            })
            .map(|o| o.request.client_order_id.clone())
            .collect();

        for client_order_id in crossed {
            self.fill_order(&client_order_id).await;
        }
    }

    pub async fn set_funding_rate_percent(&self, rate: Decimal) {
        self.market.write().await.funding_rate_percent = rate;
    }

    pub async fn set_macd(&self, macd: MacdSnapshot) {
        self.market.write().await.macd = macd;
    }

    /// Queue outcomes for the next `place_order` calls, consumed in order.
    pub async fn push_place_faults(&self, faults: impl IntoIterator<Item = PlaceFault>) {
        self.faults.write().await.extend(faults);
    }

    /// Fill an open order at its limit price regardless of the market.
    pub async fn fill_order(&self, client_order_id: &str) -> bool {
        let fill = {
            let mut orders = self.orders.write().await;
            match orders.get_mut(client_order_id) {
                Some(order) if order.state.is_open() => {
                    let remaining = order.request.quantity - order.filled_quantity;
                    order.filled_quantity = order.request.quantity;
                    order.state = ExchangeOrderState::Filled;
                    Some((order.request.side, order.request.price, remaining))
                }
                _ => None,
            }
        };

        match fill {
            Some((side, price, quantity)) => {
                self.apply_fill(side, price, quantity).await;
                debug!(%client_order_id, %side, %price, %quantity, "Paper order filled");
                true
            }
            None => false,
        }
    }

    async fn apply_fill(&self, side: OrderSide, price: Decimal, quantity: Decimal) {
        let mut state = self.state.write().await;
        let signed = match side {
            OrderSide::Buy => quantity,
            OrderSide::Sell => -quantity,
        };

        let position = &mut state.position;
        let mut realized = Decimal::ZERO;

        let adding = position.quantity.is_zero()
            || position.quantity.is_sign_positive() == signed.is_sign_positive();
        if adding {
            let total = position.quantity.abs() + quantity;
            position.entry_price =
                (position.entry_price * position.quantity.abs() + price * quantity) / total;
            position.quantity += signed;
        } else {
            let closing = position.quantity.abs().min(quantity);
            let direction = if position.quantity.is_sign_positive() {
                Decimal::ONE
            } else {
                -Decimal::ONE
            };
            realized = closing * (price - position.entry_price) * direction;

            let previous = position.quantity;
            position.quantity += signed;
            if position.quantity.is_zero() {
                position.entry_price = Decimal::ZERO;
            } else if position.quantity.is_sign_positive() != previous.is_sign_positive() {
                position.entry_price = price;
            }
        }

        let fee = price * quantity * self.fee_rate;
        state.realized_pnl += realized;
        state.total_trading_fees += fee;
        state.balance += realized - fee;
        state.fill_count += 1;
    }

    /// Requests for every order still resting on the book.
    pub async fn open_orders(&self) -> Vec<OrderRequest> {
        let mut open: Vec<OrderRequest> = self
            .orders
            .read()
            .await
            .values()
            .filter(|o| o.state.is_open())
            .map(|o| o.request.clone())
            .collect();
        open.sort_by(|a, b| a.price.cmp(&b.price));
        open
    }

    /// Number of `place_order` calls received, including failed ones.
    pub fn place_calls(&self) -> u64 {
        self.place_calls.load(Ordering::SeqCst)
    }

    pub async fn account(&self) -> (Decimal, Decimal, u64) {
        let state = self.state.read().await;
        (state.balance, state.realized_pnl, state.fill_count)
    }

    pub async fn symbol_settings(&self) -> (Option<u32>, Option<MarginMode>) {
        let state = self.state.read().await;
        (state.leverage, state.margin_mode)
    }

    fn next_order_id(&self) -> String {
        self.order_id_counter.fetch_add(1, Ordering::SeqCst).to_string()
    }
}

#[async_trait]
impl ExchangeGateway for PaperExchange {
    async fn get_market_snapshot(
        &self,
        symbol: &str,
        _macd: &MacdFilterConfig,
    ) -> Result<MarketSnapshot, ExchangeError> {
        let market = self.market.read().await;
        if market.symbol != symbol {
            return Err(ExchangeError::Rejected(format!("unknown symbol {}", symbol)));
        }

        Ok(MarketSnapshot {
            symbol: market.symbol.clone(),
            price: market.price,
            funding_rate_percent: market.funding_rate_percent,
            macd: market.macd,
            timestamp: Utc::now(),
        })
    }

    async fn configure_symbol(
        &self,
        symbol: &str,
        leverage: u32,
        margin_mode: MarginMode,
    ) -> Result<(), ExchangeError> {
        let mut state = self.state.write().await;
        state.leverage = Some(leverage);
        state.margin_mode = Some(margin_mode);
        info!(%symbol, leverage, ?margin_mode, "[PAPER] Symbol configured");
        Ok(())
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<String, ExchangeError> {
        self.place_calls.fetch_add(1, Ordering::SeqCst);

        let fault = self.faults.write().await.pop_front();
        if let Some(PlaceFault::Fail(err)) = fault {
            return Err(err);
        }

        let order_id = {
            let mut orders = self.orders.write().await;
            if orders.contains_key(&request.client_order_id) {
                return Err(ExchangeError::Rejected(format!(
                    "client order id {} is duplicated",
                    request.client_order_id
                )));
            }

            let order_id = self.next_order_id();
            orders.insert(
                request.client_order_id.clone(),
                PaperOrder {
                    order_id: order_id.clone(),
                    request: request.clone(),
                    state: ExchangeOrderState::New,
                    filled_quantity: Decimal::ZERO,
                },
            );
            order_id
        };

        debug!(
            client_order_id = %request.client_order_id,
            side = %request.side,
            price = %request.price,
            quantity = %request.quantity,
            "[PAPER] Order accepted"
        );

        // A marketable limit order fills on arrival
        let price = self.market.read().await.price;
        let marketable = match request.side {
            OrderSide::Buy => price <= request.price,
            OrderSide::Sell => price >= request.price,
        };
        if marketable {
            self.fill_order(&request.client_order_id).await;
        }

        match fault {
            Some(PlaceFault::AcceptThenTimeout) => Err(ExchangeError::Timeout),
            _ => Ok(order_id),
        }
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        let mut orders = self.orders.write().await;
        let order = orders
            .values_mut()
            .find(|o| o.order_id == order_id)
            .ok_or_else(|| ExchangeError::NotFound(order_id.to_string()))?;

        if !order.state.is_open() {
            return Err(ExchangeError::NotFound(format!(
                "order {} is no longer open",
                order_id
            )));
        }
        order.state = ExchangeOrderState::Cancelled;
        Ok(())
    }

    async fn get_order_status(
        &self,
        _symbol: &str,
        client_order_id: &str,
    ) -> Result<Option<OrderStatusReport>, ExchangeError> {
        let orders = self.orders.read().await;
        Ok(orders.get(client_order_id).map(|o| OrderStatusReport {
            order_id: o.order_id.clone(),
            client_order_id: client_order_id.to_string(),
            state: o.state,
            filled_quantity: o.filled_quantity,
            avg_price: if o.filled_quantity.is_zero() {
                Decimal::ZERO
            } else {
                o.request.price
            },
        }))
    }

    async fn get_open_positions(&self, _symbol: &str) -> Result<Vec<OpenPosition>, ExchangeError> {
        let state = self.state.read().await;
        let position = &state.position;
        if position.quantity.is_zero() {
            return Ok(Vec::new());
        }

        Ok(vec![OpenPosition {
            entry_price: position.entry_price,
            quantity: position.quantity.abs(),
            side: if position.quantity.is_sign_positive() {
                OrderSide::Buy
            } else {
                OrderSide::Sell
            },
        }])
    }
}
