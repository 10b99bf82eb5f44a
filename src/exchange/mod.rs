//! Exchange integrations for the grid controller.
//!
//! ## Binance
//! REST adapter for USDⓈ-M perpetuals:
//! - Market data (mark price, funding rate, klines for MACD)
//! - Symbol setup (leverage, margin type)
//! - Limit orders keyed by client order id
//!
//! ## Paper
//! In-memory venue used for dry runs and tests.

mod client;
pub mod indicators;
pub mod mock;
mod traits;
mod types;

pub use client::BinanceFuturesClient;
pub use mock::{PaperExchange, PlaceFault};
pub use traits::*;
pub use types::*;
