//! # Perp Grid Controller
//!
//! A MACD-gated grid trading controller for a single perpetual-futures
//! instrument on Binance Futures.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `error`: Controller error taxonomy
//! - `exchange`: Exchange capability, Binance REST adapter and paper exchange
//! - `grid`: Grid ladder generation
//! - `risk`: Capital at risk and liquidation distance estimates
//! - `strategy`: Activation gate, take-profit policy, state machine and ladder management
//! - `runtime`: Per-account serial actors and their event feeders
//! - `persistence`: SQLite-based state persistence
//! - `utils`: Shared utilities and decimal arithmetic

pub mod config;
pub mod error;
pub mod exchange;
pub mod grid;
pub mod persistence;
pub mod risk;
pub mod runtime;
pub mod strategy;
pub mod utils;

pub use config::AppConfig;
pub use error::{ControllerError, ControllerResult};
