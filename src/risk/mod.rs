//! Risk engine for the grid ladder.
//!
//! Derives capital at risk, per-order notional and an estimated liquidation
//! distance from the risk parameters of a [`StrategyConfig`](crate::config::StrategyConfig).

mod summary;

pub use summary::{compute_risk_summary, compute_risk_summary_with, LiquidationRisk, RiskSummary};
