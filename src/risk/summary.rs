//! Exposure and liquidation estimates for a strategy config.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::{RiskBands, StrategyConfig};

/// Liquidation risk band derived from leverage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LiquidationRisk {
    Low,
    Medium,
    High,
}

impl LiquidationRisk {
    pub fn for_leverage(leverage: u32, bands: &RiskBands) -> Self {
        if leverage <= bands.low_max_leverage {
            LiquidationRisk::Low
        } else if leverage <= bands.medium_max_leverage {
            LiquidationRisk::Medium
        } else {
            LiquidationRisk::High
        }
    }
}

impl fmt::Display for LiquidationRisk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LiquidationRisk::Low => "low",
            LiquidationRisk::Medium => "medium",
            LiquidationRisk::High => "high",
        };
        f.write_str(label)
    }
}

/// Capital and liquidation figures for one config.
///
/// `liquidation_distance_percent` is the `100 / leverage` approximation,
/// ignoring maintenance margin and fees. Treat it as an estimate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskSummary {
    /// Margin committed if every ladder order fills
    pub total_capital: Decimal,
    pub notional_per_order: Decimal,
    pub total_notional: Decimal,
    pub liquidation_distance_percent: Decimal,
    pub liquidation_risk: LiquidationRisk,
    /// Loss on one position carried to liquidation
    pub max_loss_per_trade: Decimal,
}

/// Risk summary with the default liquidation bands.
pub fn compute_risk_summary(config: &StrategyConfig) -> RiskSummary {
    compute_risk_summary_with(config, &RiskBands::default())
}

/// Risk summary with explicit liquidation bands. Always computed fresh.
pub fn compute_risk_summary_with(config: &StrategyConfig, bands: &RiskBands) -> RiskSummary {
    let orders = Decimal::from(config.max_total_orders);
    let leverage = Decimal::from(config.leverage.max(1));

    let total_capital = config.position_size_usdt * orders;
    let notional_per_order = config.position_size_usdt * leverage;
    let liquidation_distance_percent = (dec!(100) / leverage).round_dp(4);

    RiskSummary {
        total_capital,
        notional_per_order,
        total_notional: notional_per_order * orders,
        liquidation_distance_percent,
        liquidation_risk: LiquidationRisk::for_leverage(config.leverage, bands),
        max_loss_per_trade: (notional_per_order * liquidation_distance_percent / dec!(100))
            .round_dp(4),
    }
}
