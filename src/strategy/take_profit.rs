//! Funding-aware take-profit policy.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::debug;

use crate::config::{DynamicTpConfig, StrategyConfig};

/// `clamp(base + max(0, funding) + safety, min, max)`.
pub fn recompute(funding_rate_percent: Decimal, config: &DynamicTpConfig) -> Decimal {
    let raw = config.base_tp + funding_rate_percent.max(Decimal::ZERO) + config.safety_margin;
    raw.max(config.min_tp).min(config.max_tp)
}

/// Holds the effective take-profit applied to new fills.
///
/// Only future take-profit placements see a new value; resting TP orders are
/// never repriced.
#[derive(Debug, Clone)]
pub struct DynamicTakeProfit {
    effective: Decimal,
    last_funding_rate_percent: Option<Decimal>,
    last_checked_at: Option<DateTime<Utc>>,
}

impl DynamicTakeProfit {
    pub fn new(config: &StrategyConfig) -> Self {
        let mut policy = Self {
            effective: config.take_profit_percent,
            last_funding_rate_percent: None,
            last_checked_at: None,
        };
        policy.apply_config(config);
        policy
    }

    pub fn effective(&self) -> Decimal {
        self.effective
    }

    pub fn last_checked_at(&self) -> Option<DateTime<Utc>> {
        self.last_checked_at
    }

    /// Resume from a persisted effective value. A disabled policy keeps the
    /// configured take-profit.
    pub fn restore(&mut self, effective: Decimal, config: &StrategyConfig) {
        if config.dynamic_tp.enabled {
            self.effective = effective
                .max(config.dynamic_tp.min_tp)
                .min(config.dynamic_tp.max_tp);
        }
    }

    /// Re-derive the effective value after a config change.
    pub fn apply_config(&mut self, config: &StrategyConfig) -> Decimal {
        self.effective = if config.dynamic_tp.enabled {
            recompute(
                self.last_funding_rate_percent.unwrap_or(Decimal::ZERO),
                &config.dynamic_tp,
            )
        } else {
            config.take_profit_percent
        };
        self.effective
    }

    /// Timer tick. Returns the new value, or `None` when the policy is disabled.
    pub fn on_timer(&mut self, funding_rate_percent: Decimal, config: &StrategyConfig) -> Option<Decimal> {
        if !config.dynamic_tp.enabled {
            self.effective = config.take_profit_percent;
            return None;
        }

        let next = recompute(funding_rate_percent, &config.dynamic_tp);
        debug!(
            funding_rate_percent = %funding_rate_percent,
            previous = %self.effective,
            effective = %next,
            "Recomputed take-profit"
        );
        self.effective = next;
        self.last_funding_rate_percent = Some(funding_rate_percent);
        self.last_checked_at = Some(Utc::now());
        Some(next)
    }
}
