//! User-chosen strategy parameters.
//!
//! A `StrategyConfig` is never mutated while the ladder is live: every update
//! call applies its partial changes to a copy, validates the copy, and only then
//! installs it as a new [`ConfigSnapshot`] with a fresh id.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::{ControllerError, ControllerResult};

/// Highest leverage accepted by the controller.
pub const MAX_LEVERAGE: u32 = 125;
/// Upper bound on the number of ladder orders.
pub const MAX_TOTAL_ORDERS: u32 = 50;

/// Kline intervals the MACD filter may run on.
pub const SUPPORTED_TIMEFRAMES: &[&str] = &[
    "1m", "3m", "5m", "15m", "30m", "1h", "2h", "4h", "6h", "8h", "12h", "1d",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginMode {
    Crossed,
    Isolated,
}

/// How the distance between ladder levels is expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpacingType {
    /// `spacing_value` is an absolute price step
    Fixed,
    /// `spacing_value` is a percentage of the current price
    Percentage,
}

/// Round-number anchoring applied to computed level prices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnchorMode {
    None,
    Hundred,
    Thousand,
}

impl AnchorMode {
    /// The multiple prices snap to, if any.
    pub fn unit(&self) -> Option<Decimal> {
        match self {
            AnchorMode::None => None,
            AnchorMode::Hundred => Some(dec!(100)),
            AnchorMode::Thousand => Some(dec!(1000)),
        }
    }
}

/// What happens to a level once its take-profit has filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReactivationMode {
    /// Re-arm the level right away
    Immediate,
    /// Leave the level dormant until the whole ladder cycle completes
    FullCycle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacdFilterConfig {
    pub enabled: bool,
    pub fast_period: u32,
    pub slow_period: u32,
    pub signal_period: u32,
    /// Kline interval, e.g. "15m"
    pub timeframe: String,
}

impl Default for MacdFilterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fast_period: 12,
            slow_period: 26,
            signal_period: 9,
            timeframe: "15m".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicTpConfig {
    pub enabled: bool,
    /// Starting take-profit percentage before funding adjustments
    pub base_tp: Decimal,
    pub min_tp: Decimal,
    pub max_tp: Decimal,
    /// Extra percentage added on top of the funding cost
    pub safety_margin: Decimal,
    pub check_interval_minutes: u32,
}

impl Default for DynamicTpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_tp: dec!(1.5),
            min_tp: dec!(0.8),
            max_tp: dec!(3.0),
            safety_margin: dec!(0.2),
            check_interval_minutes: 60,
        }
    }
}

/// Immutable snapshot of the strategy parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Margin committed per ladder order, in USDT
    pub position_size_usdt: Decimal,
    /// Cap on ladder levels across both sides (1..=50)
    pub max_total_orders: u32,
    /// 1..=125
    pub leverage: u32,
    pub margin_mode: MarginMode,
    pub spacing_type: SpacingType,
    pub spacing_value: Decimal,
    /// Half-width of the ladder around the current price, in percent (0.1..=50)
    pub range_percent: Decimal,
    pub take_profit_percent: Decimal,
    pub anchor_mode: AnchorMode,
    /// Maximum unsnapped distance, in price units, for anchoring to apply
    pub anchor_threshold: Decimal,
    pub macd_filter: MacdFilterConfig,
    pub dynamic_tp: DynamicTpConfig,
    pub reactivation_mode: ReactivationMode,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            position_size_usdt: dec!(100),
            max_total_orders: 20,
            leverage: 10,
            margin_mode: MarginMode::Crossed,
            spacing_type: SpacingType::Percentage,
            spacing_value: dec!(0.5),
            range_percent: dec!(5),
            take_profit_percent: dec!(1.0),
            anchor_mode: AnchorMode::None,
            anchor_threshold: dec!(1),
            macd_filter: MacdFilterConfig::default(),
            dynamic_tp: DynamicTpConfig::default(),
            reactivation_mode: ReactivationMode::Immediate,
        }
    }
}

impl StrategyConfig {
    /// Check every range and ordering constraint.
    ///
    /// The first offending field is reported by name.
    pub fn validate(&self) -> ControllerResult<()> {
        if self.position_size_usdt <= Decimal::ZERO {
            return Err(ControllerError::invalid(
                "position_size_usdt",
                format!("must be greater than 0, got {}", self.position_size_usdt),
            ));
        }
        if !(1..=MAX_TOTAL_ORDERS).contains(&self.max_total_orders) {
            return Err(ControllerError::invalid(
                "max_total_orders",
                format!(
                    "must be between 1 and {}, got {}",
                    MAX_TOTAL_ORDERS, self.max_total_orders
                ),
            ));
        }
        if !(1..=MAX_LEVERAGE).contains(&self.leverage) {
            return Err(ControllerError::invalid(
                "leverage",
                format!("must be between 1 and {}, got {}", MAX_LEVERAGE, self.leverage),
            ));
        }
        if self.spacing_value <= Decimal::ZERO {
            return Err(ControllerError::invalid(
                "spacing_value",
                format!("must be greater than 0, got {}", self.spacing_value),
            ));
        }
        if self.range_percent < dec!(0.1) || self.range_percent > dec!(50) {
            return Err(ControllerError::invalid(
                "range_percent",
                format!("must be between 0.1 and 50, got {}", self.range_percent),
            ));
        }
        if self.take_profit_percent <= Decimal::ZERO {
            return Err(ControllerError::invalid(
                "take_profit_percent",
                format!("must be greater than 0, got {}", self.take_profit_percent),
            ));
        }
        if self.anchor_threshold < Decimal::ONE {
            return Err(ControllerError::invalid(
                "anchor_threshold",
                format!("must be at least 1, got {}", self.anchor_threshold),
            ));
        }

        let macd = &self.macd_filter;
        if macd.fast_period == 0 || macd.fast_period >= macd.slow_period {
            return Err(ControllerError::invalid(
                "macd_filter.fast_period",
                format!(
                    "must be at least 1 and below slow_period ({}), got {}",
                    macd.slow_period, macd.fast_period
                ),
            ));
        }
        if macd.signal_period == 0 {
            return Err(ControllerError::invalid(
                "macd_filter.signal_period",
                "must be at least 1",
            ));
        }
        if !SUPPORTED_TIMEFRAMES.contains(&macd.timeframe.as_str()) {
            return Err(ControllerError::invalid(
                "macd_filter.timeframe",
                format!("unsupported timeframe '{}'", macd.timeframe),
            ));
        }

        let tp = &self.dynamic_tp;
        if tp.min_tp <= Decimal::ZERO {
            return Err(ControllerError::invalid(
                "dynamic_tp.min_tp",
                format!("must be greater than 0, got {}", tp.min_tp),
            ));
        }
        if tp.min_tp > tp.base_tp {
            return Err(ControllerError::invalid(
                "dynamic_tp.min_tp",
                format!("must not exceed base_tp ({}), got {}", tp.base_tp, tp.min_tp),
            ));
        }
        if tp.base_tp > tp.max_tp {
            return Err(ControllerError::invalid(
                "dynamic_tp.base_tp",
                format!("must not exceed max_tp ({}), got {}", tp.max_tp, tp.base_tp),
            ));
        }
        if tp.safety_margin < Decimal::ZERO {
            return Err(ControllerError::invalid(
                "dynamic_tp.safety_margin",
                format!("must not be negative, got {}", tp.safety_margin),
            ));
        }
        if tp.check_interval_minutes == 0 {
            return Err(ControllerError::invalid(
                "dynamic_tp.check_interval_minutes",
                "must be at least 1",
            ));
        }

        Ok(())
    }

    /// Apply a risk-parameter update to a copy and validate it.
    pub fn with_risk_update(&self, update: &RiskParametersUpdate) -> ControllerResult<Self> {
        let mut next = self.clone();
        if let Some(v) = update.position_size_usdt {
            next.position_size_usdt = v;
        }
        if let Some(v) = update.max_total_orders {
            next.max_total_orders = v;
        }
        if let Some(v) = update.leverage {
            next.leverage = v;
        }
        if let Some(v) = update.margin_mode {
            next.margin_mode = v;
        }
        next.validate()?;
        Ok(next)
    }

    /// Apply a grid-settings update to a copy and validate it.
    pub fn with_grid_update(&self, update: &GridSettingsUpdate) -> ControllerResult<Self> {
        let mut next = self.clone();
        if let Some(v) = update.spacing_type {
            next.spacing_type = v;
        }
        if let Some(v) = update.spacing_value {
            next.spacing_value = v;
        }
        if let Some(v) = update.range_percent {
            next.range_percent = v;
        }
        if let Some(v) = update.take_profit_percent {
            next.take_profit_percent = v;
        }
        if let Some(v) = update.anchor_mode {
            next.anchor_mode = v;
        }
        if let Some(v) = update.anchor_threshold {
            next.anchor_threshold = v;
        }
        next.validate()?;
        Ok(next)
    }

    /// Apply a MACD filter update to a copy and validate it.
    pub fn with_macd_update(&self, update: &MacdFilterUpdate) -> ControllerResult<Self> {
        let mut next = self.clone();
        let macd = &mut next.macd_filter;
        if let Some(v) = update.enabled {
            macd.enabled = v;
        }
        if let Some(v) = update.fast_period {
            macd.fast_period = v;
        }
        if let Some(v) = update.slow_period {
            macd.slow_period = v;
        }
        if let Some(v) = update.signal_period {
            macd.signal_period = v;
        }
        if let Some(v) = &update.timeframe {
            macd.timeframe = v.clone();
        }
        next.validate()?;
        Ok(next)
    }

    /// Apply an advanced-settings update (dynamic TP, reactivation) to a copy.
    pub fn with_advanced_update(&self, update: &AdvancedSettingsUpdate) -> ControllerResult<Self> {
        let mut next = self.clone();
        let tp = &mut next.dynamic_tp;
        if let Some(v) = update.dynamic_tp_enabled {
            tp.enabled = v;
        }
        if let Some(v) = update.base_tp {
            tp.base_tp = v;
        }
        if let Some(v) = update.min_tp {
            tp.min_tp = v;
        }
        if let Some(v) = update.max_tp {
            tp.max_tp = v;
        }
        if let Some(v) = update.safety_margin {
            tp.safety_margin = v;
        }
        if let Some(v) = update.check_interval_minutes {
            tp.check_interval_minutes = v;
        }
        if let Some(v) = update.reactivation_mode {
            next.reactivation_mode = v;
        }
        next.validate()?;
        Ok(next)
    }

    /// True when the change affects where ladder levels sit.
    pub fn ladder_differs(&self, other: &StrategyConfig) -> bool {
        self.spacing_type != other.spacing_type
            || self.spacing_value != other.spacing_value
            || self.range_percent != other.range_percent
            || self.anchor_mode != other.anchor_mode
            || self.anchor_threshold != other.anchor_threshold
            || self.max_total_orders != other.max_total_orders
    }
}

/// A validated config with the id that order records reference.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigSnapshot {
    pub id: u64,
    pub config: StrategyConfig,
    pub created_at: DateTime<Utc>,
}

impl ConfigSnapshot {
    pub fn new(id: u64, config: StrategyConfig) -> Self {
        Self {
            id,
            config,
            created_at: Utc::now(),
        }
    }

    /// Successor snapshot carrying `config`.
    pub fn next(&self, config: StrategyConfig) -> Self {
        Self::new(self.id + 1, config)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskParametersUpdate {
    pub position_size_usdt: Option<Decimal>,
    pub max_total_orders: Option<u32>,
    pub leverage: Option<u32>,
    pub margin_mode: Option<MarginMode>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GridSettingsUpdate {
    pub spacing_type: Option<SpacingType>,
    pub spacing_value: Option<Decimal>,
    pub range_percent: Option<Decimal>,
    pub take_profit_percent: Option<Decimal>,
    pub anchor_mode: Option<AnchorMode>,
    pub anchor_threshold: Option<Decimal>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MacdFilterUpdate {
    pub enabled: Option<bool>,
    pub fast_period: Option<u32>,
    pub slow_period: Option<u32>,
    pub signal_period: Option<u32>,
    pub timeframe: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdvancedSettingsUpdate {
    pub dynamic_tp_enabled: Option<bool>,
    pub base_tp: Option<Decimal>,
    pub min_tp: Option<Decimal>,
    pub max_tp: Option<Decimal>,
    pub safety_margin: Option<Decimal>,
    pub check_interval_minutes: Option<u32>,
    pub reactivation_mode: Option<ReactivationMode>,
}
