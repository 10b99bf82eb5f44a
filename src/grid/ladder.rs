//! Ladder generator: spacing, symmetric capping and round-number anchoring.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::config::{SpacingType, StrategyConfig};
use crate::error::{ControllerError, ControllerResult};
use crate::exchange::OrderSide;
use crate::utils::{round_to_tick, tick_for_decimals};

/// One rung of the ladder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridLevel {
    /// Negative for buys, positive for sells; 0 is the reference price
    pub level_index: i32,
    pub price: Decimal,
    pub side: OrderSide,
    /// Signed distance from the reference price
    pub distance_from_current_percent: Decimal,
}

/// A full ladder generated around one reference price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridLadder {
    pub reference_price: Decimal,
    pub step: Decimal,
    /// Sorted by `level_index`
    pub levels: Vec<GridLevel>,
}

impl GridLadder {
    pub fn level(&self, level_index: i32) -> Option<&GridLevel> {
        self.levels.iter().find(|l| l.level_index == level_index)
    }

    pub fn buy_count(&self) -> usize {
        self.levels.iter().filter(|l| l.side == OrderSide::Buy).count()
    }

    pub fn sell_count(&self) -> usize {
        self.levels.iter().filter(|l| l.side == OrderSide::Sell).count()
    }
}

/// Generate the ladder for `current_price`.
///
/// Pure and deterministic. When the per-side count exceeds the order cap the
/// outermost levels are dropped; an odd cap gives the spare slot to the buy
/// side. A side whose range cannot fit a single step is left empty.
pub fn generate_levels(
    current_price: Decimal,
    config: &StrategyConfig,
    price_decimals: u32,
) -> ControllerResult<GridLadder> {
    if current_price <= Decimal::ZERO {
        return Err(ControllerError::MarketDataUnavailable(format!(
            "cannot build a ladder around price {}",
            current_price
        )));
    }

    let step = match config.spacing_type {
        SpacingType::Fixed => config.spacing_value,
        SpacingType::Percentage => current_price * config.spacing_value / dec!(100),
    };
    if step <= Decimal::ZERO {
        return Err(ControllerError::invalid(
            "spacing_value",
            format!("must be greater than 0, got {}", config.spacing_value),
        ));
    }

    let per_side = (config.range_percent / dec!(100) * current_price / step)
        .floor()
        .to_u32()
        .unwrap_or(0);
    let buy_count = per_side.min(config.max_total_orders.div_ceil(2));
    let sell_count = per_side.min(config.max_total_orders / 2);

    let tick = tick_for_decimals(price_decimals);
    let buys = anchor_side(
        current_price,
        side_prices(current_price, step, buy_count, OrderSide::Buy, tick),
        OrderSide::Buy,
        config,
    );
    let sells = anchor_side(
        current_price,
        side_prices(current_price, step, sell_count, OrderSide::Sell, tick),
        OrderSide::Sell,
        config,
    );

    let to_level = |offset: usize, price: Decimal, side: OrderSide| {
        let distance = offset as i32 + 1;
        GridLevel {
            level_index: match side {
                OrderSide::Buy => -distance,
                OrderSide::Sell => distance,
            },
            price,
            side,
            distance_from_current_percent: ((price - current_price) / current_price * dec!(100))
                .round_dp(4),
        }
    };

    let mut levels: Vec<GridLevel> = buys
        .into_iter()
        .enumerate()
        .map(|(i, p)| to_level(i, p, OrderSide::Buy))
        .chain(
            sells
                .into_iter()
                .enumerate()
                .map(|(i, p)| to_level(i, p, OrderSide::Sell)),
        )
        .collect();
    levels.sort_by_key(|l| l.level_index);

    Ok(GridLadder {
        reference_price: current_price,
        step,
        levels,
    })
}

/// Tick-rounded prices for one side, innermost first.
///
/// Stops early if a price would reach zero or rounding would stop moving
/// away from the reference.
fn side_prices(
    reference: Decimal,
    step: Decimal,
    count: u32,
    side: OrderSide,
    tick: Decimal,
) -> Vec<Decimal> {
    let mut prices = Vec::with_capacity(count as usize);
    let mut previous = reference;

    for i in 1..=count {
        let offset = step * Decimal::from(i);
        let raw = match side {
            OrderSide::Buy => reference - offset,
            OrderSide::Sell => reference + offset,
        };
        let price = round_to_tick(raw, tick);

        let moves_outward = match side {
            OrderSide::Buy => price < previous && price > Decimal::ZERO,
            OrderSide::Sell => price > previous,
        };
        if !moves_outward {
            break;
        }
        prices.push(price);
        previous = price;
    }

    prices
}

/// Snap prices to round multiples where the snap is close enough and keeps
/// the side strictly ordered.
fn anchor_side(
    reference: Decimal,
    prices: Vec<Decimal>,
    side: OrderSide,
    config: &StrategyConfig,
) -> Vec<Decimal> {
    let Some(unit) = config.anchor_mode.unit() else {
        return prices;
    };

    let mut anchored = Vec::with_capacity(prices.len());
    let mut inner = reference;

    for (i, &price) in prices.iter().enumerate() {
        let snapped = (price / unit).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
            * unit;
        let outer = prices.get(i + 1).copied();

        let close_enough = (price - snapped).abs() <= config.anchor_threshold;
        let keeps_order = match side {
            OrderSide::Buy => {
                snapped < inner && outer.map_or(snapped > Decimal::ZERO, |o| snapped > o)
            }
            OrderSide::Sell => snapped > inner && outer.map_or(true, |o| snapped < o),
        };

        let chosen = if close_enough && keeps_order {
            snapped
        } else {
            price
        };
        anchored.push(chosen);
        inner = chosen;
    }

    anchored
}
