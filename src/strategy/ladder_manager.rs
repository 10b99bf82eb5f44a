//! Order ladder manager.
//!
//! Keeps the exchange in line with the desired ladder: places missing levels,
//! cancels stale pending ones, follows fills into take-profit orders and closes
//! the pair when the take-profit fills. The exchange is the source of truth;
//! local records that disagree with it are corrected and logged.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::{ControllerSettings, ReactivationMode, StrategyConfig};
use crate::error::ControllerError;
use crate::exchange::{
    with_timeout, ExchangeError, ExchangeGateway, ExchangeOrderState, OrderRequest, OrderSide,
};
use crate::grid::{GridLadder, GridLevel};
use crate::utils::{percentage_diff, round_down_to_lot, round_to_tick, tick_for_decimals};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Filled,
    TpHit,
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::TpHit | OrderStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Filled => "FILLED",
            OrderStatus::TpHit => "TP_HIT",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OrderStatus::Pending),
            "FILLED" => Ok(OrderStatus::Filled),
            "TP_HIT" => Ok(OrderStatus::TpHit),
            "CANCELLED" => Ok(OrderStatus::Cancelled),
            other => Err(ControllerError::Persistence(format!(
                "unknown order status '{}'",
                other
            ))),
        }
    }
}

/// One ladder entry order and its paired take-profit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub level_index: i32,
    /// Snapshot id of the config in force when the entry was placed
    pub config_snapshot_id: u64,
    pub seq: u64,
    pub client_order_id: String,
    pub order_id: Option<String>,
    pub side: OrderSide,
    pub status: OrderStatus,
    /// Limit price while pending, fill price once filled
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub tp_price: Option<Decimal>,
    pub tp_client_order_id: Option<String>,
    pub tp_order_id: Option<String>,
    /// Placement timed out; the next sync decides whether it exists
    pub unconfirmed: bool,
    pub created_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl OrderRecord {
    pub fn is_pending(&self) -> bool {
        self.status == OrderStatus::Pending
    }

    /// Pending orders the manager may cancel or move.
    fn is_movable(&self) -> bool {
        self.status == OrderStatus::Pending && !self.unconfirmed && self.filled_quantity.is_zero()
    }

    fn mark_filled(&mut self, avg_price: Decimal, filled_quantity: Decimal) {
        if avg_price > Decimal::ZERO {
            self.entry_price = avg_price;
        }
        if filled_quantity > Decimal::ZERO {
            self.quantity = filled_quantity;
        }
        self.filled_quantity = self.quantity;
        self.status = OrderStatus::Filled;
        self.filled_at = Some(Utc::now());
    }

    fn close(&mut self, status: OrderStatus) {
        self.status = status;
        self.closed_at = Some(Utc::now());
    }

    fn clear_take_profit(&mut self) {
        self.tp_price = None;
        self.tp_client_order_id = None;
        self.tp_order_id = None;
    }

    /// Realized PnL of the pair when the take-profit fills at `exit_price`.
    pub fn realized_pnl(&self, exit_price: Decimal) -> Decimal {
        match self.side {
            OrderSide::Buy => (exit_price - self.entry_price) * self.quantity,
            OrderSide::Sell => (self.entry_price - exit_price) * self.quantity,
        }
    }
}

/// Deterministic client order id: `{prefix}{snapshot}-{level}-{seq}`.
///
/// Negative levels are written as `n{abs}` to stay within the exchange's
/// allowed character set.
pub fn client_order_id(prefix: char, snapshot_id: u64, level_index: i32, seq: u64) -> String {
    let level = if level_index < 0 {
        format!("n{}", level_index.unsigned_abs())
    } else {
        level_index.to_string()
    };
    format!("{}{}-{}-{}", prefix, snapshot_id, level, seq)
}

/// Orders to place and cancel to move the exchange onto the desired ladder.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilePlan {
    /// Innermost levels first
    pub to_place: Vec<GridLevel>,
    /// Client order ids of pending orders to cancel
    pub to_cancel: Vec<String>,
}

/// Diff `desired` against `current` by level index.
///
/// Only movable pending orders are ever cancelled; a filled entry waiting on
/// its take-profit keeps its level. A pending order whose level moved is
/// cancelled and its level re-placed.
pub fn reconcile(desired: &[GridLevel], current: &[OrderRecord]) -> ReconcilePlan {
    let live: HashMap<i32, &OrderRecord> = current
        .iter()
        .filter(|o| !o.status.is_terminal())
        .map(|o| (o.level_index, o))
        .collect();
    let wanted: HashSet<i32> = desired.iter().map(|l| l.level_index).collect();

    let mut plan = ReconcilePlan::default();

    for level in desired {
        match live.get(&level.level_index) {
            None => plan.to_place.push(level.clone()),
            Some(record)
                if record.is_movable()
                    && (record.entry_price != level.price || record.side != level.side) =>
            {
                plan.to_cancel.push(record.client_order_id.clone());
                plan.to_place.push(level.clone());
            }
            Some(_) => {}
        }
    }

    for record in live.values() {
        if record.is_movable() && !wanted.contains(&record.level_index) {
            plan.to_cancel.push(record.client_order_id.clone());
        }
    }

    plan.to_place
        .sort_by_key(|l| (l.level_index.unsigned_abs(), l.level_index));
    plan.to_cancel.sort();
    plan
}

/// A level whose order could not be placed or cancelled this pass.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelFailure {
    pub level_index: i32,
    pub error: ControllerError,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub placed: usize,
    pub cancelled: usize,
    /// Placements whose outcome is unknown after a timeout
    pub unconfirmed: usize,
    pub failed: Vec<LevelFailure>,
    pub conflicts: Vec<ControllerError>,
}

/// A closed entry/take-profit pair.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedTrade {
    pub level_index: i32,
    pub pnl: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub fills: usize,
    pub take_profits_placed: usize,
    pub closed: Vec<ClosedTrade>,
    pub conflicts: Vec<ControllerError>,
    pub failed: Vec<LevelFailure>,
    /// Status queries that failed; retried on the next pass
    pub query_errors: usize,
}

/// Inputs a sync pass needs from the strategy.
#[derive(Debug, Clone, Copy)]
pub struct SyncContext {
    pub take_profit_percent: Decimal,
    /// False once the strategy is stopped
    pub place_take_profits: bool,
    pub reactivation_mode: ReactivationMode,
}

/// Exchange and retry settings for the manager.
#[derive(Debug, Clone)]
pub struct LadderSettings {
    pub symbol: String,
    pub call_timeout: Duration,
    pub max_place_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub price_decimals: u32,
    pub quantity_decimals: u32,
}

impl From<&ControllerSettings> for LadderSettings {
    fn from(settings: &ControllerSettings) -> Self {
        Self {
            symbol: settings.symbol.clone(),
            call_timeout: settings.exchange_timeout(),
            max_place_attempts: settings.max_place_attempts.max(1),
            retry_base_delay: Duration::from_millis(settings.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(settings.retry_max_delay_ms),
            price_decimals: settings.price_decimals,
            quantity_decimals: settings.quantity_decimals,
        }
    }
}

enum PlaceOutcome {
    Placed(String),
    /// Timed out; the order may or may not exist
    Unknown,
    Failed(ControllerError),
}

/// Owns the active ladder and the non-terminal order records.
pub struct OrderLadderManager {
    settings: LadderSettings,
    ladder: Option<GridLadder>,
    orders: Vec<OrderRecord>,
    /// Levels resting after a take-profit in full-cycle mode
    dormant: HashSet<i32>,
    /// Records changed since the last `take_dirty`
    dirty: Vec<OrderRecord>,
    next_seq: u64,
}

impl OrderLadderManager {
    pub fn new(settings: LadderSettings) -> Self {
        Self {
            settings,
            ladder: None,
            orders: Vec::new(),
            dormant: HashSet::new(),
            dirty: Vec::new(),
            next_seq: 1,
        }
    }

    /// Load records recovered from the store.
    pub fn restore(&mut self, records: Vec<OrderRecord>, last_seq: u64) {
        self.orders = records
            .into_iter()
            .filter(|r| !r.status.is_terminal())
            .collect();
        self.next_seq = self.next_seq.max(last_seq + 1);
        info!(
            records = self.orders.len(),
            next_seq = self.next_seq,
            "Restored order records"
        );
    }

    pub fn ladder(&self) -> Option<&GridLadder> {
        self.ladder.as_ref()
    }

    /// Replace the ladder. Dormant levels belong to the old ladder and are cleared.
    pub fn install_ladder(&mut self, ladder: GridLadder) {
        debug!(
            reference_price = %ladder.reference_price,
            levels = ladder.levels.len(),
            "Installing ladder"
        );
        self.ladder = Some(ladder);
        self.dormant.clear();
    }

    pub fn clear_ladder(&mut self) {
        self.ladder = None;
        self.dormant.clear();
    }

    /// Non-terminal order records.
    pub fn records(&self) -> &[OrderRecord] {
        &self.orders
    }

    pub fn dormant_levels(&self) -> &HashSet<i32> {
        &self.dormant
    }

    pub fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    /// Whether `price` has moved far enough from the ladder reference.
    pub fn drifted(&self, price: Decimal, threshold_percent: Decimal) -> bool {
        match &self.ladder {
            Some(ladder) => percentage_diff(price, ladder.reference_price) >= threshold_percent,
            None => true,
        }
    }

    /// Full-cycle completion: some levels went dormant and no entry is
    /// still waiting on its take-profit.
    pub fn cycle_complete(&self) -> bool {
        !self.dormant.is_empty() && !self.orders.iter().any(|o| o.status == OrderStatus::Filled)
    }

    pub fn take_dirty(&mut self) -> Vec<OrderRecord> {
        std::mem::take(&mut self.dirty)
    }

    /// Put back records whose write failed, ahead of anything changed since.
    pub fn requeue_dirty(&mut self, mut records: Vec<OrderRecord>) {
        records.append(&mut self.dirty);
        self.dirty = records;
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn prune_terminal(&mut self) {
        self.orders.retain(|o| !o.status.is_terminal());
    }

    /// Query every non-terminal record and follow fills.
    pub async fn sync(&mut self, exchange: &dyn ExchangeGateway, ctx: &SyncContext) -> SyncReport {
        let mut report = SyncReport::default();
        for index in 0..self.orders.len() {
            self.sync_at(index, exchange, ctx, &mut report).await;
        }
        self.prune_terminal();
        report
    }

    /// Sync the record owning `client_order_id` (entry or take-profit).
    /// Returns `None` if no live record matches.
    pub async fn sync_order(
        &mut self,
        exchange: &dyn ExchangeGateway,
        client_order_id: &str,
        ctx: &SyncContext,
    ) -> Option<SyncReport> {
        let index = self.orders.iter().position(|o| {
            o.client_order_id == client_order_id
                || o.tp_client_order_id.as_deref() == Some(client_order_id)
        })?;

        let mut report = SyncReport::default();
        self.sync_at(index, exchange, ctx, &mut report).await;
        self.prune_terminal();
        Some(report)
    }

    async fn sync_at(
        &mut self,
        index: usize,
        exchange: &dyn ExchangeGateway,
        ctx: &SyncContext,
        report: &mut SyncReport,
    ) {
        let before = self.orders[index].clone();
        let mut record = before.clone();

        match record.status {
            OrderStatus::Pending => self.sync_entry(&mut record, exchange, report).await,
            OrderStatus::Filled => self.sync_take_profit(&mut record, exchange, report).await,
            OrderStatus::TpHit | OrderStatus::Cancelled => {}
        }

        if record.status == OrderStatus::Filled && before.status == OrderStatus::Pending {
            report.fills += 1;
            info!(
                level_index = record.level_index,
                side = %record.side,
                entry_price = %record.entry_price,
                quantity = %record.quantity,
                "Ladder order filled"
            );
        }

        if record.status == OrderStatus::TpHit
            && ctx.reactivation_mode == ReactivationMode::FullCycle
        {
            self.dormant.insert(record.level_index);
        }

        if record.status == OrderStatus::Filled
            && record.tp_client_order_id.is_none()
            && ctx.place_take_profits
        {
            self.place_take_profit(&mut record, exchange, ctx.take_profit_percent, report)
                .await;
        }

        if record != before {
            self.dirty.push(record.clone());
        }
        self.orders[index] = record;
    }

    async fn sync_entry(
        &self,
        record: &mut OrderRecord,
        exchange: &dyn ExchangeGateway,
        report: &mut SyncReport,
    ) {
        let status = with_timeout(
            self.settings.call_timeout,
            exchange.get_order_status(&self.settings.symbol, &record.client_order_id),
        )
        .await;

        match status {
            Err(e) => {
                report.query_errors += 1;
                warn!(
                    client_order_id = %record.client_order_id,
                    error = %e,
                    "Order status query failed"
                );
            }
            Ok(None) => {
                let detail = if record.unconfirmed {
                    "timed-out placement never reached the exchange"
                } else {
                    "order unknown to the exchange"
                };
                report.conflicts.push(conflict(record, detail));
                record.close(OrderStatus::Cancelled);
            }
            Ok(Some(exchange_order)) => {
                if record.unconfirmed {
                    debug!(
                        client_order_id = %record.client_order_id,
                        "Timed-out placement confirmed on the exchange"
                    );
                }
                record.order_id = Some(exchange_order.order_id);
                record.unconfirmed = false;
                record.filled_quantity = exchange_order.filled_quantity;

                if exchange_order.state == ExchangeOrderState::Filled {
                    record.mark_filled(exchange_order.avg_price, exchange_order.filled_quantity);
                } else if exchange_order.state.is_dead() {
                    if exchange_order.filled_quantity > Decimal::ZERO {
                        // Partially filled then cancelled: the filled part still needs its exit
                        record.mark_filled(
                            exchange_order.avg_price,
                            exchange_order.filled_quantity,
                        );
                    } else {
                        report
                            .conflicts
                            .push(conflict(record, "order closed outside the controller"));
                        record.close(OrderStatus::Cancelled);
                    }
                }
            }
        }
    }

    async fn sync_take_profit(
        &self,
        record: &mut OrderRecord,
        exchange: &dyn ExchangeGateway,
        report: &mut SyncReport,
    ) {
        let Some(tp_client_order_id) = record.tp_client_order_id.clone() else {
            return;
        };

        let status = with_timeout(
            self.settings.call_timeout,
            exchange.get_order_status(&self.settings.symbol, &tp_client_order_id),
        )
        .await;

        match status {
            Err(e) => {
                report.query_errors += 1;
                warn!(
                    client_order_id = %tp_client_order_id,
                    error = %e,
                    "Take-profit status query failed"
                );
            }
            Ok(Some(tp)) if tp.state == ExchangeOrderState::Filled => {
                let exit_price = if tp.avg_price > Decimal::ZERO {
                    tp.avg_price
                } else {
                    record.tp_price.unwrap_or(record.entry_price)
                };
                let pnl = record.realized_pnl(exit_price);
                record.tp_order_id = Some(tp.order_id);
                record.close(OrderStatus::TpHit);

                info!(
                    level_index = record.level_index,
                    entry_price = %record.entry_price,
                    exit_price = %exit_price,
                    pnl = %pnl,
                    "Take-profit filled"
                );
                report.closed.push(ClosedTrade {
                    level_index: record.level_index,
                    pnl,
                });
            }
            Ok(Some(tp)) if tp.state.is_open() => {
                record.tp_order_id = Some(tp.order_id);
            }
            Ok(Some(_)) => {
                report.conflicts.push(conflict(
                    record,
                    "take-profit closed outside the controller",
                ));
                record.clear_take_profit();
            }
            Ok(None) => {
                report
                    .conflicts
                    .push(conflict(record, "take-profit unknown to the exchange"));
                record.clear_take_profit();
            }
        }
    }

    async fn place_take_profit(
        &mut self,
        record: &mut OrderRecord,
        exchange: &dyn ExchangeGateway,
        take_profit_percent: Decimal,
        report: &mut SyncReport,
    ) {
        let offset = record.entry_price * take_profit_percent / dec!(100);
        let raw = match record.side {
            OrderSide::Buy => record.entry_price + offset,
            OrderSide::Sell => record.entry_price - offset,
        };
        let price = round_to_tick(raw, tick_for_decimals(self.settings.price_decimals));

        let seq = self.next_seq();
        let request = OrderRequest {
            symbol: self.settings.symbol.clone(),
            side: record.side.opposite(),
            price,
            quantity: record.quantity,
            client_order_id: client_order_id('t', record.config_snapshot_id, record.level_index, seq),
            reduce_only: true,
        };

        match self.place_with_retry(exchange, &request, record.level_index).await {
            PlaceOutcome::Placed(order_id) => {
                info!(
                    level_index = record.level_index,
                    tp_price = %price,
                    take_profit_percent = %take_profit_percent,
                    "Take-profit placed"
                );
                record.tp_price = Some(price);
                record.tp_client_order_id = Some(request.client_order_id);
                record.tp_order_id = Some(order_id);
                report.take_profits_placed += 1;
            }
            PlaceOutcome::Unknown => {
                record.tp_price = Some(price);
                record.tp_client_order_id = Some(request.client_order_id);
                record.tp_order_id = None;
            }
            PlaceOutcome::Failed(err) => {
                error!(level_index = record.level_index, error = %err, "Take-profit placement failed");
                report.failed.push(LevelFailure {
                    level_index: record.level_index,
                    error: err,
                });
            }
        }
    }

    /// Move the exchange onto the installed ladder.
    pub async fn reconcile_ladder(
        &mut self,
        exchange: &dyn ExchangeGateway,
        config: &StrategyConfig,
        snapshot_id: u64,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let Some(ladder) = &self.ladder else {
            return report;
        };

        let desired: Vec<GridLevel> = ladder
            .levels
            .iter()
            .filter(|l| !self.dormant.contains(&l.level_index))
            .cloned()
            .collect();
        let plan = reconcile(&desired, &self.orders);

        for client_order_id in &plan.to_cancel {
            self.cancel_record(exchange, client_order_id, &mut report).await;
        }

        // A level whose cancel failed keeps its old order this pass
        let occupied: HashSet<i32> = self
            .orders
            .iter()
            .filter(|o| !o.status.is_terminal())
            .map(|o| o.level_index)
            .collect();

        for level in plan.to_place.iter().filter(|l| !occupied.contains(&l.level_index)) {
            self.place_entry(exchange, level, config, snapshot_id, &mut report)
                .await;
        }

        self.prune_terminal();

        if !report.failed.is_empty() || report.placed > 0 || report.cancelled > 0 {
            info!(
                placed = report.placed,
                cancelled = report.cancelled,
                unconfirmed = report.unconfirmed,
                failed = report.failed.len(),
                "Reconciliation pass complete"
            );
        }
        report
    }

    /// Cancel every pending entry. Filled entries keep their take-profit, and
    /// the filled part of a partially filled entry gets one at
    /// `take_profit_percent`.
    pub async fn cancel_pending(
        &mut self,
        exchange: &dyn ExchangeGateway,
        take_profit_percent: Decimal,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let pending: Vec<String> = self
            .orders
            .iter()
            .filter(|o| o.status == OrderStatus::Pending && !o.unconfirmed)
            .map(|o| o.client_order_id.clone())
            .collect();

        for client_order_id in &pending {
            self.cancel_record(exchange, client_order_id, &mut report).await;
        }

        for index in 0..self.orders.len() {
            let record = &self.orders[index];
            if record.status != OrderStatus::Filled
                || record.tp_client_order_id.is_some()
                || !pending.contains(&record.client_order_id)
            {
                continue;
            }

            let mut record = record.clone();
            let mut exits = SyncReport::default();
            self.place_take_profit(&mut record, exchange, take_profit_percent, &mut exits)
                .await;
            report.failed.extend(exits.failed);
            self.dirty.push(record.clone());
            self.orders[index] = record;
        }

        self.prune_terminal();
        report
    }

    async fn cancel_record(
        &mut self,
        exchange: &dyn ExchangeGateway,
        client_order_id: &str,
        report: &mut ReconcileReport,
    ) {
        let Some(index) = self
            .orders
            .iter()
            .position(|o| o.client_order_id == client_order_id)
        else {
            return;
        };
        let Some(order_id) = self.orders[index].order_id.clone() else {
            return;
        };
        let level_index = self.orders[index].level_index;

        let result = with_timeout(
            self.settings.call_timeout,
            exchange.cancel_order(&self.settings.symbol, &order_id),
        )
        .await;

        match result {
            Ok(()) => {
                let record = &mut self.orders[index];
                if record.filled_quantity > Decimal::ZERO {
                    // The filled part stays open as a position
                    let filled = record.filled_quantity;
                    record.mark_filled(Decimal::ZERO, filled);
                    info!(
                        level_index,
                        %client_order_id,
                        filled_quantity = %filled,
                        "Cancelled partially filled order, keeping the filled part"
                    );
                } else {
                    record.close(OrderStatus::Cancelled);
                    debug!(level_index, %client_order_id, "Cancelled pending order");
                }
                self.dirty.push(record.clone());
                report.cancelled += 1;
            }
            Err(ExchangeError::NotFound(msg)) => {
                // Filled or closed in the meantime; the next sync settles it
                report
                    .conflicts
                    .push(conflict(&self.orders[index], &format!("cancel found no open order: {}", msg)));
            }
            Err(e) => {
                warn!(level_index, %client_order_id, error = %e, "Cancel failed");
                report.failed.push(LevelFailure {
                    level_index,
                    error: ControllerError::from_exchange(level_index, &e),
                });
            }
        }
    }

    async fn place_entry(
        &mut self,
        exchange: &dyn ExchangeGateway,
        level: &GridLevel,
        config: &StrategyConfig,
        snapshot_id: u64,
        report: &mut ReconcileReport,
    ) {
        let notional = config.position_size_usdt * Decimal::from(config.leverage);
        let quantity = round_down_to_lot(
            notional / level.price,
            tick_for_decimals(self.settings.quantity_decimals),
        );
        if quantity <= Decimal::ZERO {
            report.failed.push(LevelFailure {
                level_index: level.level_index,
                error: ControllerError::ExchangeRejected {
                    level_index: level.level_index,
                    reason: format!("order quantity rounds to zero at price {}", level.price),
                },
            });
            return;
        }

        let seq = self.next_seq();
        let request = OrderRequest {
            symbol: self.settings.symbol.clone(),
            side: level.side,
            price: level.price,
            quantity,
            client_order_id: client_order_id('g', snapshot_id, level.level_index, seq),
            reduce_only: false,
        };

        let (order_id, unconfirmed) =
            match self.place_with_retry(exchange, &request, level.level_index).await {
                PlaceOutcome::Placed(order_id) => {
                    report.placed += 1;
                    (Some(order_id), false)
                }
                PlaceOutcome::Unknown => {
                    report.unconfirmed += 1;
                    (None, true)
                }
                PlaceOutcome::Failed(err) => {
                    error!(
                        level_index = level.level_index,
                        price = %level.price,
                        error = %err,
                        "Level placement failed"
                    );
                    report.failed.push(LevelFailure {
                        level_index: level.level_index,
                        error: err,
                    });
                    return;
                }
            };

        let record = OrderRecord {
            level_index: level.level_index,
            config_snapshot_id: snapshot_id,
            seq,
            client_order_id: request.client_order_id,
            order_id,
            side: level.side,
            status: OrderStatus::Pending,
            entry_price: level.price,
            quantity,
            filled_quantity: Decimal::ZERO,
            tp_price: None,
            tp_client_order_id: None,
            tp_order_id: None,
            unconfirmed,
            created_at: Utc::now(),
            filled_at: None,
            closed_at: None,
        };
        self.dirty.push(record.clone());
        self.orders.push(record);
    }

    /// Place with bounded exponential backoff.
    ///
    /// A timeout ends the attempt loop: the order may exist, and retrying
    /// could duplicate it.
    async fn place_with_retry(
        &self,
        exchange: &dyn ExchangeGateway,
        request: &OrderRequest,
        level_index: i32,
    ) -> PlaceOutcome {
        let max_attempts = self.settings.max_place_attempts;
        let mut delay = self.settings.retry_base_delay;
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            match with_timeout(self.settings.call_timeout, exchange.place_order(request)).await {
                Ok(order_id) => return PlaceOutcome::Placed(order_id),
                Err(ExchangeError::Timeout) => {
                    warn!(
                        level_index,
                        client_order_id = %request.client_order_id,
                        "Placement timed out, outcome unknown"
                    );
                    return PlaceOutcome::Unknown;
                }
                Err(e) => {
                    warn!(
                        level_index,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Order failed, retrying"
                    );
                    last_error = Some(e);

                    if attempt < max_attempts {
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(self.settings.retry_max_delay);
                    }
                }
            }
        }

        let err = last_error.unwrap_or_else(|| ExchangeError::Transient("no attempts made".into()));
        PlaceOutcome::Failed(ControllerError::from_exchange(level_index, &err))
    }
}

fn conflict(record: &OrderRecord, detail: &str) -> ControllerError {
    let err = ControllerError::ReconciliationConflict {
        client_order_id: record.client_order_id.clone(),
        detail: detail.to_string(),
    };
    warn!(level_index = record.level_index, error = %err, "Local order state corrected");
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpacingType;
    use crate::exchange::{MockExchangeGateway, OrderStatusReport, PaperExchange, PlaceFault};
    use crate::grid::generate_levels;

    fn settings() -> LadderSettings {
        LadderSettings {
            symbol: "BTCUSDT".to_string(),
            call_timeout: Duration::from_millis(200),
            max_place_attempts: 3,
            retry_base_delay: Duration::from_millis(1),
            retry_max_delay: Duration::from_millis(4),
            price_decimals: 2,
            quantity_decimals: 3,
        }
    }

    fn config() -> StrategyConfig {
        StrategyConfig {
            spacing_type: SpacingType::Fixed,
            spacing_value: dec!(500),
            range_percent: dec!(1.1),
            max_total_orders: 4,
            position_size_usdt: dec!(100),
            leverage: 10,
            ..Default::default()
        }
    }

    fn ctx(mode: ReactivationMode) -> SyncContext {
        SyncContext {
            take_profit_percent: dec!(1),
            place_take_profits: true,
            reactivation_mode: mode,
        }
    }

    fn level(level_index: i32, price: Decimal) -> GridLevel {
        GridLevel {
            level_index,
            price,
            side: if level_index < 0 {
                OrderSide::Buy
            } else {
                OrderSide::Sell
            },
            distance_from_current_percent: Decimal::ZERO,
        }
    }

    fn record(level_index: i32, price: Decimal, status: OrderStatus) -> OrderRecord {
        OrderRecord {
            level_index,
            config_snapshot_id: 1,
            seq: level_index.unsigned_abs() as u64,
            client_order_id: client_order_id('g', 1, level_index, level_index.unsigned_abs() as u64),
            order_id: Some(format!("{}", 100 + level_index)),
            side: if level_index < 0 {
                OrderSide::Buy
            } else {
                OrderSide::Sell
            },
            status,
            entry_price: price,
            quantity: dec!(0.01),
            filled_quantity: Decimal::ZERO,
            tp_price: None,
            tp_client_order_id: None,
            tp_order_id: None,
            unconfirmed: false,
            created_at: Utc::now(),
            filled_at: None,
            closed_at: None,
        }
    }

    fn manager_with_ladder(price: Decimal) -> OrderLadderManager {
        let mut manager = OrderLadderManager::new(settings());
        manager.install_ladder(generate_levels(price, &config(), 2).unwrap());
        manager
    }

    #[test]
    fn test_client_order_id_format() {
        assert_eq!(client_order_id('g', 3, -2, 17), "g3-n2-17");
        assert_eq!(client_order_id('t', 3, 4, 18), "t3-4-18");
    }

    #[test]
    fn test_reconcile_places_missing_levels_innermost_first() {
        let desired = vec![
            level(-2, dec!(95500)),
            level(-1, dec!(96000)),
            level(1, dec!(97000)),
            level(2, dec!(97500)),
        ];
        let plan = reconcile(&desired, &[]);

        let indices: Vec<i32> = plan.to_place.iter().map(|l| l.level_index).collect();
        assert_eq!(indices, vec![-1, 1, -2, 2]);
        assert!(plan.to_cancel.is_empty());
    }

    #[test]
    fn test_reconcile_never_cancels_filled_orders() {
        let desired = vec![level(-1, dec!(96000))];
        let current = vec![
            record(-1, dec!(96000), OrderStatus::Pending),
            record(-3, dec!(95000), OrderStatus::Filled),
            record(2, dec!(97500), OrderStatus::Pending),
        ];
        let plan = reconcile(&desired, &current);

        assert!(plan.to_place.is_empty());
        assert_eq!(plan.to_cancel, vec![current[2].client_order_id.clone()]);
    }

    #[test]
    fn test_reconcile_moves_repriced_pending_level() {
        let desired = vec![level(-1, dec!(96200))];
        let current = vec![record(-1, dec!(96000), OrderStatus::Pending)];
        let plan = reconcile(&desired, &current);

        assert_eq!(plan.to_cancel, vec![current[0].client_order_id.clone()]);
        assert_eq!(plan.to_place[0].price, dec!(96200));
    }

    #[test]
    fn test_reconcile_leaves_unconfirmed_and_terminal_records() {
        let mut unconfirmed = record(-1, dec!(96000), OrderStatus::Pending);
        unconfirmed.unconfirmed = true;
        let closed = record(1, dec!(97000), OrderStatus::TpHit);

        let desired = vec![level(-1, dec!(96200)), level(1, dec!(97000))];
        let plan = reconcile(&desired, &[unconfirmed, closed]);

        // The terminal level is free again; the unconfirmed one is left alone
        assert_eq!(plan.to_place.len(), 1);
        assert_eq!(plan.to_place[0].level_index, 1);
        assert!(plan.to_cancel.is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_pass_is_idempotent() {
        let exchange = PaperExchange::new("BTCUSDT", dec!(10000), dec!(96500));
        let mut manager = manager_with_ladder(dec!(96500));

        let first = manager.reconcile_ladder(&exchange, &config(), 1).await;
        assert_eq!(first.placed, 4);
        assert!(first.failed.is_empty());

        let second = manager.reconcile_ladder(&exchange, &config(), 1).await;
        assert_eq!(second.placed, 0);
        assert_eq!(exchange.open_orders().await.len(), 4);
        assert_eq!(manager.take_dirty().len(), 4);

        // 100 USDT * 10x / 96000
        let buy = manager.records().iter().find(|r| r.level_index == -1).unwrap();
        assert_eq!(buy.quantity, dec!(0.010));
    }

    #[tokio::test]
    async fn test_transient_errors_retried_within_pass() {
        let exchange = PaperExchange::new("BTCUSDT", dec!(10000), dec!(96500));
        exchange
            .push_place_faults([
                PlaceFault::Fail(ExchangeError::RateLimited("429".into())),
                PlaceFault::Fail(ExchangeError::Transient("502".into())),
            ])
            .await;
        let mut manager = manager_with_ladder(dec!(96500));

        let report = manager.reconcile_ladder(&exchange, &config(), 1).await;
        assert_eq!(report.placed, 4);
        assert_eq!(exchange.place_calls(), 6);
    }

    #[tokio::test]
    async fn test_rejected_level_surfaced_without_aborting_pass() {
        let mut exchange = MockExchangeGateway::new();
        exchange.expect_place_order().returning(|request| {
            if request.price == dec!(96000) {
                Err(ExchangeError::InsufficientMargin("available 3.2 USDT".into()))
            } else {
                Ok(format!("ok-{}", request.client_order_id))
            }
        });
        let mut manager = manager_with_ladder(dec!(96500));

        let report = manager.reconcile_ladder(&exchange, &config(), 1).await;
        assert_eq!(report.placed, 3);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(
            report.failed[0].error,
            ControllerError::ExchangeRejected {
                level_index: -1,
                reason: "insufficient margin: available 3.2 USDT".into()
            }
        );
        assert!(manager.records().iter().all(|r| r.level_index != -1));
    }

    #[tokio::test]
    async fn test_timed_out_placement_resolved_without_duplicate() {
        let exchange = PaperExchange::new("BTCUSDT", dec!(10000), dec!(96500));
        exchange.push_place_faults([PlaceFault::AcceptThenTimeout]).await;
        let mut manager = manager_with_ladder(dec!(96500));

        let report = manager.reconcile_ladder(&exchange, &config(), 1).await;
        assert_eq!(report.unconfirmed, 1);
        assert_eq!(report.placed, 3);

        let sync = manager.sync(&exchange, &ctx(ReactivationMode::Immediate)).await;
        assert!(sync.conflicts.is_empty());
        assert!(manager.records().iter().all(|r| !r.unconfirmed));

        let second = manager.reconcile_ladder(&exchange, &config(), 1).await;
        assert_eq!(second.placed, 0);
        assert_eq!(exchange.open_orders().await.len(), 4);
        assert_eq!(exchange.place_calls(), 4);
    }

    #[tokio::test]
    async fn test_lost_placement_marked_cancelled_and_replaced() {
        let mut exchange = MockExchangeGateway::new();
        let mut calls = 0;
        exchange.expect_place_order().returning(move |request| {
            calls += 1;
            if calls == 1 {
                Err(ExchangeError::Timeout)
            } else {
                Ok(format!("ok-{}", request.client_order_id))
            }
        });
        exchange
            .expect_get_order_status()
            .returning(|_, client_order_id| {
                if client_order_id.ends_with("-1") {
                    Ok(None)
                } else {
                    Ok(Some(OrderStatusReport {
                        order_id: format!("ok-{}", client_order_id),
                        client_order_id: client_order_id.to_string(),
                        state: ExchangeOrderState::New,
                        filled_quantity: Decimal::ZERO,
                        avg_price: Decimal::ZERO,
                    }))
                }
            });
        let mut manager = manager_with_ladder(dec!(96500));

        manager.reconcile_ladder(&exchange, &config(), 1).await;
        let sync = manager.sync(&exchange, &ctx(ReactivationMode::Immediate)).await;
        assert_eq!(sync.conflicts.len(), 1);

        let report = manager.reconcile_ladder(&exchange, &config(), 1).await;
        assert_eq!(report.placed, 1);
        assert_eq!(manager.records().len(), 4);
    }

    #[tokio::test]
    async fn test_fill_places_take_profit_and_rearms_after_exit() {
        let exchange = PaperExchange::new("BTCUSDT", dec!(10000), dec!(96500));
        let mut manager = manager_with_ladder(dec!(96500));
        let ctx = ctx(ReactivationMode::Immediate);
        manager.reconcile_ladder(&exchange, &config(), 1).await;

        exchange.set_price(dec!(96000)).await;
        let sync = manager.sync(&exchange, &ctx).await;
        assert_eq!(sync.fills, 1);
        assert_eq!(sync.take_profits_placed, 1);

        let filled = manager.records().iter().find(|r| r.level_index == -1).unwrap();
        assert_eq!(filled.status, OrderStatus::Filled);
        assert_eq!(filled.tp_price, Some(dec!(96960)));
        let tp = exchange
            .open_orders()
            .await
            .into_iter()
            .find(|o| o.reduce_only)
            .unwrap();
        assert_eq!(tp.side, OrderSide::Sell);

        exchange.set_price(dec!(96960)).await;
        let sync = manager.sync(&exchange, &ctx).await;
        assert_eq!(sync.closed.len(), 1);
        assert_eq!(sync.closed[0].pnl, dec!(9.600));
        assert!(manager.records().iter().all(|r| r.level_index != -1));

        // Level -1 is free again and gets a fresh order
        let report = manager.reconcile_ladder(&exchange, &config(), 1).await;
        assert_eq!(report.placed, 1);
    }

    #[tokio::test]
    async fn test_full_cycle_keeps_level_dormant_until_cycle_completes() {
        let exchange = PaperExchange::new("BTCUSDT", dec!(10000), dec!(96500));
        let mut manager = manager_with_ladder(dec!(96500));
        let ctx = ctx(ReactivationMode::FullCycle);
        manager.reconcile_ladder(&exchange, &config(), 1).await;

        // Fill both buys, then take profit on the outer one only (95500 -> 96455)
        exchange.set_price(dec!(95500)).await;
        manager.sync(&exchange, &ctx).await;
        exchange.set_price(dec!(96455)).await;
        let sync = manager.sync(&exchange, &ctx).await;
        assert_eq!(sync.closed.len(), 1);
        assert!(manager.dormant_levels().contains(&-2));
        assert!(!manager.cycle_complete());

        let report = manager.reconcile_ladder(&exchange, &config(), 1).await;
        assert_eq!(report.placed, 0);

        exchange.set_price(dec!(96960)).await;
        manager.sync(&exchange, &ctx).await;
        assert!(manager.cycle_complete());
    }

    #[tokio::test]
    async fn test_cancel_pending_keeps_filled_entries() {
        let exchange = PaperExchange::new("BTCUSDT", dec!(10000), dec!(96500));
        let mut manager = manager_with_ladder(dec!(96500));
        manager.reconcile_ladder(&exchange, &config(), 1).await;
        exchange.set_price(dec!(96000)).await;
        manager.sync(&exchange, &ctx(ReactivationMode::Immediate)).await;

        let report = manager.cancel_pending(&exchange, dec!(1)).await;
        assert_eq!(report.cancelled, 3);
        assert_eq!(manager.records().len(), 1);
        assert_eq!(manager.records()[0].status, OrderStatus::Filled);

        // Only the take-profit is left on the book
        let open = exchange.open_orders().await;
        assert_eq!(open.len(), 1);
        assert!(open[0].reduce_only);
    }

    #[tokio::test]
    async fn test_cancel_pending_keeps_partially_filled_position() {
        let mut exchange = MockExchangeGateway::new();
        exchange
            .expect_place_order()
            .returning(|request| Ok(format!("ok-{}", request.client_order_id)));
        exchange
            .expect_get_order_status()
            .returning(|_, client_order_id| {
                let partial = client_order_id.contains("-n1-");
                Ok(Some(OrderStatusReport {
                    order_id: format!("ok-{}", client_order_id),
                    client_order_id: client_order_id.to_string(),
                    state: if partial {
                        ExchangeOrderState::PartiallyFilled
                    } else {
                        ExchangeOrderState::New
                    },
                    filled_quantity: if partial { dec!(0.004) } else { Decimal::ZERO },
                    avg_price: if partial { dec!(96000) } else { Decimal::ZERO },
                }))
            });
        exchange.expect_cancel_order().returning(|_, _| Ok(()));
        let mut manager = manager_with_ladder(dec!(96500));
        manager.reconcile_ladder(&exchange, &config(), 1).await;
        manager.sync(&exchange, &ctx(ReactivationMode::Immediate)).await;

        let report = manager.cancel_pending(&exchange, dec!(1)).await;
        assert_eq!(report.cancelled, 4);
        assert!(report.failed.is_empty());

        // 0.004 stays open as a position with its exit on the book
        let kept = manager.records();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].level_index, -1);
        assert_eq!(kept[0].status, OrderStatus::Filled);
        assert_eq!(kept[0].quantity, dec!(0.004));
        assert_eq!(kept[0].tp_price, Some(dec!(96960)));
        assert!(kept[0].tp_order_id.is_some());
    }

    #[tokio::test]
    async fn test_external_cancel_is_corrected() {
        let exchange = PaperExchange::new("BTCUSDT", dec!(10000), dec!(96500));
        let mut manager = manager_with_ladder(dec!(96500));
        manager.reconcile_ladder(&exchange, &config(), 1).await;

        let order_id = manager.records()[0].order_id.clone().unwrap();
        exchange.cancel_order("BTCUSDT", &order_id).await.unwrap();

        let sync = manager.sync(&exchange, &ctx(ReactivationMode::Immediate)).await;
        assert_eq!(sync.conflicts.len(), 1);
        assert_eq!(manager.records().len(), 3);
    }

    #[test]
    fn test_drift_against_reference() {
        let mut manager = OrderLadderManager::new(settings());
        assert!(manager.drifted(dec!(96500), dec!(1)));

        manager.install_ladder(generate_levels(dec!(96500), &config(), 2).unwrap());
        assert!(!manager.drifted(dec!(97000), dec!(1)));
        assert!(manager.drifted(dec!(97465), dec!(1)));
    }
}
