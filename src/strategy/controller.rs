//! Per-account strategy controller.
//!
//! Owns the config snapshot, the strategy state and the ladder manager for one
//! account and turns commands, market ticks and timer ticks into exchange
//! work. Every method assumes exclusive access; the runtime actor provides it.

use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{
    AdvancedSettingsUpdate, ConfigSnapshot, ControllerSettings, GridSettingsUpdate,
    MacdFilterUpdate, RiskBands, RiskParametersUpdate, StrategyConfig,
};
use crate::error::{ControllerError, ControllerResult};
use crate::exchange::{with_timeout, ExchangeGateway, MarketSnapshot};
use crate::grid::{generate_levels, GridLadder};
use crate::persistence::PersistenceManager;
use crate::risk::{compute_risk_summary_with, RiskSummary};

use super::gate::ActivationGate;
use super::ladder_manager::{
    LadderSettings, OrderLadderManager, OrderRecord, ReconcileReport, SyncContext, SyncReport,
};
use super::state::{next_status, StrategyEvent, StrategyState, StrategyStatus};
use super::take_profit::DynamicTakeProfit;

/// What one market tick did.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub status: StrategyStatus,
    pub sync: SyncReport,
    pub reconcile: Option<ReconcileReport>,
}

pub struct StrategyController {
    account_id: String,
    settings: ControllerSettings,
    risk_bands: RiskBands,
    exchange: Arc<dyn ExchangeGateway>,
    store: Arc<PersistenceManager>,
    snapshot: ConfigSnapshot,
    state: StrategyState,
    gate: ActivationGate,
    take_profit: DynamicTakeProfit,
    ladder: OrderLadderManager,
    last_market: Option<MarketSnapshot>,
    last_reconcile: Option<ReconcileReport>,
}

impl StrategyController {
    /// Build the controller for `settings.account_id`, restoring whatever the
    /// store holds. `default_config` is used only when no snapshot exists.
    pub fn load(
        settings: ControllerSettings,
        risk_bands: RiskBands,
        default_config: StrategyConfig,
        exchange: Arc<dyn ExchangeGateway>,
        store: Arc<PersistenceManager>,
    ) -> ControllerResult<Self> {
        let account_id = settings.account_id.clone();

        let snapshot = match store.load_latest_config(&account_id)? {
            Some(snapshot) => snapshot,
            None => {
                let snapshot = ConfigSnapshot::new(1, default_config);
                store.save_config_snapshot(&account_id, &snapshot)?;
                snapshot
            }
        };

        let mut take_profit = DynamicTakeProfit::new(&snapshot.config);
        let state = match store.load_strategy_state(&account_id)? {
            Some(mut state) => {
                take_profit.restore(state.effective_take_profit_percent, &snapshot.config);
                state.effective_take_profit_percent = take_profit.effective();
                state.config_snapshot_id = snapshot.id;
                state
            }
            None => StrategyState::new(take_profit.effective(), snapshot.id),
        };

        let mut ladder = OrderLadderManager::new(LadderSettings::from(&settings));
        ladder.restore(
            store.load_open_orders(&account_id)?,
            store.max_order_seq(&account_id)?,
        );

        info!(
            %account_id,
            status = %state.status,
            snapshot_id = snapshot.id,
            "Strategy controller loaded"
        );

        Ok(Self {
            account_id,
            settings,
            risk_bands,
            exchange,
            store,
            snapshot,
            state,
            gate: ActivationGate::new(),
            take_profit,
            ladder,
            last_market: None,
            last_reconcile: None,
        })
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn state(&self) -> &StrategyState {
        &self.state
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.snapshot.config
    }

    pub fn config_snapshot(&self) -> &ConfigSnapshot {
        &self.snapshot
    }

    /// Non-terminal order records.
    pub fn records(&self) -> &[OrderRecord] {
        self.ladder.records()
    }

    pub fn ladder(&self) -> Option<&GridLadder> {
        self.ladder.ladder()
    }

    /// Outcome of the most recent reconciliation pass, including failed levels.
    pub fn last_reconcile(&self) -> Option<&ReconcileReport> {
        self.last_reconcile.as_ref()
    }

    // ==================== Commands ====================

    /// Start with `config`, or with the config currently in force.
    pub async fn start(&mut self, config: Option<StrategyConfig>) -> ControllerResult<StrategyState> {
        let config = config.unwrap_or_else(|| self.snapshot.config.clone());
        config.validate()?;

        let event = StrategyEvent::Start {
            filter_enabled: config.macd_filter.enabled,
        };
        next_status(self.state.status, event)?;

        self.prepare_symbol(&config).await?;
        if config != self.snapshot.config {
            self.install_snapshot(config)?;
        }

        let status = self.transition(event)?;
        if status == StrategyStatus::Active {
            self.enter_active().await;
        }

        self.persist()?;
        Ok(self.state.clone())
    }

    /// Freeze the ladder. Resting orders stay on the book.
    pub async fn pause(&mut self) -> ControllerResult<StrategyState> {
        self.transition(StrategyEvent::Pause)?;
        self.persist()?;
        Ok(self.state.clone())
    }

    /// Back to ACTIVE, or to WAIT when the gate has closed in the meantime.
    pub async fn resume(&mut self) -> ControllerResult<StrategyState> {
        let status = self.transition(StrategyEvent::Resume {
            filter_enabled: self.snapshot.config.macd_filter.enabled,
            gate_open: self.gate.is_open(),
        })?;

        if status == StrategyStatus::Active {
            self.enter_active().await;
        }

        self.persist()?;
        Ok(self.state.clone())
    }

    /// Cancel pending entries and stop. Filled entries keep their take-profit.
    ///
    /// The in-flight sync and cancel complete before the status changes, so
    /// nothing is placed once STOPPED is reached.
    pub async fn stop(&mut self) -> ControllerResult<StrategyState> {
        next_status(self.state.status, StrategyEvent::Stop)?;

        let ctx = self.sync_context(true);
        let sync = self.ladder.sync(self.exchange.as_ref(), &ctx).await;
        self.book_trades(&sync);

        let cancelled = self
            .ladder
            .cancel_pending(self.exchange.as_ref(), self.take_profit.effective())
            .await;
        if !cancelled.failed.is_empty() {
            warn!(
                account_id = %self.account_id,
                failed = cancelled.failed.len(),
                "Some pending orders could not be cancelled, retrying on the next tick"
            );
        }
        self.last_reconcile = Some(cancelled);

        self.transition(StrategyEvent::Stop)?;
        self.ladder.clear_ladder();
        self.persist()?;

        self.log_open_positions().await;
        Ok(self.state.clone())
    }

    pub async fn update_risk_parameters(
        &mut self,
        update: RiskParametersUpdate,
    ) -> ControllerResult<ConfigSnapshot> {
        let next = self.snapshot.config.with_risk_update(&update)?;
        self.apply_update(next).await
    }

    pub async fn update_grid_settings(
        &mut self,
        update: GridSettingsUpdate,
    ) -> ControllerResult<ConfigSnapshot> {
        let next = self.snapshot.config.with_grid_update(&update)?;
        self.apply_update(next).await
    }

    pub async fn update_macd_filter(
        &mut self,
        update: MacdFilterUpdate,
    ) -> ControllerResult<ConfigSnapshot> {
        let next = self.snapshot.config.with_macd_update(&update)?;
        self.apply_update(next).await
    }

    pub async fn update_advanced_settings(
        &mut self,
        update: AdvancedSettingsUpdate,
    ) -> ControllerResult<ConfigSnapshot> {
        let next = self.snapshot.config.with_advanced_update(&update)?;
        self.apply_update(next).await
    }

    /// Fresh risk summary for the config in force.
    pub fn risk_summary(&self) -> RiskSummary {
        compute_risk_summary_with(&self.snapshot.config, &self.risk_bands)
    }

    /// Ladder the current config would produce at `price`, or at the latest
    /// market price when none is given.
    pub async fn grid_preview(&mut self, price: Option<Decimal>) -> ControllerResult<GridLadder> {
        let price = match price {
            Some(price) => price,
            None => self.current_price().await?,
        };
        generate_levels(price, &self.snapshot.config, self.settings.price_decimals)
    }

    // ==================== Events ====================

    /// Handle one market snapshot.
    pub async fn on_market_tick(&mut self, market: MarketSnapshot) -> ControllerResult<TickReport> {
        let crossed = self.gate.observe(&market.macd);
        let price = market.price;
        self.last_market = Some(market);

        let status = self.state.status;
        let ctx = self.sync_context(status != StrategyStatus::Stopped);
        let sync = self.ladder.sync(self.exchange.as_ref(), &ctx).await;
        if status != StrategyStatus::Stopped {
            self.book_trades(&sync);
        }

        let reconcile = match status {
            StrategyStatus::Stopped => {
                // Leftovers from a stop whose cancels failed or timed out
                if self.ladder.records().iter().any(|r| r.is_pending()) {
                    Some(
                        self.ladder
                            .cancel_pending(self.exchange.as_ref(), self.take_profit.effective())
                            .await,
                    )
                } else {
                    None
                }
            }
            StrategyStatus::Wait => {
                if crossed || !self.snapshot.config.macd_filter.enabled {
                    info!(
                        account_id = %self.account_id,
                        price = %price,
                        filter_enabled = self.snapshot.config.macd_filter.enabled,
                        "Activation signal received"
                    );
                    self.transition(StrategyEvent::BullishSignal)?;
                    self.enter_active().await
                } else {
                    None
                }
            }
            StrategyStatus::Active => {
                if self.ladder.drifted(price, self.settings.ladder_drift_percent)
                    || self.ladder.cycle_complete()
                {
                    self.regenerate_ladder(price)?;
                }
                Some(self.reconcile().await)
            }
            StrategyStatus::Paused => None,
        };

        if let Some(report) = &reconcile {
            self.last_reconcile = Some(report.clone());
        }
        self.persist()?;

        Ok(TickReport {
            status: self.state.status,
            sync,
            reconcile,
        })
    }

    /// Dynamic take-profit timer. Returns the new effective value, or `None`
    /// when the policy is disabled.
    pub async fn on_take_profit_timer(&mut self) -> ControllerResult<Option<Decimal>> {
        let funding = match &self.last_market {
            Some(market) => market.funding_rate_percent,
            None => self.refresh_market().await?.funding_rate_percent,
        };

        let updated = self.take_profit.on_timer(funding, &self.snapshot.config);
        if let Some(effective) = updated {
            if effective != self.state.effective_take_profit_percent {
                info!(
                    account_id = %self.account_id,
                    funding_rate_percent = %funding,
                    previous = %self.state.effective_take_profit_percent,
                    effective = %effective,
                    "Effective take-profit changed"
                );
            }
        }
        self.state.effective_take_profit_percent = self.take_profit.effective();
        self.persist()?;
        Ok(updated)
    }

    /// Fill notification for an entry or take-profit order. Converges on the
    /// same handling as the per-tick status poll.
    pub async fn on_fill(&mut self, client_order_id: &str) -> ControllerResult<Option<SyncReport>> {
        let status = self.state.status;
        let ctx = self.sync_context(status != StrategyStatus::Stopped);

        let Some(sync) = self
            .ladder
            .sync_order(self.exchange.as_ref(), client_order_id, &ctx)
            .await
        else {
            debug!(%client_order_id, "Fill for an order with no live record");
            return Ok(None);
        };

        if status != StrategyStatus::Stopped {
            self.book_trades(&sync);
        }
        if status == StrategyStatus::Active && !sync.closed.is_empty() {
            // Re-arm the vacated level without waiting for the next tick
            let report = self.reconcile().await;
            self.last_reconcile = Some(report);
        }

        self.persist()?;
        Ok(Some(sync))
    }

    // ==================== Internals ====================

    fn transition(&mut self, event: StrategyEvent) -> ControllerResult<StrategyStatus> {
        let from = self.state.status;
        let to = self.state.apply(event)?;
        info!(
            account_id = %self.account_id,
            from = %from,
            to = %to,
            "Strategy status changed"
        );
        Ok(to)
    }

    fn sync_context(&self, place_take_profits: bool) -> SyncContext {
        SyncContext {
            take_profit_percent: self.take_profit.effective(),
            place_take_profits,
            reactivation_mode: self.snapshot.config.reactivation_mode,
        }
    }

    fn book_trades(&mut self, sync: &SyncReport) {
        for trade in &sync.closed {
            self.state.record_trade(trade.pnl);
        }
        if !sync.closed.is_empty() {
            info!(
                account_id = %self.account_id,
                cycle_trades = self.state.cycle_trade_count,
                cycle_wins = self.state.cycle_win_count,
                cycle_pnl = %self.state.cycle_pnl,
                "Cycle updated"
            );
        }
    }

    /// Generate and reconcile the ladder once on entering ACTIVE. Without a
    /// price the ladder is deferred to the next tick.
    async fn enter_active(&mut self) -> Option<ReconcileReport> {
        let price = match self.current_price().await {
            Ok(price) => price,
            Err(e) => {
                warn!(account_id = %self.account_id, error = %e, "Ladder deferred until market data arrives");
                self.ladder.clear_ladder();
                return None;
            }
        };

        if let Err(e) = self.regenerate_ladder(price) {
            warn!(account_id = %self.account_id, error = %e, "Ladder generation failed");
            return None;
        }

        let report = self.reconcile().await;
        self.last_reconcile = Some(report.clone());
        Some(report)
    }

    fn regenerate_ladder(&mut self, price: Decimal) -> ControllerResult<()> {
        let ladder = generate_levels(price, &self.snapshot.config, self.settings.price_decimals)?;
        info!(
            account_id = %self.account_id,
            reference_price = %ladder.reference_price,
            buys = ladder.buy_count(),
            sells = ladder.sell_count(),
            snapshot_id = self.snapshot.id,
            "Ladder generated"
        );
        self.ladder.install_ladder(ladder);
        Ok(())
    }

    async fn reconcile(&mut self) -> ReconcileReport {
        self.ladder
            .reconcile_ladder(self.exchange.as_ref(), &self.snapshot.config, self.snapshot.id)
            .await
    }

    /// Validate-then-apply: the new config becomes a new snapshot only after
    /// the exchange accepted any leverage or margin change.
    async fn apply_update(&mut self, next: StrategyConfig) -> ControllerResult<ConfigSnapshot> {
        if next == self.snapshot.config {
            return Ok(self.snapshot.clone());
        }

        let previous = self.snapshot.config.clone();
        let symbol_changed =
            next.leverage != previous.leverage || next.margin_mode != previous.margin_mode;
        if symbol_changed && self.state.status != StrategyStatus::Stopped {
            self.prepare_symbol(&next).await?;
        }

        self.install_snapshot(next)?;

        if self.state.status == StrategyStatus::Active && previous.ladder_differs(&self.snapshot.config) {
            match self.last_market.as_ref().map(|m| m.price) {
                Some(price) => {
                    self.regenerate_ladder(price)?;
                    let report = self.reconcile().await;
                    self.last_reconcile = Some(report);
                }
                // Regenerated on the next tick
                None => self.ladder.clear_ladder(),
            }
        }

        self.persist()?;
        Ok(self.snapshot.clone())
    }

    fn install_snapshot(&mut self, config: StrategyConfig) -> ControllerResult<()> {
        let snapshot = self.snapshot.next(config);
        self.store.save_config_snapshot(&self.account_id, &snapshot)?;

        self.state.config_snapshot_id = snapshot.id;
        self.state.effective_take_profit_percent = self.take_profit.apply_config(&snapshot.config);

        info!(
            account_id = %self.account_id,
            snapshot_id = snapshot.id,
            effective_take_profit = %self.state.effective_take_profit_percent,
            "Config snapshot installed"
        );
        self.snapshot = snapshot;
        Ok(())
    }

    async fn prepare_symbol(&self, config: &StrategyConfig) -> ControllerResult<()> {
        let result = with_timeout(
            self.settings.exchange_timeout(),
            self.exchange
                .configure_symbol(&self.settings.symbol, config.leverage, config.margin_mode),
        )
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_transient() => Err(ControllerError::ExchangeTransient(format!(
                "configuring {}: {}",
                self.settings.symbol, e
            ))),
            Err(e) => Err(ControllerError::invalid(
                "leverage",
                format!(
                    "{}x {:?} rejected for {}: {}",
                    config.leverage, config.margin_mode, self.settings.symbol, e
                ),
            )),
        }
    }

    async fn current_price(&mut self) -> ControllerResult<Decimal> {
        match &self.last_market {
            Some(market) => Ok(market.price),
            None => Ok(self.refresh_market().await?.price),
        }
    }

    async fn refresh_market(&mut self) -> ControllerResult<MarketSnapshot> {
        let market = with_timeout(
            self.settings.exchange_timeout(),
            self.exchange
                .get_market_snapshot(&self.settings.symbol, &self.snapshot.config.macd_filter),
        )
        .await
        .map_err(|e| {
            warn!(symbol = %self.settings.symbol, error = %e, "Market snapshot fetch failed");
            ControllerError::MarketDataUnavailable(self.settings.symbol.clone())
        })?;

        self.last_market = Some(market.clone());
        Ok(market)
    }

    async fn log_open_positions(&self) {
        let positions = with_timeout(
            self.settings.exchange_timeout(),
            self.exchange.get_open_positions(&self.settings.symbol),
        )
        .await;

        match positions {
            Ok(positions) => {
                for position in positions {
                    info!(
                        account_id = %self.account_id,
                        side = %position.side,
                        entry_price = %position.entry_price,
                        quantity = %position.quantity,
                        "Position left open after stop"
                    );
                }
            }
            Err(e) => warn!(account_id = %self.account_id, error = %e, "Could not list open positions"),
        }
    }

    fn persist(&mut self) -> ControllerResult<()> {
        let dirty = self.ladder.take_dirty();
        if let Err(e) = self.store.append_order_records(&self.account_id, &dirty) {
            self.ladder.requeue_dirty(dirty);
            return Err(e.into());
        }
        self.store.save_strategy_state(&self.account_id, &self.state)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DynamicTpConfig, MarginMode, SpacingType};
    use crate::exchange::{
        ExchangeError, MacdSnapshot, MacdTrend, MockExchangeGateway, PaperExchange,
    };
    use crate::strategy::OrderStatus;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn settings() -> ControllerSettings {
        ControllerSettings {
            account_id: "acct".to_string(),
            exchange_timeout_secs: 1,
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 4,
            ..Default::default()
        }
    }

    fn config(filter_enabled: bool) -> StrategyConfig {
        let mut config = StrategyConfig {
            spacing_type: SpacingType::Fixed,
            spacing_value: dec!(500),
            range_percent: dec!(1.1),
            max_total_orders: 4,
            position_size_usdt: dec!(100),
            leverage: 10,
            ..Default::default()
        };
        config.macd_filter.enabled = filter_enabled;
        config
    }

    fn market(price: Decimal, line: Decimal, histogram: Decimal) -> MarketSnapshot {
        MarketSnapshot {
            symbol: "BTCUSDT".to_string(),
            price,
            funding_rate_percent: dec!(0.01),
            macd: MacdSnapshot {
                line,
                signal: line - histogram,
                histogram,
                trend: MacdTrend::Neutral,
            },
            timestamp: Utc::now(),
        }
    }

    fn paper() -> Arc<PaperExchange> {
        Arc::new(PaperExchange::new("BTCUSDT", dec!(10000), dec!(96500)))
    }

    fn controller_with(
        exchange: Arc<dyn ExchangeGateway>,
        store: Arc<PersistenceManager>,
        default_config: StrategyConfig,
    ) -> StrategyController {
        StrategyController::load(
            settings(),
            RiskBands::default(),
            default_config,
            exchange,
            store,
        )
        .unwrap()
    }

    fn controller(exchange: Arc<PaperExchange>, filter_enabled: bool) -> StrategyController {
        let store = Arc::new(PersistenceManager::new(":memory:").unwrap());
        controller_with(exchange, store, config(filter_enabled))
    }

    #[tokio::test]
    async fn test_start_waits_for_bullish_cross() {
        let exchange = paper();
        let mut controller = controller(exchange.clone(), true);

        let state = controller.start(None).await.unwrap();
        assert_eq!(state.status, StrategyStatus::Wait);
        assert!(exchange.open_orders().await.is_empty());
        assert_eq!(exchange.symbol_settings().await, (Some(10), Some(MarginMode::Crossed)));

        let report = controller
            .on_market_tick(market(dec!(96500), dec!(-5), dec!(-1)))
            .await
            .unwrap();
        assert_eq!(report.status, StrategyStatus::Wait);

        let report = controller
            .on_market_tick(market(dec!(96500), dec!(-3), dec!(1)))
            .await
            .unwrap();
        assert_eq!(report.status, StrategyStatus::Active);
        assert_eq!(report.reconcile.unwrap().placed, 4);
        assert!(controller.state().cycle_started_at.is_some());
        assert_eq!(exchange.open_orders().await.len(), 4);
    }

    #[tokio::test]
    async fn test_start_without_filter_places_ladder_immediately() {
        let exchange = paper();
        let mut controller = controller(exchange.clone(), false);

        let state = controller.start(None).await.unwrap();
        assert_eq!(state.status, StrategyStatus::Active);
        assert_eq!(exchange.open_orders().await.len(), 4);
        assert_eq!(controller.last_reconcile().unwrap().placed, 4);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_before_state_change() {
        let exchange = paper();
        let mut controller = controller(exchange.clone(), true);

        let mut bad = config(true);
        bad.macd_filter.fast_period = 30;
        let err = controller.start(Some(bad)).await.unwrap_err();
        assert!(matches!(err, ControllerError::InvalidConfig { ref field, .. } if field == "macd_filter.fast_period"));
        assert_eq!(controller.state().status, StrategyStatus::Stopped);
        assert_eq!(controller.config_snapshot().id, 1);
        assert_eq!(exchange.symbol_settings().await, (None, None));
    }

    #[tokio::test]
    async fn test_illegal_transitions_leave_state_unchanged() {
        let mut controller = controller(paper(), true);

        let err = controller.pause().await.unwrap_err();
        assert!(matches!(err, ControllerError::IllegalTransition { .. }));

        controller.start(None).await.unwrap();
        controller.stop().await.unwrap();
        let err = controller.resume().await.unwrap_err();
        assert!(matches!(err, ControllerError::IllegalTransition { .. }));
        assert_eq!(controller.state().status, StrategyStatus::Stopped);
    }

    #[tokio::test]
    async fn test_exchange_rejecting_leverage_names_the_field() {
        let mut exchange = MockExchangeGateway::new();
        exchange
            .expect_configure_symbol()
            .returning(|_, _, _| Err(ExchangeError::Rejected("leverage not valid (-4028)".into())));
        let store = Arc::new(PersistenceManager::new(":memory:").unwrap());
        let mut controller = controller_with(Arc::new(exchange), store, config(true));

        let err = controller.start(None).await.unwrap_err();
        assert!(matches!(err, ControllerError::InvalidConfig { ref field, .. } if field == "leverage"));
        assert_eq!(controller.state().status, StrategyStatus::Stopped);
    }

    #[tokio::test]
    async fn test_closed_trade_booked_and_level_rearmed() {
        let exchange = paper();
        let mut controller = controller(exchange.clone(), false);
        controller.start(None).await.unwrap();

        exchange.set_price(dec!(96000)).await;
        let report = controller
            .on_market_tick(market(dec!(96000), dec!(1), dec!(1)))
            .await
            .unwrap();
        assert_eq!(report.sync.fills, 1);
        assert_eq!(report.sync.take_profits_placed, 1);

        exchange.set_price(dec!(96960)).await;
        let report = controller
            .on_market_tick(market(dec!(96960), dec!(1), dec!(1)))
            .await
            .unwrap();
        assert_eq!(report.sync.closed.len(), 1);
        assert_eq!(report.reconcile.unwrap().placed, 1);

        let state = controller.state();
        assert_eq!(state.cycle_trade_count, 1);
        assert_eq!(state.cycle_win_count, 1);
        assert_eq!(state.cycle_pnl, dec!(9.6));
    }

    #[tokio::test]
    async fn test_pause_suppresses_placement_and_resume_respects_gate() {
        let exchange = paper();
        let mut controller = controller(exchange.clone(), true);
        controller.start(None).await.unwrap();
        controller
            .on_market_tick(market(dec!(96500), dec!(-5), dec!(-1)))
            .await
            .unwrap();
        controller
            .on_market_tick(market(dec!(96500), dec!(-3), dec!(1)))
            .await
            .unwrap();
        assert_eq!(controller.state().status, StrategyStatus::Active);

        controller.pause().await.unwrap();
        let calls = exchange.place_calls();

        // Momentum fades while paused
        let report = controller
            .on_market_tick(market(dec!(96500), dec!(-4), dec!(-0.5)))
            .await
            .unwrap();
        assert!(report.reconcile.is_none());
        assert_eq!(exchange.place_calls(), calls);
        assert_eq!(exchange.open_orders().await.len(), 4);

        let state = controller.resume().await.unwrap();
        assert_eq!(state.status, StrategyStatus::Wait);
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_and_never_places_again() {
        let exchange = paper();
        let mut controller = controller(exchange.clone(), false);
        controller.start(None).await.unwrap();

        exchange.set_price(dec!(96000)).await;
        controller
            .on_market_tick(market(dec!(96000), dec!(1), dec!(1)))
            .await
            .unwrap();

        let state = controller.stop().await.unwrap();
        assert_eq!(state.status, StrategyStatus::Stopped);
        assert_eq!(state.cycle_trade_count, 0);
        assert!(state.cycle_started_at.is_none());

        let open = exchange.open_orders().await;
        assert_eq!(open.len(), 1);
        assert!(open[0].reduce_only);
        assert_eq!(controller.records().len(), 1);
        assert_eq!(controller.records()[0].status, OrderStatus::Filled);

        let calls = exchange.place_calls();
        exchange.set_price(dec!(95000)).await;
        controller
            .on_market_tick(market(dec!(95000), dec!(1), dec!(1)))
            .await
            .unwrap();
        assert_eq!(exchange.place_calls(), calls);
    }

    #[tokio::test]
    async fn test_grid_update_while_active_moves_ladder_to_new_snapshot() {
        let exchange = paper();
        let mut controller = controller(exchange.clone(), false);
        controller.start(None).await.unwrap();

        let snapshot = controller
            .update_grid_settings(GridSettingsUpdate {
                spacing_value: Some(dec!(400)),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(snapshot.id, 2);

        let report = controller.last_reconcile().unwrap();
        assert_eq!(report.cancelled, 4);
        assert_eq!(report.placed, 4);
        assert!(controller
            .records()
            .iter()
            .all(|r| r.config_snapshot_id == 2 && r.client_order_id.starts_with("g2-")));

        let mut prices: Vec<Decimal> = exchange.open_orders().await.iter().map(|o| o.price).collect();
        prices.sort();
        assert_eq!(prices, vec![dec!(95700), dec!(96100), dec!(96900), dec!(97300)]);
    }

    #[tokio::test]
    async fn test_invalid_update_is_not_applied() {
        let mut controller = controller(paper(), false);

        let err = controller
            .update_grid_settings(GridSettingsUpdate {
                spacing_value: Some(dec!(400)),
                range_percent: Some(dec!(60)),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidConfig { ref field, .. } if field == "range_percent"));
        assert_eq!(controller.config_snapshot().id, 1);
        assert_eq!(controller.config().spacing_value, dec!(500));
    }

    #[tokio::test]
    async fn test_risk_summary_follows_updates() {
        let mut controller = controller(paper(), false);
        assert_eq!(controller.risk_summary().total_capital, dec!(400));

        controller
            .update_risk_parameters(RiskParametersUpdate {
                leverage: Some(30),
                ..Default::default()
            })
            .await
            .unwrap();
        let summary = controller.risk_summary();
        assert_eq!(summary.notional_per_order, dec!(3000));
        assert_eq!(summary.liquidation_risk.to_string(), "high");
    }

    #[tokio::test]
    async fn test_take_profit_timer_uses_latest_funding() {
        let exchange = paper();
        let mut dynamic = config(true);
        dynamic.dynamic_tp = DynamicTpConfig {
            enabled: true,
            base_tp: dec!(1.5),
            min_tp: dec!(0.8),
            max_tp: dec!(3.0),
            safety_margin: dec!(0.2),
            check_interval_minutes: 60,
        };
        let store = Arc::new(PersistenceManager::new(":memory:").unwrap());
        let mut controller = controller_with(exchange.clone(), store, dynamic);
        assert_eq!(controller.state().effective_take_profit_percent, dec!(1.7));

        exchange.set_funding_rate_percent(dec!(5)).await;
        assert_eq!(controller.on_take_profit_timer().await.unwrap(), Some(dec!(3.0)));
        assert_eq!(controller.state().effective_take_profit_percent, dec!(3.0));
    }

    #[tokio::test]
    async fn test_new_take_profit_applies_only_to_later_fills() {
        let exchange = paper();
        let mut dynamic = config(false);
        dynamic.dynamic_tp = DynamicTpConfig {
            enabled: true,
            base_tp: dec!(1.5),
            min_tp: dec!(0.8),
            max_tp: dec!(3.0),
            safety_margin: dec!(0.2),
            check_interval_minutes: 60,
        };
        let store = Arc::new(PersistenceManager::new(":memory:").unwrap());
        let mut controller = controller_with(exchange.clone(), store, dynamic);
        controller.start(None).await.unwrap();

        // Level -1 fills at 1.7%
        exchange.set_price(dec!(96000)).await;
        let mut tick = market(dec!(96000), dec!(1), dec!(1));
        tick.funding_rate_percent = dec!(5);
        controller.on_market_tick(tick).await.unwrap();
        let tp_of = |controller: &StrategyController, level_index: i32| {
            controller
                .records()
                .iter()
                .find(|r| r.level_index == level_index)
                .and_then(|r| r.tp_price)
        };
        assert_eq!(tp_of(&controller, -1), Some(dec!(97632)));

        assert_eq!(controller.on_take_profit_timer().await.unwrap(), Some(dec!(3.0)));

        // The resting take-profit keeps its price
        assert_eq!(tp_of(&controller, -1), Some(dec!(97632)));
        assert!(exchange
            .open_orders()
            .await
            .iter()
            .any(|o| o.reduce_only && o.price == dec!(97632)));

        // Level -2 fills after the change and gets 3.0%
        exchange.set_price(dec!(95500)).await;
        let mut tick = market(dec!(95500), dec!(1), dec!(1));
        tick.funding_rate_percent = dec!(5);
        controller.on_market_tick(tick).await.unwrap();
        assert_eq!(tp_of(&controller, -2), Some(dec!(98365)));
        assert_eq!(tp_of(&controller, -1), Some(dec!(97632)));
    }

    #[tokio::test]
    async fn test_restart_recovers_state_without_duplicates() {
        let exchange = paper();
        let store = Arc::new(PersistenceManager::new(":memory:").unwrap());

        let mut first = controller_with(exchange.clone(), store.clone(), config(false));
        first.start(None).await.unwrap();
        assert_eq!(exchange.place_calls(), 4);
        drop(first);

        let mut second = controller_with(exchange.clone(), store, config(false));
        assert_eq!(second.state().status, StrategyStatus::Active);
        assert_eq!(second.records().len(), 4);

        let report = second
            .on_market_tick(market(dec!(96500), dec!(1), dec!(1)))
            .await
            .unwrap();
        assert_eq!(report.reconcile.unwrap().placed, 0);
        assert_eq!(exchange.place_calls(), 4);
    }

    #[tokio::test]
    async fn test_failed_record_write_kept_for_next_persist() {
        let exchange = paper();
        let store = Arc::new(PersistenceManager::new(":memory:").unwrap());
        let mut first = controller_with(exchange.clone(), store.clone(), config(false));

        store.set_order_writes_blocked(true).unwrap();
        let err = first.start(None).await.unwrap_err();
        assert!(matches!(err, ControllerError::Persistence(_)));
        assert_eq!(exchange.place_calls(), 4);

        store.set_order_writes_blocked(false).unwrap();
        first
            .on_market_tick(market(dec!(96500), dec!(1), dec!(1)))
            .await
            .unwrap();
        drop(first);

        let mut second = controller_with(exchange.clone(), store, config(false));
        assert_eq!(second.records().len(), 4);
        let report = second
            .on_market_tick(market(dec!(96500), dec!(1), dec!(1)))
            .await
            .unwrap();
        assert_eq!(report.reconcile.unwrap().placed, 0);
        assert_eq!(exchange.place_calls(), 4);
    }

    #[tokio::test]
    async fn test_preview_before_start() {
        let mut controller = controller(paper(), true);

        let preview = controller.grid_preview(Some(dec!(96500))).await.unwrap();
        assert_eq!(preview.levels.len(), 4);

        let fetched = controller.grid_preview(None).await.unwrap();
        assert_eq!(fetched, preview);
        assert_eq!(controller.state().status, StrategyStatus::Stopped);
    }
}
