//! Serial per-account actor.
//!
//! One task owns the [`StrategyController`] and drains the account's command
//! queue; market and timer feeders push into the same queue. Different
//! accounts run in separate tasks and never share a lock.

use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{
    AdvancedSettingsUpdate, ConfigSnapshot, ControllerSettings, GridSettingsUpdate,
    MacdFilterConfig, MacdFilterUpdate, RiskParametersUpdate, StrategyConfig,
};
use crate::error::{ControllerError, ControllerResult};
use crate::exchange::{ExchangeGateway, MarketSnapshot};
use crate::grid::GridLadder;
use crate::risk::RiskSummary;
use crate::strategy::{OrderRecord, ReconcileReport, StrategyController, StrategyState};

use super::command::Command;
use super::feeders::{run_take_profit_timer, take_profit_period, MarketPoller};

/// Cloneable front door to one account's actor.
#[derive(Debug, Clone)]
pub struct AccountHandle {
    account_id: String,
    commands: mpsc::Sender<Command>,
}

impl AccountHandle {
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    fn unavailable(&self) -> ControllerError {
        ControllerError::ActorUnavailable(self.account_id.clone())
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<ControllerResult<T>>) -> Command,
    ) -> ControllerResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| self.unavailable())?;
        response.await.map_err(|_| self.unavailable())?
    }

    async fn notify(&self, command: Command) -> ControllerResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| self.unavailable())
    }

    pub async fn start(&self, config: Option<StrategyConfig>) -> ControllerResult<StrategyState> {
        self.request(|reply| Command::Start { config, reply }).await
    }

    pub async fn pause(&self) -> ControllerResult<StrategyState> {
        self.request(|reply| Command::Pause { reply }).await
    }

    pub async fn resume(&self) -> ControllerResult<StrategyState> {
        self.request(|reply| Command::Resume { reply }).await
    }

    pub async fn stop(&self) -> ControllerResult<StrategyState> {
        self.request(|reply| Command::Stop { reply }).await
    }

    pub async fn update_risk_parameters(
        &self,
        update: RiskParametersUpdate,
    ) -> ControllerResult<ConfigSnapshot> {
        self.request(|reply| Command::UpdateRiskParameters { update, reply })
            .await
    }

    pub async fn update_grid_settings(
        &self,
        update: GridSettingsUpdate,
    ) -> ControllerResult<ConfigSnapshot> {
        self.request(|reply| Command::UpdateGridSettings { update, reply })
            .await
    }

    pub async fn update_macd_filter(
        &self,
        update: MacdFilterUpdate,
    ) -> ControllerResult<ConfigSnapshot> {
        self.request(|reply| Command::UpdateMacdFilter { update, reply })
            .await
    }

    pub async fn update_advanced_settings(
        &self,
        update: AdvancedSettingsUpdate,
    ) -> ControllerResult<ConfigSnapshot> {
        self.request(|reply| Command::UpdateAdvancedSettings { update, reply })
            .await
    }

    pub async fn risk_summary(&self) -> ControllerResult<RiskSummary> {
        self.request(|reply| Command::RiskSummary { reply }).await
    }

    pub async fn grid_preview(&self, price: Option<Decimal>) -> ControllerResult<GridLadder> {
        self.request(|reply| Command::GridPreview { price, reply })
            .await
    }

    pub async fn state(&self) -> ControllerResult<StrategyState> {
        self.request(|reply| Command::State { reply }).await
    }

    pub async fn records(&self) -> ControllerResult<Vec<OrderRecord>> {
        self.request(|reply| Command::Records { reply }).await
    }

    pub async fn last_reconcile(&self) -> ControllerResult<Option<ReconcileReport>> {
        self.request(|reply| Command::LastReconcile { reply }).await
    }

    /// Queue a market snapshot from an external feed.
    pub async fn market_tick(&self, market: MarketSnapshot) -> ControllerResult<()> {
        self.notify(Command::MarketTick(market)).await
    }

    /// Queue a fill notification from a streaming source.
    pub async fn notify_fill(&self, client_order_id: impl Into<String>) -> ControllerResult<()> {
        self.notify(Command::Fill {
            client_order_id: client_order_id.into(),
        })
        .await
    }
}

/// A running account: its handle plus the tasks behind it.
pub struct AccountRuntime {
    handle: AccountHandle,
    shutdown: watch::Sender<bool>,
    actor: JoinHandle<()>,
    feeders: Vec<JoinHandle<()>>,
}

impl AccountRuntime {
    pub fn handle(&self) -> AccountHandle {
        self.handle.clone()
    }

    /// Stop the feeders, let the actor finish queued work, and wait for it.
    ///
    /// Strategy status is left as is; a restart resumes from the store.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for feeder in self.feeders {
            let _ = feeder.await;
        }

        if self.handle.commands.send(Command::Shutdown).await.is_err() {
            debug!(account_id = %self.handle.account_id, "Actor already stopped");
        }
        if let Err(e) = self.actor.await {
            error!(account_id = %self.handle.account_id, error = %e, "Account actor panicked");
        }
        info!(account_id = %self.handle.account_id, "Account runtime shut down");
    }
}

/// Spawn the actor for `controller` along with its market poller and
/// take-profit timer.
pub fn spawn_account(
    controller: StrategyController,
    exchange: Arc<dyn ExchangeGateway>,
    settings: &ControllerSettings,
) -> AccountRuntime {
    let account_id = controller.account_id().to_string();
    let (commands_tx, commands_rx) = mpsc::channel(settings.queue_capacity.max(1));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (macd_tx, macd_rx) = watch::channel(controller.config().macd_filter.clone());
    let (period_tx, period_rx) = watch::channel(take_profit_period(controller.config()));

    let poller = MarketPoller {
        exchange,
        symbol: settings.symbol.clone(),
        period: settings.poll_interval(),
        call_timeout: settings.exchange_timeout(),
    };
    let feeders = vec![
        tokio::spawn(poller.run(macd_rx, commands_tx.clone(), shutdown_rx.clone())),
        tokio::spawn(run_take_profit_timer(
            period_rx,
            commands_tx.clone(),
            shutdown_rx,
        )),
    ];

    let actor = AccountActor {
        controller,
        commands: commands_rx,
        macd: macd_tx,
        take_profit_period: period_tx,
    };
    let actor = tokio::spawn(actor.run());

    info!(%account_id, symbol = %settings.symbol, "Account runtime started");

    AccountRuntime {
        handle: AccountHandle {
            account_id,
            commands: commands_tx,
        },
        shutdown: shutdown_tx,
        actor,
        feeders,
    }
}

struct AccountActor {
    controller: StrategyController,
    commands: mpsc::Receiver<Command>,
    macd: watch::Sender<MacdFilterConfig>,
    take_profit_period: watch::Sender<Option<Duration>>,
}

impl AccountActor {
    async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            if matches!(command, Command::Shutdown) {
                break;
            }
            debug!(account_id = %self.controller.account_id(), command = command.name(), "Processing command");
            self.handle(command).await;
        }
        info!(account_id = %self.controller.account_id(), "Account actor stopped");
    }

    async fn handle(&mut self, command: Command) {
        let controller = &mut self.controller;

        match command {
            Command::Start { config, reply } => {
                let _ = reply.send(controller.start(config).await);
            }
            Command::Pause { reply } => {
                let _ = reply.send(controller.pause().await);
            }
            Command::Resume { reply } => {
                let _ = reply.send(controller.resume().await);
            }
            Command::Stop { reply } => {
                let _ = reply.send(controller.stop().await);
            }
            Command::UpdateRiskParameters { update, reply } => {
                let _ = reply.send(controller.update_risk_parameters(update).await);
            }
            Command::UpdateGridSettings { update, reply } => {
                let _ = reply.send(controller.update_grid_settings(update).await);
            }
            Command::UpdateMacdFilter { update, reply } => {
                let _ = reply.send(controller.update_macd_filter(update).await);
            }
            Command::UpdateAdvancedSettings { update, reply } => {
                let _ = reply.send(controller.update_advanced_settings(update).await);
            }
            Command::RiskSummary { reply } => {
                let _ = reply.send(Ok(controller.risk_summary()));
            }
            Command::GridPreview { price, reply } => {
                let _ = reply.send(controller.grid_preview(price).await);
            }
            Command::State { reply } => {
                let _ = reply.send(Ok(controller.state().clone()));
            }
            Command::Records { reply } => {
                let _ = reply.send(Ok(controller.records().to_vec()));
            }
            Command::LastReconcile { reply } => {
                let _ = reply.send(Ok(controller.last_reconcile().cloned()));
            }
            Command::MarketTick(market) => match controller.on_market_tick(market).await {
                Ok(report) => {
                    if let Some(reconcile) = &report.reconcile {
                        for failure in &reconcile.failed {
                            warn!(
                                account_id = %controller.account_id(),
                                level_index = failure.level_index,
                                error = %failure.error,
                                "Level left unplaced this pass"
                            );
                        }
                    }
                }
                Err(e) => error!(account_id = %controller.account_id(), error = %e, "Market tick failed"),
            },
            Command::TakeProfitTimer => {
                if let Err(e) = controller.on_take_profit_timer().await {
                    warn!(account_id = %controller.account_id(), error = %e, "Take-profit timer tick failed");
                }
            }
            Command::Fill { client_order_id } => {
                if let Err(e) = controller.on_fill(&client_order_id).await {
                    error!(account_id = %controller.account_id(), %client_order_id, error = %e, "Fill handling failed");
                }
            }
            Command::Shutdown => {}
        }

        self.publish_feeder_config();
    }

    /// Push config changes to the feeders; the timer restarts only when its
    /// period actually changed.
    fn publish_feeder_config(&self) {
        let config = self.controller.config();

        self.macd.send_if_modified(|current| {
            if *current != config.macd_filter {
                *current = config.macd_filter.clone();
                true
            } else {
                false
            }
        });

        let period = take_profit_period(config);
        self.take_profit_period.send_if_modified(|current| {
            if *current != period {
                *current = period;
                true
            } else {
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RiskBands, SpacingType};
    use crate::exchange::{MacdSnapshot, MacdTrend, PaperExchange};
    use crate::persistence::PersistenceManager;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::collections::HashSet;

    fn settings() -> ControllerSettings {
        ControllerSettings {
            account_id: "acct".to_string(),
            poll_interval_secs: 3600,
            exchange_timeout_secs: 1,
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 4,
            ..Default::default()
        }
    }

    fn config() -> StrategyConfig {
        let mut config = StrategyConfig {
            spacing_type: SpacingType::Fixed,
            spacing_value: dec!(500),
            range_percent: dec!(1.1),
            max_total_orders: 4,
            ..Default::default()
        };
        config.macd_filter.enabled = false;
        config
    }

    fn market(price: Decimal) -> MarketSnapshot {
        MarketSnapshot {
            symbol: "BTCUSDT".to_string(),
            price,
            funding_rate_percent: Decimal::ZERO,
            macd: MacdSnapshot {
                line: Decimal::ZERO,
                signal: Decimal::ZERO,
                histogram: Decimal::ZERO,
                trend: MacdTrend::Neutral,
            },
            timestamp: Utc::now(),
        }
    }

    fn spawn(exchange: Arc<PaperExchange>) -> AccountRuntime {
        let store = Arc::new(PersistenceManager::new(":memory:").unwrap());
        let controller = StrategyController::load(
            settings(),
            RiskBands::default(),
            config(),
            exchange.clone(),
            store,
        )
        .unwrap();
        spawn_account(controller, exchange, &settings())
    }

    #[tokio::test]
    async fn test_commands_round_trip_through_actor() {
        let exchange = Arc::new(PaperExchange::new("BTCUSDT", dec!(10000), dec!(96500)));
        let runtime = spawn(exchange.clone());
        let handle = runtime.handle();

        let summary = handle.risk_summary().await.unwrap();
        assert_eq!(summary.total_capital, dec!(400));

        let state = handle.start(None).await.unwrap();
        assert_eq!(state.status.as_str(), "ACTIVE");
        assert_eq!(handle.records().await.unwrap().len(), 4);

        let err = handle.resume().await.unwrap_err();
        assert!(matches!(err, ControllerError::IllegalTransition { .. }));

        runtime.shutdown().await;
        assert!(matches!(
            handle.state().await,
            Err(ControllerError::ActorUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_ticks_and_commands_never_double_a_level() {
        let exchange = Arc::new(PaperExchange::new("BTCUSDT", dec!(10000), dec!(96500)));
        let runtime = spawn(exchange.clone());
        let handle = runtime.handle();

        let mut tasks = Vec::new();
        for i in 0..20u32 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                match i % 5 {
                    0 => {
                        let _ = handle.start(None).await;
                    }
                    1 => {
                        let _ = handle.stop().await;
                    }
                    2 => {
                        let _ = handle.pause().await;
                    }
                    3 => {
                        let _ = handle.resume().await;
                    }
                    _ => {
                        let _ = handle.market_tick(market(dec!(96500))).await;
                    }
                }
                let _ = handle.market_tick(market(dec!(96500))).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        // Final pass from a known status
        let _ = handle.start(None).await;
        let _ = handle.resume().await;
        handle.market_tick(market(dec!(96500))).await.unwrap();

        let records = handle.records().await.unwrap();
        let mut levels = HashSet::new();
        for record in &records {
            assert!(levels.insert(record.level_index), "level {} doubled", record.level_index);
        }

        let entries: Vec<_> = exchange
            .open_orders()
            .await
            .into_iter()
            .filter(|o| !o.reduce_only)
            .collect();
        let prices: HashSet<Decimal> = entries.iter().map(|o| o.price).collect();
        assert_eq!(prices.len(), entries.len());
        assert!(entries.len() <= 4);

        runtime.shutdown().await;
    }
}
