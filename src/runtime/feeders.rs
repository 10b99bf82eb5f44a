//! Event sources feeding an account's command queue.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::config::{MacdFilterConfig, StrategyConfig};
use crate::exchange::{with_timeout, ExchangeGateway};

use super::command::Command;

/// Period of the dynamic take-profit timer, `None` when the policy is off.
pub fn take_profit_period(config: &StrategyConfig) -> Option<Duration> {
    config
        .dynamic_tp
        .enabled
        .then(|| Duration::from_secs(u64::from(config.dynamic_tp.check_interval_minutes) * 60))
}

/// Polls market snapshots and queues them as ticks.
pub struct MarketPoller {
    pub exchange: Arc<dyn ExchangeGateway>,
    pub symbol: String,
    pub period: Duration,
    pub call_timeout: Duration,
}

impl MarketPoller {
    /// Runs until shutdown or until the actor stops accepting commands.
    ///
    /// A failed fetch skips the tick; the next one retries.
    pub async fn run(
        self,
        mut macd: watch::Receiver<MacdFilterConfig>,
        commands: mpsc::Sender<Command>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let config = macd.borrow_and_update().clone();
                    let snapshot = with_timeout(
                        self.call_timeout,
                        self.exchange.get_market_snapshot(&self.symbol, &config),
                    )
                    .await;

                    match snapshot {
                        Ok(market) => {
                            if commands.send(Command::MarketTick(market)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(symbol = %self.symbol, error = %e, "Market snapshot fetch failed"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        debug!(symbol = %self.symbol, "Market poller stopped");
    }
}

/// Queues a take-profit timer tick every period. Idle while the period is
/// `None`; a new period restarts the timer.
pub async fn run_take_profit_timer(
    mut period: watch::Receiver<Option<Duration>>,
    commands: mpsc::Sender<Command>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let current = *period.borrow_and_update();

        let every = match current {
            Some(every) => every,
            None => {
                let stop = tokio::select! {
                    changed = period.changed() => changed.is_err(),
                    _ = shutdown.changed() => true,
                };
                if stop {
                    break;
                }
                continue;
            }
        };

        debug!(period_secs = every.as_secs(), "Take-profit timer armed");
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let restart = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if commands.send(Command::TakeProfitTimer).await.is_err() {
                        break false;
                    }
                }
                changed = period.changed() => break changed.is_ok(),
                _ = shutdown.changed() => break false,
            }
        };

        if !restart {
            break;
        }
    }

    debug!("Take-profit timer stopped");
}
