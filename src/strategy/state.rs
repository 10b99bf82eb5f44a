//! Strategy status, transitions and cycle bookkeeping.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ControllerError, ControllerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyStatus {
    Stopped,
    /// Armed, waiting for the activation signal
    Wait,
    /// Placing and managing the ladder
    Active,
    /// Ladder frozen; resting orders stay, nothing new is placed
    Paused,
}

impl StrategyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyStatus::Stopped => "STOPPED",
            StrategyStatus::Wait => "WAIT",
            StrategyStatus::Active => "ACTIVE",
            StrategyStatus::Paused => "PAUSED",
        }
    }
}

impl fmt::Display for StrategyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StrategyStatus {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STOPPED" => Ok(StrategyStatus::Stopped),
            "WAIT" => Ok(StrategyStatus::Wait),
            "ACTIVE" => Ok(StrategyStatus::Active),
            "PAUSED" => Ok(StrategyStatus::Paused),
            other => Err(ControllerError::Persistence(format!(
                "unknown strategy status '{}'",
                other
            ))),
        }
    }
}

/// Inputs that may move the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyEvent {
    Start { filter_enabled: bool },
    BullishSignal,
    Pause,
    /// `gate_open` is the gate's verdict at resume time
    Resume { filter_enabled: bool, gate_open: bool },
    Stop,
}

impl StrategyEvent {
    fn action(&self) -> &'static str {
        match self {
            StrategyEvent::Start { .. } => "start",
            StrategyEvent::BullishSignal => "activate",
            StrategyEvent::Pause => "pause",
            StrategyEvent::Resume { .. } => "resume",
            StrategyEvent::Stop => "stop",
        }
    }
}

/// The transition table. Anything not listed is rejected and leaves the
/// status unchanged.
pub fn next_status(from: StrategyStatus, event: StrategyEvent) -> ControllerResult<StrategyStatus> {
    use StrategyEvent as E;
    use StrategyStatus as S;

    match (from, event) {
        (S::Stopped, E::Start { filter_enabled: true }) => Ok(S::Wait),
        (S::Stopped, E::Start { filter_enabled: false }) => Ok(S::Active),
        (S::Wait, E::BullishSignal) => Ok(S::Active),
        (S::Active, E::Pause) => Ok(S::Paused),
        (S::Paused, E::Resume { filter_enabled: false, .. }) => Ok(S::Active),
        (S::Paused, E::Resume { gate_open: true, .. }) => Ok(S::Active),
        (S::Paused, E::Resume { gate_open: false, .. }) => Ok(S::Wait),
        (S::Wait | S::Active | S::Paused, E::Stop) => Ok(S::Stopped),

        (S::Stopped, E::BullishSignal | E::Pause | E::Resume { .. } | E::Stop)
        | (S::Wait, E::Start { .. } | E::Pause | E::Resume { .. })
        | (S::Active, E::Start { .. } | E::BullishSignal | E::Resume { .. })
        | (S::Paused, E::Start { .. } | E::BullishSignal | E::Pause) => {
            Err(ControllerError::IllegalTransition {
                from: from.to_string(),
                action: event.action().to_string(),
            })
        }
    }
}

/// Mutable runtime record for one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyState {
    pub status: StrategyStatus,
    pub cycle_started_at: Option<DateTime<Utc>>,
    pub cycle_trade_count: u32,
    pub cycle_win_count: u32,
    pub cycle_pnl: Decimal,
    pub effective_take_profit_percent: Decimal,
    pub last_transition_at: DateTime<Utc>,
    /// Snapshot id of the config currently in force
    pub config_snapshot_id: u64,
}

impl StrategyState {
    pub fn new(effective_take_profit_percent: Decimal, config_snapshot_id: u64) -> Self {
        Self {
            status: StrategyStatus::Stopped,
            cycle_started_at: None,
            cycle_trade_count: 0,
            cycle_win_count: 0,
            cycle_pnl: Decimal::ZERO,
            effective_take_profit_percent,
            last_transition_at: Utc::now(),
            config_snapshot_id,
        }
    }

    /// Apply `event`, updating timestamps and cycle data on success.
    pub fn apply(&mut self, event: StrategyEvent) -> ControllerResult<StrategyStatus> {
        let next = next_status(self.status, event)?;
        let now = Utc::now();

        if next == StrategyStatus::Stopped {
            self.reset_cycle();
        } else if next == StrategyStatus::Active && self.cycle_started_at.is_none() {
            self.cycle_started_at = Some(now);
        }

        self.status = next;
        self.last_transition_at = now;
        Ok(next)
    }

    /// Book one closed entry/take-profit pair.
    pub fn record_trade(&mut self, pnl: Decimal) {
        self.cycle_trade_count += 1;
        if pnl > Decimal::ZERO {
            self.cycle_win_count += 1;
        }
        self.cycle_pnl += pnl;
    }

    pub fn reset_cycle(&mut self) {
        self.cycle_started_at = None;
        self.cycle_trade_count = 0;
        self.cycle_win_count = 0;
        self.cycle_pnl = Decimal::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_full_lifecycle_is_legal() {
        let mut state = StrategyState::new(dec!(1), 1);

        state.apply(StrategyEvent::Start { filter_enabled: true }).unwrap();
        assert_eq!(state.status, StrategyStatus::Wait);
        assert!(state.cycle_started_at.is_none());

        state.apply(StrategyEvent::BullishSignal).unwrap();
        assert_eq!(state.status, StrategyStatus::Active);
        assert!(state.cycle_started_at.is_some());

        state.apply(StrategyEvent::Pause).unwrap();
        state
            .apply(StrategyEvent::Resume {
                filter_enabled: true,
                gate_open: true,
            })
            .unwrap();
        assert_eq!(state.status, StrategyStatus::Active);

        state.apply(StrategyEvent::Stop).unwrap();
        assert_eq!(state.status, StrategyStatus::Stopped);
    }

    #[test]
    fn test_resume_after_stop_rejected() {
        let mut state = StrategyState::new(dec!(1), 1);
        state.apply(StrategyEvent::Start { filter_enabled: false }).unwrap();
        state.apply(StrategyEvent::Pause).unwrap();
        state.apply(StrategyEvent::Stop).unwrap();

        let err = state
            .apply(StrategyEvent::Resume {
                filter_enabled: false,
                gate_open: true,
            })
            .unwrap_err();
        assert_eq!(
            err,
            ControllerError::IllegalTransition {
                from: "STOPPED".into(),
                action: "resume".into()
            }
        );
        assert_eq!(state.status, StrategyStatus::Stopped);
    }

    #[test]
    fn test_resume_with_closed_gate_returns_to_wait() {
        assert_eq!(
            next_status(
                StrategyStatus::Paused,
                StrategyEvent::Resume {
                    filter_enabled: true,
                    gate_open: false
                }
            ),
            Ok(StrategyStatus::Wait)
        );
        assert_eq!(
            next_status(
                StrategyStatus::Paused,
                StrategyEvent::Resume {
                    filter_enabled: false,
                    gate_open: false
                }
            ),
            Ok(StrategyStatus::Active)
        );
    }

    #[test]
    fn test_start_skips_wait_only_without_filter() {
        assert_eq!(
            next_status(StrategyStatus::Stopped, StrategyEvent::Start { filter_enabled: true }),
            Ok(StrategyStatus::Wait)
        );
        assert!(next_status(StrategyStatus::Wait, StrategyEvent::Start { filter_enabled: false }).is_err());
        assert!(next_status(StrategyStatus::Stopped, StrategyEvent::Stop).is_err());
    }

    #[test]
    fn test_stop_resets_cycle_counters() {
        let mut state = StrategyState::new(dec!(1), 1);
        state.apply(StrategyEvent::Start { filter_enabled: false }).unwrap();
        state.record_trade(dec!(9.6));
        state.record_trade(dec!(-1.2));
        assert_eq!(state.cycle_trade_count, 2);
        assert_eq!(state.cycle_win_count, 1);
        assert_eq!(state.cycle_pnl, dec!(8.4));

        state.apply(StrategyEvent::Stop).unwrap();
        assert_eq!(state.cycle_trade_count, 0);
        assert_eq!(state.cycle_pnl, Decimal::ZERO);
        assert!(state.cycle_started_at.is_none());
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            StrategyStatus::Stopped,
            StrategyStatus::Wait,
            StrategyStatus::Active,
            StrategyStatus::Paused,
        ] {
            assert_eq!(status.as_str().parse::<StrategyStatus>(), Ok(status));
        }
    }
}
