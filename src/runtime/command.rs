//! Messages accepted by an account actor.

use rust_decimal::Decimal;
use tokio::sync::oneshot;

use crate::config::{
    AdvancedSettingsUpdate, ConfigSnapshot, GridSettingsUpdate, MacdFilterUpdate,
    RiskParametersUpdate, StrategyConfig,
};
use crate::error::ControllerResult;
use crate::exchange::MarketSnapshot;
use crate::grid::GridLadder;
use crate::risk::RiskSummary;
use crate::strategy::{OrderRecord, ReconcileReport, StrategyState};

pub type Reply<T> = oneshot::Sender<ControllerResult<T>>;

/// User commands, market ticks and timer ticks share one queue so that
/// each is processed to completion before the next.
#[derive(Debug)]
pub enum Command {
    Start {
        config: Option<StrategyConfig>,
        reply: Reply<StrategyState>,
    },
    Pause {
        reply: Reply<StrategyState>,
    },
    Resume {
        reply: Reply<StrategyState>,
    },
    Stop {
        reply: Reply<StrategyState>,
    },
    UpdateRiskParameters {
        update: RiskParametersUpdate,
        reply: Reply<ConfigSnapshot>,
    },
    UpdateGridSettings {
        update: GridSettingsUpdate,
        reply: Reply<ConfigSnapshot>,
    },
    UpdateMacdFilter {
        update: MacdFilterUpdate,
        reply: Reply<ConfigSnapshot>,
    },
    UpdateAdvancedSettings {
        update: AdvancedSettingsUpdate,
        reply: Reply<ConfigSnapshot>,
    },
    RiskSummary {
        reply: Reply<RiskSummary>,
    },
    GridPreview {
        price: Option<Decimal>,
        reply: Reply<GridLadder>,
    },
    State {
        reply: Reply<StrategyState>,
    },
    Records {
        reply: Reply<Vec<OrderRecord>>,
    },
    LastReconcile {
        reply: Reply<Option<ReconcileReport>>,
    },
    MarketTick(MarketSnapshot),
    TakeProfitTimer,
    Fill {
        client_order_id: String,
    },
    Shutdown,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Start { .. } => "start",
            Command::Pause { .. } => "pause",
            Command::Resume { .. } => "resume",
            Command::Stop { .. } => "stop",
            Command::UpdateRiskParameters { .. } => "update_risk_parameters",
            Command::UpdateGridSettings { .. } => "update_grid_settings",
            Command::UpdateMacdFilter { .. } => "update_macd_filter",
            Command::UpdateAdvancedSettings { .. } => "update_advanced_settings",
            Command::RiskSummary { .. } => "risk_summary",
            Command::GridPreview { .. } => "grid_preview",
            Command::State { .. } => "state",
            Command::Records { .. } => "records",
            Command::LastReconcile { .. } => "last_reconcile",
            Command::MarketTick(_) => "market_tick",
            Command::TakeProfitTimer => "take_profit_timer",
            Command::Fill { .. } => "fill",
            Command::Shutdown => "shutdown",
        }
    }
}
