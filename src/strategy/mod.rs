//! Grid strategy implementation.
//!
//! Contains the core logic for:
//! - MACD activation gating
//! - Funding-aware take-profit
//! - The strategy state machine and cycle bookkeeping
//! - Reconciling the order ladder against the exchange
//! - The per-account controller tying them together

mod controller;
mod gate;
mod ladder_manager;
mod state;
mod take_profit;

pub use controller::{StrategyController, TickReport};
pub use gate::ActivationGate;
pub use ladder_manager::{
    client_order_id, reconcile, ClosedTrade, LadderSettings, LevelFailure, OrderLadderManager,
    OrderRecord, OrderStatus, ReconcilePlan, ReconcileReport, SyncContext, SyncReport,
};
pub use state::{next_status, StrategyEvent, StrategyState, StrategyStatus};
pub use take_profit::{recompute as recompute_take_profit, DynamicTakeProfit};
