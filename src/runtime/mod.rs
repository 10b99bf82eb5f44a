//! Per-account runtime.
//!
//! - `actor`: the serial command loop owning one controller
//! - `command`: messages accepted by the loop
//! - `feeders`: market poller and dynamic take-profit timer
//! - `registry`: lookup of running accounts

mod actor;
mod command;
mod feeders;
mod registry;

pub use actor::{spawn_account, AccountHandle, AccountRuntime};
pub use command::{Command, Reply};
pub use feeders::{run_take_profit_timer, take_profit_period, MarketPoller};
pub use registry::AccountRegistry;
