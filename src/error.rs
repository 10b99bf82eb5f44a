//! Error taxonomy for the grid controller.
//!
//! Every user-visible failure names the parameter or ladder level that caused
//! it. Nothing here is fatal to the process: a failed reconciliation pass is
//! simply retried on the next market tick.

use thiserror::Error;

use crate::exchange::ExchangeError;

/// Errors surfaced by the strategy controller and its command handlers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ControllerError {
    /// A config value is out of range. Rejected before any state change.
    #[error("invalid config: `{field}` {reason}")]
    InvalidConfig { field: String, reason: String },

    /// The requested command is not legal from the current status.
    #[error("illegal transition: cannot {action} while {from}")]
    IllegalTransition { from: String, action: String },

    /// Timeout or rate limit that exhausted the retry budget.
    #[error("exchange temporarily unavailable: {0}")]
    ExchangeTransient(String),

    /// The exchange refused an order for a specific ladder level.
    #[error("exchange rejected level {level_index}: {reason}")]
    ExchangeRejected { level_index: i32, reason: String },

    /// Local order state disagreed with the exchange and was corrected.
    #[error("reconciliation conflict on {client_order_id}: {detail}")]
    ReconciliationConflict {
        client_order_id: String,
        detail: String,
    },

    /// No market snapshot has been received yet.
    #[error("market data unavailable for {0}")]
    MarketDataUnavailable(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    /// The account's command queue has shut down.
    #[error("account {0} is not running")]
    ActorUnavailable(String),
}

impl ControllerError {
    /// Shorthand for a validation failure on a named field.
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ControllerError::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Classify an exchange error raised while working on a ladder level.
    pub fn from_exchange(level_index: i32, err: &ExchangeError) -> Self {
        if err.is_transient() {
            ControllerError::ExchangeTransient(format!("level {}: {}", level_index, err))
        } else {
            ControllerError::ExchangeRejected {
                level_index,
                reason: err.to_string(),
            }
        }
    }
}

impl From<anyhow::Error> for ControllerError {
    fn from(err: anyhow::Error) -> Self {
        ControllerError::Persistence(format!("{:#}", err))
    }
}

/// Result type for controller operations.
pub type ControllerResult<T> = std::result::Result<T, ControllerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_names_field() {
        let err = ControllerError::invalid("leverage", "must be between 1 and 125, got 200");
        assert_eq!(
            err.to_string(),
            "invalid config: `leverage` must be between 1 and 125, got 200"
        );
    }

    #[test]
    fn test_exchange_error_classification() {
        let transient = ControllerError::from_exchange(-3, &ExchangeError::Timeout);
        assert!(matches!(transient, ControllerError::ExchangeTransient(_)));

        let rejected = ControllerError::from_exchange(
            4,
            &ExchangeError::InsufficientMargin("balance 10".into()),
        );
        assert_eq!(
            rejected,
            ControllerError::ExchangeRejected {
                level_index: 4,
                reason: "insufficient margin: balance 10".into()
            }
        );
    }
}
