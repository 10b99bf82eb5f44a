//! MACD activation gate.

use rust_decimal::Decimal;

use crate::exchange::MacdSnapshot;

/// Tracks consecutive MACD snapshots and reports bullish crossovers.
///
/// Only consulted while the strategy waits for a signal. A bearish flip while
/// active never pauses the ladder.
#[derive(Debug, Clone, Default)]
pub struct ActivationGate {
    previous: Option<MacdSnapshot>,
    latest: Option<MacdSnapshot>,
}

impl ActivationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a snapshot. Returns `true` when the histogram has just crossed
    /// from non-positive to positive with the MACD line rising.
    pub fn observe(&mut self, macd: &MacdSnapshot) -> bool {
        let crossed = match &self.latest {
            Some(prev) => {
                prev.histogram <= Decimal::ZERO
                    && macd.histogram > Decimal::ZERO
                    && macd.line > prev.line
            }
            None => false,
        };

        self.previous = self.latest.take();
        self.latest = Some(*macd);
        crossed
    }

    /// Whether momentum is still bullish, used when resuming.
    pub fn is_open(&self) -> bool {
        match (&self.previous, &self.latest) {
            (Some(prev), Some(latest)) => {
                latest.histogram > Decimal::ZERO && latest.line > prev.line
            }
            _ => false,
        }
    }

    pub fn latest(&self) -> Option<&MacdSnapshot> {
        self.latest.as_ref()
    }
}
