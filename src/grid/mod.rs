//! Grid ladder generation.
//!
//! Maps strategy parameters and the current price to the set of buy levels
//! below the price and sell levels above it.

mod ladder;

pub use ladder::{generate_levels, GridLadder, GridLevel};
