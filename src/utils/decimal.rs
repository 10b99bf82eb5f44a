//! Decimal arithmetic utilities for price and quantity handling.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Smallest increment for a value carried with `decimals` places.
pub fn tick_for_decimals(decimals: u32) -> Decimal {
    Decimal::new(1, decimals)
}

/// Round to tick size (e.g., 0.01 for most prices).
pub fn round_to_tick(value: Decimal, tick_size: Decimal) -> Decimal {
    if tick_size == Decimal::ZERO {
        return value;
    }
    (value / tick_size).round() * tick_size
}

/// Round down to lot size (quantity precision).
pub fn round_down_to_lot(value: Decimal, lot_size: Decimal) -> Decimal {
    if lot_size == Decimal::ZERO {
        return value;
    }
    (value / lot_size).floor() * lot_size
}

/// Calculate percentage difference between two values.
pub fn percentage_diff(a: Decimal, b: Decimal) -> Decimal {
    if b == Decimal::ZERO {
        return Decimal::ZERO;
    }
    ((a - b) / b).abs() * dec!(100)
}
