//! Monetary units and money range rules.

pub type Amount = i64;

pub const COIN: Amount = 100_000_000;

/// No single output or sum of outputs may exceed this.
pub const MAX_MONEY: Amount = 21_000_000 * COIN;

pub fn money_range(value: Amount) -> bool {
    (0..=MAX_MONEY).contains(&value)
}
