//! Core value types shared across the engine

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One minute-aligned OHLCV candle. Immutable once recorded for its minute.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Minute-aligned timestamp (exchange-local, seconds zeroed)
    pub moment: NaiveDateTime,
}

impl Candle {
    /// Flat candle at a single price, used in tests and synthetic tapes
    pub fn flat(price: f64, moment: NaiveDateTime) -> Self {
        Self {
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 0.0,
            moment,
        }
    }
}

/// Ordered per-day candle store, keyed by minute timestamp.
/// Cleared at every session boundary.
pub type DayCandles = BTreeMap<NaiveDateTime, Candle>;

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Long => write!(f, "LONG"),
            Direction::Short => write!(f, "SHORT"),
        }
    }
}

/// Whole minutes from `from` to `to` (negative if `to` is earlier)
pub fn minutes_between(from: NaiveDateTime, to: NaiveDateTime) -> i64 {
    (to - from).num_minutes()
}
