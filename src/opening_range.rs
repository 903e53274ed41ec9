//! Opening Range Tracking
//!
//! The opening range is the [low, high] band observed during a fixed window
//! after the session opens. It is computed exactly once per day, then read-only.
//! Ranges persist across days so the trailing average thickness can scale the
//! box engines' max-thickness threshold each morning.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::minutes_between;

/// A day's opening range, immutable once set
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OpeningRange {
    pub high: f64,
    pub low: f64,
}

impl OpeningRange {
    pub fn height(&self) -> f64 {
        self.high - self.low
    }

    /// Relative thickness `(high - low) / low`
    pub fn thickness(&self) -> f64 {
        (self.high - self.low) / self.low
    }
}

/// Shift a [low, high] band so its midpoint sits on `anchor`
pub fn shift_to_anchor(high: f64, low: f64, anchor: f64) -> (f64, f64) {
    let shift = anchor - (high + low) / 2.0;
    (high + shift, low + shift)
}

/// Tracks one opening-range window variant across trading days
#[derive(Debug, Clone)]
pub struct OpeningRangeTracker {
    /// Window length after session open, in minutes
    pub window_minutes: i64,
    by_date: BTreeMap<NaiveDate, OpeningRange>,
}

impl OpeningRangeTracker {
    pub fn new(window_minutes: i64) -> Self {
        Self {
            window_minutes,
            by_date: BTreeMap::new(),
        }
    }

    /// The range for `date`, if the window has already elapsed that day
    pub fn range_for(&self, date: NaiveDate) -> Option<OpeningRange> {
        self.by_date.get(&date).copied()
    }

    /// Called every minute. Freezes the range exactly when the window after
    /// session open has elapsed; a no-op on every other minute.
    pub fn update(
        &mut self,
        current_moment: NaiveDateTime,
        session_open_moment: NaiveDateTime,
        day_high_so_far: f64,
        day_low_so_far: f64,
        day_open_price: f64,
        recenter_on_open: bool,
    ) {
        if minutes_between(session_open_moment, current_moment) != self.window_minutes {
            return;
        }

        let date = current_moment.date();
        debug_assert!(!self.by_date.contains_key(&date));

        let (high, low) = if recenter_on_open {
            shift_to_anchor(day_high_so_far, day_low_so_far, day_open_price)
        } else {
            (day_high_so_far, day_low_so_far)
        };

        self.by_date.insert(date, OpeningRange { high, low });
    }

    /// Mean relative thickness of the last `days` stored ranges, if any.
    /// This is the volatility scale for the box max-thickness refresh.
    pub fn average_thickness(&self, days: usize) -> Option<f64> {
        if self.by_date.is_empty() {
            return None;
        }
        let recent: Vec<f64> = self
            .by_date
            .values()
            .rev()
            .take(days)
            .map(|r| r.thickness())
            .collect();
        Some(recent.iter().sum::<f64>() / recent.len() as f64)
    }
}
