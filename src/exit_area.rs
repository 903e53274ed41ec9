//! Trailing exit area
//!
//! While a trade is open, a per-minute stop boundary trails the best close
//! seen so far: every improvement of the best close rewrites the boundary for
//! all remaining minutes of the session, merged so the boundary only ever
//! ratchets in the trade's favor. The exit fires when enough consecutive
//! closes land inside the area and the current candle is still inside it.

use chrono::{Duration, NaiveDateTime};
use std::collections::BTreeMap;
use tracing::debug;

use crate::types::{minutes_between, Candle, DayCandles, Direction};

/// Exit-area state for one open trade; armed at entry, disarmed at exit
#[derive(Debug, Default)]
pub struct ExitAreaTracker {
    direction: Option<Direction>,
    /// Distance from the best close to the stop boundary, fixed at entry
    stop_distance: Option<f64>,
    boundary_by_moment: BTreeMap<NaiveDateTime, f64>,
    best_close: Option<f64>,
    consecutive_closes_inside: u32,
}

impl ExitAreaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the tracker to a freshly opened trade. `stop_distance` is the
    /// fraction of the confirming box's height configured for the exit stop.
    pub fn arm(&mut self, direction: Direction, stop_distance: f64) {
        self.direction = Some(direction);
        self.stop_distance = Some(stop_distance);
        self.boundary_by_moment.clear();
        self.best_close = None;
        self.consecutive_closes_inside = 0;
    }

    pub fn disarm(&mut self) {
        self.direction = None;
        self.stop_distance = None;
        self.boundary_by_moment.clear();
        self.best_close = None;
        self.consecutive_closes_inside = 0;
    }

    pub fn is_armed(&self) -> bool {
        self.direction.is_some()
    }

    pub fn boundary_at(&self, moment: NaiveDateTime) -> Option<f64> {
        self.boundary_by_moment.get(&moment).copied()
    }

    pub fn consecutive_closes_inside(&self) -> u32 {
        self.consecutive_closes_inside
    }

    /// Ingest one minute while armed: ratchet the boundary if the close is a
    /// new best, then update the consecutive-closes-inside counter.
    pub fn record(&mut self, candle: &Candle, last_session_moment: NaiveDateTime) {
        let Some(direction) = self.direction else {
            return;
        };
        let Some(stop_distance) = self.stop_distance else {
            return;
        };

        let improved = match self.best_close {
            None => {
                self.best_close = Some(candle.close);
                // First candle after entry seeds the trail without writing
                false
            }
            Some(best) => match direction {
                Direction::Long => candle.close > best,
                Direction::Short => candle.close < best,
            },
        };

        if improved {
            self.best_close = Some(candle.close);
            let boundary = match direction {
                Direction::Long => candle.close - stop_distance,
                Direction::Short => candle.close + stop_distance,
            };
            self.write_boundary(candle.moment, last_session_moment, boundary, direction);
            debug!(%boundary, moment = %candle.moment, "exit area ratcheted");
        }

        if self.close_is_inside(candle) {
            self.consecutive_closes_inside += 1;
        } else {
            self.consecutive_closes_inside = 0;
        }
    }

    /// Current candle closed at or past the boundary for its minute
    pub fn close_is_inside(&self, candle: &Candle) -> bool {
        let (Some(direction), Some(boundary)) =
            (self.direction, self.boundary_by_moment.get(&candle.moment))
        else {
            return false;
        };
        match direction {
            Direction::Long => candle.close <= *boundary,
            Direction::Short => candle.close >= *boundary,
        }
    }

    /// Is the current close the worst close of the trailing lookback window?
    /// (lowest for longs, highest for shorts)
    pub fn is_worst_close_in_window(
        &self,
        moment: NaiveDateTime,
        lookback_minutes: i64,
        candles: &DayCandles,
    ) -> bool {
        let Some(direction) = self.direction else {
            return false;
        };
        let closes: Vec<f64> = (0..lookback_minutes)
            .filter_map(|i| candles.get(&(moment - Duration::minutes(i))).map(|c| c.close))
            .collect();
        if (closes.len() as i64) < lookback_minutes {
            return false;
        }
        let Some(current_close) = candles.get(&moment).map(|c| c.close) else {
            return false;
        };
        match direction {
            Direction::Long => closes.iter().all(|c| current_close <= *c),
            Direction::Short => closes.iter().all(|c| current_close >= *c),
        }
    }

    /// Write `boundary` for every remaining minute of the session, merging so
    /// an already-written boundary can only tighten in the trade's favor.
    fn write_boundary(
        &mut self,
        from: NaiveDateTime,
        last_session_moment: NaiveDateTime,
        boundary: f64,
        direction: Direction,
    ) {
        let minutes_until_close = minutes_between(from, last_session_moment);
        for i in 0..=minutes_until_close {
            let target = from + Duration::minutes(i);
            self.boundary_by_moment
                .entry(target)
                .and_modify(|existing| {
                    *existing = match direction {
                        Direction::Long => existing.max(boundary),
                        Direction::Short => existing.min(boundary),
                    };
                })
                .or_insert(boundary);
        }
    }
}
