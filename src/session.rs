//! Per-day session state
//!
//! Everything here is reset atomically at the start of a new trading session,
//! before the first candle of the day reaches any other component.

use chrono::{NaiveDate, NaiveDateTime};

use crate::types::{Candle, DayCandles};

/// The per-day candle/feature context: ordered candles, running extremes and
/// the moments where a close established a new running daily high or low.
#[derive(Debug, Default)]
pub struct SessionContext {
    pub date: Option<NaiveDate>,
    pub candles: DayCandles,
    pub first_candle: Option<Candle>,
    pub session_open_moment: Option<NaiveDateTime>,
    pub day_high: Option<f64>,
    pub day_low: Option<f64>,
    pub day_high_moment: Option<NaiveDateTime>,
    pub day_low_moment: Option<NaiveDateTime>,
    /// Moments whose close exceeded the running daily high
    pub closing_hod_moments: Vec<NaiveDateTime>,
    /// Moments whose close undercut the running daily low
    pub closing_lod_moments: Vec<NaiveDateTime>,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when `moment` belongs to a different day than the current session
    pub fn is_new_session(&self, moment: NaiveDateTime) -> bool {
        self.date != Some(moment.date())
    }

    /// Clear all per-day state for a fresh session opening at `open_moment`
    pub fn reset_for_new_session(&mut self, open_moment: NaiveDateTime) {
        self.date = Some(open_moment.date());
        self.session_open_moment = Some(open_moment);
        self.candles.clear();
        self.first_candle = None;
        self.day_high = None;
        self.day_low = None;
        self.day_high_moment = None;
        self.day_low_moment = None;
        self.closing_hod_moments.clear();
        self.closing_lod_moments.clear();
    }

    /// Ingest one minute candle: record it, mark closing extremes against the
    /// running high/low so far, then advance the running extremes.
    pub fn record(&mut self, candle: Candle) {
        let moment = candle.moment;

        // Closing extremes are judged against the running extreme BEFORE this
        // candle widens it, so the first candle of the day never counts.
        if let Some(high) = self.day_high {
            if candle.close > high {
                self.closing_hod_moments.push(moment);
            }
        }
        if let Some(low) = self.day_low {
            if candle.close < low {
                self.closing_lod_moments.push(moment);
            }
        }

        if self.day_high.map_or(true, |h| candle.high > h) {
            self.day_high = Some(candle.high);
            self.day_high_moment = Some(moment);
        }
        if self.day_low.map_or(true, |l| candle.low < l) {
            self.day_low = Some(candle.low);
            self.day_low_moment = Some(moment);
        }

        if self.first_candle.is_none() {
            self.first_candle = Some(candle);
        }
        self.candles.insert(moment, candle);
    }

    /// Count of closing highs minus count of closing lows so far today
    pub fn hod_lod_balance(&self) -> i64 {
        self.closing_hod_moments.len() as i64 - self.closing_lod_moments.len() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn candle(m: u32, close: f64) -> Candle {
        let moment = NaiveDate::from_ymd_opt(2024, 3, 4)
            .unwrap()
            .and_hms_opt(9, 30 + m, 0)
            .unwrap();
        Candle {
            open: close,
            high: close + 0.1,
            low: close - 0.1,
            close,
            volume: 1.0,
            moment,
        }
    }

    #[test]
    fn test_closing_extremes_track_running_high_low() {
        let mut session = SessionContext::new();
        session.reset_for_new_session(candle(0, 100.0).moment);

        session.record(candle(0, 100.0)); // first candle never counts
        session.record(candle(1, 100.2)); // close above running high of 100.1
        session.record(candle(2, 100.1)); // inside, no extreme
        session.record(candle(3, 99.5)); // below running low

        assert_eq!(session.closing_hod_moments.len(), 1);
        assert_eq!(session.closing_lod_moments.len(), 1);
        assert_eq!(session.hod_lod_balance(), 0);
        assert_eq!(session.day_high, Some(100.3));
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut session = SessionContext::new();
        session.reset_for_new_session(candle(0, 100.0).moment);
        session.record(candle(0, 100.0));
        session.record(candle(1, 101.0));

        let next_day = NaiveDate::from_ymd_opt(2024, 3, 5)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap();
        assert!(session.is_new_session(next_day));

        session.reset_for_new_session(next_day);
        assert!(session.candles.is_empty());
        assert!(session.first_candle.is_none());
        assert!(session.day_high.is_none());
        assert!(session.closing_hod_moments.is_empty());
    }
}
