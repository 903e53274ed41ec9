//! Boolean trigger signals
//!
//! Every signal is a pure function of its inputs returning a verdict; none of
//! them hold state. The orchestrator keeps the last verdict per signal in a
//! [`SignalBook`] so changes get logged exactly once, instead of each signal
//! mutating a "most recent decision" field of its own.

use chrono::{Duration, NaiveDateTime, NaiveTime};
use std::collections::BTreeMap;
use tracing::info;

use crate::box_engine::{BoxBreakout, BoxEngine, RangeRelation};
use crate::opening_range::OpeningRange;
use crate::types::Direction;

/// Outcome of one signal evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalVerdict {
    Buy,
    Sell,
    Quiet,
}

impl std::fmt::Display for SignalVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalVerdict::Buy => write!(f, "BUY"),
            SignalVerdict::Sell => write!(f, "SELL"),
            SignalVerdict::Quiet => write!(f, "QUIET"),
        }
    }
}

impl SignalVerdict {
    pub fn direction(self) -> Option<Direction> {
        match self {
            SignalVerdict::Buy => Some(Direction::Long),
            SignalVerdict::Sell => Some(Direction::Short),
            SignalVerdict::Quiet => None,
        }
    }
}

/// Last verdict per signal name, for change-only logging
#[derive(Debug, Default)]
pub struct SignalBook {
    last: BTreeMap<&'static str, SignalVerdict>,
}

impl SignalBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a verdict; logs when it differs from the previous one
    pub fn observe(&mut self, name: &'static str, verdict: SignalVerdict) -> SignalVerdict {
        let previous = self.last.insert(name, verdict);
        if previous != Some(verdict) {
            info!(signal = name, %verdict, "signal verdict changed");
        }
        verdict
    }

    pub fn last(&self, name: &'static str) -> Option<SignalVerdict> {
        self.last.get(name).copied()
    }

    pub fn clear(&mut self) {
        self.last.clear();
    }
}

/// Externally computed daily volatility-regime features. The composites here
/// gate the pre-signal; their computation (gap classification, trend slopes,
/// percentiles) lives outside the core.
#[derive(Debug, Clone, Copy, Default)]
pub struct VolatilityInputs {
    pub overnight_gap_volatile: bool,
    pub prior_day_gap_volatile: bool,
    pub prior_trend_volatile: bool,
    pub prior_trend_range_volatile: bool,
}

impl VolatilityInputs {
    pub fn is_high_volatility(&self) -> bool {
        self.overnight_gap_volatile
            || self.prior_day_gap_volatile
            || self.prior_trend_volatile
            || self.prior_trend_range_volatile
    }
}

/// Prior-day trend direction, computed externally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrendDirection {
    Upward,
    Downward,
    #[default]
    Flat,
}

/// Externally computed gap/trend features feeding the confirmation-box
/// avoid conditions
#[derive(Debug, Clone, Copy, Default)]
pub struct DailyFeatures {
    /// Today's open relative to yesterday's close, as a fraction
    pub intraday_gap: f64,
    pub prior_trend: TrendDirection,
    pub prior_trend_low_high_range: f64,
    pub two_days_ago_trend_slope: f64,
}

const FLAT_GAP_BAND: f64 = 0.0015;
const VOLATILE_LOW_HIGH_RANGE: f64 = 0.0075;

/// Avoid taking a SHORT confirmation box under these prior-day regimes
pub fn avoid_short_confirmation(features: &DailyFeatures) -> bool {
    let flat_gap_but_wide_prior_day = features.intraday_gap >= -FLAT_GAP_BAND
        && features.intraday_gap <= FLAT_GAP_BAND
        && features.prior_trend_low_high_range >= VOLATILE_LOW_HIGH_RANGE;

    flat_gap_but_wide_prior_day
        || features.prior_trend == TrendDirection::Downward
        || (features.prior_trend == TrendDirection::Upward
            && features.intraday_gap >= 0.0
            && features.two_days_ago_trend_slope <= 0.0)
}

/// Avoid taking a LONG confirmation box under these prior-day regimes
pub fn avoid_long_confirmation(features: &DailyFeatures) -> bool {
    let flat_gap_but_wide_prior_day = features.intraday_gap >= -FLAT_GAP_BAND
        && features.intraday_gap <= FLAT_GAP_BAND
        && features.prior_trend_low_high_range >= VOLATILE_LOW_HIGH_RANGE;

    flat_gap_but_wide_prior_day || features.prior_trend != TrendDirection::Flat
}

/// Directional trigger: the accumulated count of closing daily highs minus
/// closing daily lows crossed the balance threshold before the cutoff time,
/// and price already sits far enough beyond the opening range on that side.
#[allow(clippy::too_many_arguments)]
pub fn hod_lod_balance_trigger(
    closing_hod_count: usize,
    closing_lod_count: usize,
    moment: NaiveDateTime,
    price: f64,
    cutoff: NaiveTime,
    balance_threshold: i64,
    opening_range: Option<OpeningRange>,
    range_distance_fraction: f64,
) -> SignalVerdict {
    let balance = closing_hod_count as i64 - closing_lod_count as i64;
    if moment.time() >= cutoff || balance.abs() < balance_threshold {
        return SignalVerdict::Quiet;
    }

    let Some(range) = opening_range else {
        return SignalVerdict::Quiet;
    };
    let min_distance = range.height() * range_distance_fraction;

    if balance > 0 {
        if price <= range.high + min_distance {
            return SignalVerdict::Quiet;
        }
        SignalVerdict::Buy
    } else {
        if price >= range.low - min_distance {
            return SignalVerdict::Quiet;
        }
        SignalVerdict::Sell
    }
}

/// Directional trigger: some box closed recently (within each engine's
/// after-close window) with a breakout in `direction` AND sitting beyond the
/// opening range on that side.
pub fn box_closed_beyond_range(
    engines: &[BoxEngine],
    moment: NaiveDateTime,
    direction: Direction,
) -> SignalVerdict {
    let (wanted_breakout, wanted_relation, verdict) = match direction {
        Direction::Long => (BoxBreakout::Up, RangeRelation::Above, SignalVerdict::Buy),
        Direction::Short => (BoxBreakout::Down, RangeRelation::Below, SignalVerdict::Sell),
    };

    for engine in engines {
        let window = Duration::minutes(engine.config().hod_lod_after_close_minutes);
        for closed in engine.closed_boxes() {
            if moment - window <= closed.end_moment
                && closed.breakout == Some(wanted_breakout)
                && closed.range_relation == Some(wanted_relation)
            {
                return verdict;
            }
        }
    }
    SignalVerdict::Quiet
}
