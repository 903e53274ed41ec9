//! Consolidation Box Engine
//!
//! Streaming detection, qualification and breakout classification of
//! price-consolidation intervals. One engine instance runs per opening-range
//! window variant; each holds at most one open box plus the day's closed
//! history. Boxes are discovered retroactively (a backward scan from the
//! current minute), widened in place while the interval keeps qualifying,
//! and classified the minute they stop qualifying.

use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::BoxEngineConfig;
use crate::error::EngineError;
use crate::opening_range::OpeningRange;
use crate::types::{minutes_between, Candle, DayCandles};

/// How price exited a box, assigned once when the box closes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoxBreakout {
    Up,
    Down,
    MarketClose,
}

impl std::fmt::Display for BoxBreakout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BoxBreakout::Up => write!(f, "UP"),
            BoxBreakout::Down => write!(f, "DOWN"),
            BoxBreakout::MarketClose => write!(f, "MARKET_CLOSE"),
        }
    }
}

/// Position of a closed box relative to the day's opening range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RangeRelation {
    Inside,
    Across,
    Above,
    Below,
}

/// A detected interval of low-range sideways price action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidationBox {
    pub id: Uuid,
    /// Oldest minute of the qualifying interval
    pub start_moment: NaiveDateTime,
    /// Most recent minute of the interval; advances while the box is open
    pub end_moment: NaiveDateTime,
    /// Minute at which the retroactive scan first found the box
    pub creation_moment: NaiveDateTime,
    pub high: f64,
    pub low: f64,
    /// Breakout classification; `None` while open or unresolved
    pub breakout: Option<BoxBreakout>,
    /// Relation to the opening range, set at close
    pub range_relation: Option<RangeRelation>,
    /// A closing new daily high/low fell within the configured window
    /// after this box closed
    pub had_hod_after_close: bool,
    pub had_lod_after_close: bool,
    /// A closing new daily high/low fell within the configured lookback
    /// window ending at this box's close
    pub had_hod_before_close: bool,
    pub had_lod_before_close: bool,
    /// The final minutes compressed into the top/bottom band of the box
    pub broke_from_top_band: bool,
    pub broke_from_bottom_band: bool,
}

impl ConsolidationBox {
    pub fn height(&self) -> f64 {
        self.high - self.low
    }

    pub fn midpoint(&self) -> f64 {
        (self.high + self.low) / 2.0
    }

    /// Minute moments from start to end, inclusive
    pub fn lifetime_moments(&self) -> impl Iterator<Item = NaiveDateTime> + '_ {
        let total = minutes_between(self.start_moment, self.end_moment);
        (0..=total).map(move |i| self.start_moment + Duration::minutes(i))
    }
}

/// Everything a box engine needs from its collaborators for one minute
#[derive(Debug, Clone, Copy)]
pub struct BoxUpdate<'a> {
    pub moment: NaiveDateTime,
    pub candle: Candle,
    pub candles: &'a DayCandles,
    /// The day's opening range, once available
    pub opening_range: Option<OpeningRange>,
    /// End of the opening-range window (session open + window minutes)
    pub opening_range_end: NaiveDateTime,
    pub closing_hod: &'a [NaiveDateTime],
    pub closing_lod: &'a [NaiveDateTime],
    pub at_market_close: bool,
}

/// One consolidation-box engine instance
#[derive(Debug)]
pub struct BoxEngine {
    pub name: String,
    config: BoxEngineConfig,
    open_box: Option<ConsolidationBox>,
    closed_boxes: Vec<ConsolidationBox>,
    max_thickness: Option<f64>,
    max_thickness_set_on: Option<NaiveDate>,
}

impl BoxEngine {
    pub fn new(name: impl Into<String>, config: BoxEngineConfig) -> Self {
        Self {
            name: name.into(),
            config,
            open_box: None,
            closed_boxes: Vec::new(),
            max_thickness: None,
            max_thickness_set_on: None,
        }
    }

    pub fn config(&self) -> &BoxEngineConfig {
        &self.config
    }

    pub fn open_box(&self) -> Option<&ConsolidationBox> {
        self.open_box.as_ref()
    }

    pub fn closed_boxes(&self) -> &[ConsolidationBox] {
        &self.closed_boxes
    }

    pub fn max_thickness(&self) -> Option<f64> {
        self.max_thickness
    }

    /// The volatility-scaled thickness threshold is refreshed once per day
    pub fn needs_thickness_refresh(&self, date: NaiveDate) -> bool {
        self.max_thickness_set_on.map_or(true, |set| date > set)
    }

    pub fn set_max_thickness(&mut self, date: NaiveDate, value: f64) {
        self.max_thickness = Some(value);
        self.max_thickness_set_on = Some(date);
        debug!(engine = %self.name, %date, value, "max thickness refreshed");
    }

    #[cfg(test)]
    pub(crate) fn push_closed(&mut self, closed: ConsolidationBox) {
        self.closed_boxes.push(closed);
    }

    /// Drop all per-day box state at session open
    pub fn erase_all(&mut self) {
        self.open_box = None;
        self.closed_boxes.clear();
    }

    /// Attribute a closing new daily extreme at `moment` to recently closed
    /// boxes (those whose close falls within the after-window).
    pub fn mark_closing_extreme(&mut self, moment: NaiveDateTime, is_hod: bool, is_lod: bool) {
        if !is_hod && !is_lod {
            return;
        }
        let window_start = moment - Duration::minutes(self.config.hod_lod_after_close_minutes);
        for closed in &mut self.closed_boxes {
            if window_start <= closed.end_moment {
                if is_hod {
                    closed.had_hod_after_close = true;
                }
                if is_lod {
                    closed.had_lod_after_close = true;
                }
            }
        }
    }

    /// Per-minute update: extend or close the open box, or try to discover one.
    /// Only invariant violations (impossible opening-range relations) are
    /// returned as errors; data gaps close the box defensively instead.
    pub fn update(&mut self, update: &BoxUpdate) -> Result<(), EngineError> {
        let Some(max_thickness) = self.max_thickness else {
            return Ok(());
        };
        let Some(opening_range) = update.opening_range else {
            return Ok(());
        };

        if self.open_box.is_some() {
            return self.update_open_box(update, max_thickness, opening_range);
        }

        let Some(found) = self.discover(update, max_thickness, opening_range) else {
            return Ok(());
        };

        if let Some(last_closed) = self.closed_boxes.last() {
            if !overlap_allowed(last_closed, &found, self.config.max_overlap_threshold) {
                debug!(
                    engine = %self.name,
                    start = %found.start_moment,
                    "discovery rejected: overlaps previous box"
                );
                return Ok(());
            }
        }

        debug!(
            engine = %self.name,
            start = %found.start_moment,
            end = %found.end_moment,
            high = found.high,
            low = found.low,
            "box opened"
        );
        self.open_box = Some(found);
        Ok(())
    }

    fn update_open_box(
        &mut self,
        update: &BoxUpdate,
        max_thickness: f64,
        opening_range: OpeningRange,
    ) -> Result<(), EngineError> {
        let open = self.open_box.as_mut().expect("open box present");
        let mut needs_close = false;

        if candle_inside_opening_range(
            &update.candle,
            self.config.use_closing_values,
            opening_range,
        ) && !self.config.allow_in_opening_range
        {
            needs_close = true;
        } else {
            let expected_next = open.end_moment + Duration::minutes(1);
            if update.moment != expected_next {
                if update.moment <= open.end_moment {
                    // Already processed or behind; skip
                    return Ok(());
                }
                // Preserved escape hatch: a replay/live gap closes the box
                // defensively rather than crashing mid-update.
                warn!(
                    engine = %self.name,
                    got = %update.moment,
                    expected = %expected_next,
                    "unexpected minute gap; closing box defensively"
                );
                needs_close = true;
            } else {
                let mut window: Vec<Candle> = Vec::new();
                let mut creation_index: Option<usize> = None;
                let total = minutes_between(open.start_moment, update.moment);
                for i in 0..=total {
                    let iter_moment = open.start_moment + Duration::minutes(i);
                    match update.candles.get(&iter_moment) {
                        Some(candle) => window.push(*candle),
                        None => {
                            warn!(
                                engine = %self.name,
                                moment = %iter_moment,
                                "missing candle during box update; closing box"
                            );
                            needs_close = true;
                            break;
                        }
                    }
                    if iter_moment == open.creation_moment {
                        debug_assert!(creation_index.is_none());
                        creation_index = Some(i as usize);
                    }
                }

                if !needs_close {
                    match qualifies_as_box(
                        &window,
                        self.config.min_minutes,
                        max_thickness,
                        self.config.tolerance_coefficient,
                        self.config.use_closing_values,
                        creation_index,
                    ) {
                        Some((high, low)) => {
                            open.high = high;
                            open.low = low;
                            open.end_moment = update.moment;
                        }
                        None => needs_close = true,
                    }
                }
            }
        }

        if needs_close {
            self.close_open_box(update, opening_range, update.at_market_close, true)?;
        }
        Ok(())
    }

    /// Close the open box, if any: classify its breakout, relate it to the
    /// opening range, attribute recent closing extremes, and move it into the
    /// closed history.
    pub fn close_open_box(
        &mut self,
        update: &BoxUpdate,
        opening_range: OpeningRange,
        at_market_close: bool,
        run_fallback: bool,
    ) -> Result<(), EngineError> {
        let Some(mut closing) = self.open_box.take() else {
            return Ok(());
        };

        set_breaking_type(
            &mut closing,
            opening_range,
            &update.candle,
            at_market_close,
            self.config.use_closing_values,
            update.candles,
        )?;

        self.set_extremes_before_close(&mut closing, update);

        if run_fallback {
            apply_one_sided_fallback(&mut closing, update.candles);
        }

        debug!(
            engine = %self.name,
            start = %closing.start_moment,
            end = %closing.end_moment,
            breakout = ?closing.breakout,
            relation = ?closing.range_relation,
            "box closed"
        );
        self.closed_boxes.push(closing);
        Ok(())
    }

    fn set_extremes_before_close(&self, closing: &mut ConsolidationBox, update: &BoxUpdate) {
        for i in 0..=self.config.hod_lod_before_close_minutes {
            let this_moment = update.moment - Duration::minutes(i);
            if !closing.had_hod_before_close {
                closing.had_hod_before_close = update.closing_hod.contains(&this_moment);
            }
            if !closing.had_lod_before_close {
                closing.had_lod_before_close = update.closing_lod.contains(&this_moment);
            }
        }
    }

    /// Backward scan from the current minute toward the end of the opening
    /// range, growing the candidate window one minute at a time and keeping
    /// the last window that still qualifies.
    fn discover(
        &self,
        update: &BoxUpdate,
        max_thickness: f64,
        opening_range: OpeningRange,
    ) -> Option<ConsolidationBox> {
        let minutes_since_range_end = minutes_between(update.opening_range_end, update.moment);
        if minutes_since_range_end < self.config.min_minutes {
            return None;
        }

        let end_moment = update.moment;
        let mut candidate: Option<ConsolidationBox> = None;
        let mut window: Vec<Candle> = Vec::new();

        for i in 0..minutes_since_range_end {
            let key_moment = update.moment - Duration::minutes(i);
            let Some(candle) = update.candles.get(&key_moment) else {
                // Data gap: the scan cannot extend past a missing minute
                warn!(
                    engine = %self.name,
                    moment = %key_moment,
                    "missing candle during discovery scan; stopping"
                );
                break;
            };

            window.insert(0, *candle);

            if candle_inside_opening_range(candle, self.config.use_closing_values, opening_range)
                && !self.config.allow_in_opening_range
            {
                break;
            }

            match qualifies_as_box(
                &window,
                self.config.min_minutes,
                max_thickness,
                self.config.tolerance_coefficient,
                self.config.use_closing_values,
                None,
            ) {
                Some((high, low)) => {
                    candidate = Some(ConsolidationBox {
                        id: Uuid::new_v4(),
                        start_moment: key_moment,
                        end_moment,
                        creation_moment: end_moment,
                        high,
                        low,
                        breakout: None,
                        range_relation: None,
                        had_hod_after_close: false,
                        had_lod_after_close: false,
                        had_hod_before_close: false,
                        had_lod_before_close: false,
                        broke_from_top_band: false,
                        broke_from_bottom_band: false,
                    });
                }
                None => {
                    if candidate.is_some() {
                        return candidate;
                    }
                }
            }
        }

        candidate
    }
}

/// Qualification rule: the running thickness `(high - low) / low` of the
/// growing window must stay below the max-thickness threshold, which itself
/// ramps up by `tolerance_coefficient * max_thickness` for every minute at or
/// past the creation index. Returns the window's running extremes on success.
pub fn qualifies_as_box(
    candles: &[Candle],
    min_minutes: i64,
    max_thickness: f64,
    tolerance_coefficient: f64,
    use_closing_values: bool,
    creation_index: Option<usize>,
) -> Option<(f64, f64)> {
    if (candles.len() as i64) < min_minutes {
        return None;
    }

    let mut current_max_thickness = max_thickness;
    let mut highest: Option<f64> = None;
    let mut lowest: Option<f64> = None;

    for (index, candle) in candles.iter().enumerate() {
        if let Some(creation) = creation_index {
            if index >= creation {
                current_max_thickness += tolerance_coefficient * max_thickness;
            }
        }

        let high_value = if use_closing_values { candle.close } else { candle.high };
        let low_value = if use_closing_values { candle.close } else { candle.low };

        if highest.map_or(true, |h| high_value > h) {
            highest = Some(high_value);
        }
        if lowest.map_or(true, |l| low_value < l) {
            lowest = Some(low_value);
        }

        let (high, low) = (highest.unwrap_or(high_value), lowest.unwrap_or(low_value));
        if (high - low) / low >= current_max_thickness {
            return None;
        }
    }

    Some((highest?, lowest?))
}

/// Overlap filter between the previous closed box and a new discovery:
/// the new box is rejected unless the overlapped share of the previous box's
/// duration stays at or below the threshold AND the share of the new box that
/// lies beyond the previous one exceeds the threshold.
pub fn overlap_allowed(
    previous: &ConsolidationBox,
    new: &ConsolidationBox,
    threshold: f64,
) -> bool {
    debug_assert!(previous.start_moment < new.start_moment);
    debug_assert!(previous.end_moment < new.end_moment);

    if previous.end_moment < new.start_moment {
        return true;
    }

    let previous_minutes = minutes_between(previous.start_moment, previous.end_moment) as f64;
    let overlapped_minutes = minutes_between(new.start_moment, previous.end_moment) as f64;
    let too_much_of_previous_covered = overlapped_minutes / previous_minutes > threshold;

    let new_minutes = minutes_between(new.start_moment, new.end_moment) as f64;
    let uncovered_minutes = minutes_between(previous.end_moment, new.end_moment) as f64;
    let new_sufficiently_uncovered = uncovered_minutes / new_minutes > threshold;

    !too_much_of_previous_covered && new_sufficiently_uncovered
}

/// Does this candle's relevant price touch the opening-range band?
pub fn candle_inside_opening_range(
    candle: &Candle,
    use_closing_values: bool,
    range: OpeningRange,
) -> bool {
    if use_closing_values {
        return candle.close >= range.low && candle.close <= range.high;
    }
    if candle.high >= range.low && candle.high <= range.high {
        return true;
    }
    if candle.low >= range.low && candle.low <= range.high {
        return true;
    }
    // Candle engulfs the whole band
    candle.high >= range.high && candle.low <= range.low
}

/// Breakout classification, run once at close. Idempotent for fixed inputs.
pub fn set_breaking_type(
    cons_box: &mut ConsolidationBox,
    opening_range: OpeningRange,
    breakout_candle: &Candle,
    at_market_close: bool,
    use_closing_values: bool,
    candles: &DayCandles,
) -> Result<(), EngineError> {
    if at_market_close {
        cons_box.breakout = Some(BoxBreakout::MarketClose);
    } else {
        let midpoint = cons_box.midpoint();
        let box_range = cons_box.height();
        let top_band = cons_box.low + (3.0 / 5.0) * box_range;
        let bottom_band = cons_box.low + (2.0 / 5.0) * box_range;

        let moments: Vec<NaiveDateTime> = cons_box.lifetime_moments().collect();
        let (mut above, mut below) = (0usize, 0usize);
        for moment in &moments {
            if let Some(candle) = candles.get(moment) {
                if candle.close > midpoint {
                    above += 1;
                } else if candle.close < midpoint {
                    below += 1;
                }
            }
        }
        let total = above + below;
        let proportion_above = if total > 0 { above as f64 / total as f64 } else { 0.0 };
        let proportion_below = if total > 0 { below as f64 / total as f64 } else { 0.0 };

        let breakout_value = if use_closing_values {
            breakout_candle.close
        } else {
            breakout_candle.low
        };
        let broke_up = breakout_value >= cons_box.high;
        let broke_down = breakout_value <= cons_box.low;

        // Final third of the box's lifetime, with a quarter-range tolerance
        let last_n = (moments.len() / 3).max(1);
        let compression_moments = &moments[moments.len() - last_n..];
        let tolerance = box_range * 0.25;

        let all_in_bottom_band = compression_moments.iter().all(|m| {
            candles.get(m).map_or(false, |c| {
                c.high <= bottom_band + tolerance && c.low >= cons_box.low - tolerance
            })
        });
        let all_in_top_band = compression_moments.iter().all(|m| {
            candles.get(m).map_or(false, |c| {
                c.low >= top_band - tolerance && c.high <= cons_box.high + tolerance
            })
        });

        // Final four minutes against the 65% / 35% bands
        let last_minutes: Vec<NaiveDateTime> = (1..=4)
            .rev()
            .map(|i| cons_box.end_moment - Duration::minutes(i))
            .collect();
        let lowest_low = last_minutes
            .iter()
            .filter_map(|m| candles.get(m).map(|c| c.low))
            .fold(None::<f64>, |acc, v| Some(acc.map_or(v, |a| a.min(v))));
        let highest_high = last_minutes
            .iter()
            .filter_map(|m| candles.get(m).map(|c| c.high))
            .fold(None::<f64>, |acc, v| Some(acc.map_or(v, |a| a.max(v))));

        let top_25_threshold = cons_box.low + 0.65 * box_range;
        let compressed_in_top = lowest_low.map_or(false, |l| l >= top_25_threshold);
        let bottom_25_threshold = cons_box.low + 0.35 * box_range;
        let compressed_in_bottom = highest_high.map_or(false, |h| h <= bottom_25_threshold);

        cons_box.broke_from_top_band = compressed_in_top;
        cons_box.broke_from_bottom_band = compressed_in_bottom;

        cons_box.breakout = if broke_up && breakout_value > cons_box.low {
            if proportion_above >= 0.5 || all_in_top_band || compressed_in_top {
                Some(BoxBreakout::Up)
            } else {
                None
            }
        } else if broke_down && breakout_value < cons_box.high {
            if proportion_below >= 0.7 || all_in_bottom_band || compressed_in_bottom {
                Some(BoxBreakout::Down)
            } else {
                None
            }
        } else {
            None
        };
    }

    cons_box.range_relation = Some(classify_range_relation(cons_box, opening_range)?);
    Ok(())
}

/// Four-way interval relation of a box to the opening range. A box matching
/// none of the four relations is a modeling fault, not a data problem.
fn classify_range_relation(
    cons_box: &ConsolidationBox,
    range: OpeningRange,
) -> Result<RangeRelation, EngineError> {
    if cons_box.low >= range.low && cons_box.high <= range.high {
        Ok(RangeRelation::Inside)
    } else if cons_box.high >= range.high && cons_box.low <= range.low {
        Ok(RangeRelation::Across)
    } else if cons_box.low <= range.low {
        Ok(RangeRelation::Below)
    } else if cons_box.high >= range.high {
        Ok(RangeRelation::Above)
    } else {
        Err(EngineError::InvariantViolation(format!(
            "box [{}, {}] matches no relation to opening range [{}, {}]",
            cons_box.low, cons_box.high, range.low, range.high
        )))
    }
}

/// Fallback pass: if at least 99% of the box's lifetime closes sit on one
/// side of the midpoint, force the classification to that side.
fn apply_one_sided_fallback(cons_box: &mut ConsolidationBox, candles: &DayCandles) {
    let midpoint = cons_box.midpoint();
    let (mut above, mut below) = (0usize, 0usize);
    for moment in cons_box.lifetime_moments() {
        if let Some(candle) = candles.get(&moment) {
            if candle.close > midpoint {
                above += 1;
            } else if candle.close < midpoint {
                below += 1;
            }
        }
    }
    let total = above + below;
    if total == 0 {
        return;
    }
    if above as f64 / total as f64 >= 0.99 {
        cons_box.breakout = Some(BoxBreakout::Up);
    } else if below as f64 / total as f64 >= 0.99 {
        cons_box.breakout = Some(BoxBreakout::Down);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn minute(m: i64) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 4)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap()
            + Duration::minutes(m)
    }

    fn flat_candles(count: i64, price: f64, start_minute: i64) -> Vec<Candle> {
        (0..count)
            .map(|i| Candle::flat(price, minute(start_minute + i)))
            .collect()
    }

    fn make_box(start: i64, end: i64, low: f64, high: f64) -> ConsolidationBox {
        ConsolidationBox {
            id: Uuid::new_v4(),
            start_moment: minute(start),
            end_moment: minute(end),
            creation_moment: minute(end),
            high,
            low,
            breakout: None,
            range_relation: None,
            had_hod_after_close: false,
            had_lod_after_close: false,
            had_hod_before_close: false,
            had_lod_before_close: false,
            broke_from_top_band: false,
            broke_from_bottom_band: false,
        }
    }

    #[test]
    fn test_qualification_respects_min_width() {
        let candles = flat_candles(44, 100.0, 0);
        assert!(qualifies_as_box(&candles, 45, 0.01, 0.0, false, None).is_none());
        let candles = flat_candles(45, 100.0, 0);
        assert!(qualifies_as_box(&candles, 45, 0.01, 0.0, false, None).is_some());
    }

    #[test]
    fn test_qualification_rejects_thick_window() {
        let mut candles = flat_candles(45, 100.0, 0);
        // One candle spikes thickness to 2% against a 1% threshold
        candles[20].high = 102.0;
        assert!(qualifies_as_box(&candles, 45, 0.01, 0.0, false, None).is_none());
    }

    #[test]
    fn test_tolerance_ramp_admits_slow_widening() {
        let mut candles = flat_candles(50, 100.0, 0);
        // Thickness 1.2% appears late, past the creation index
        for candle in candles.iter_mut().skip(45) {
            candle.high = 101.2;
        }
        // Without the ramp this fails at 1% max thickness
        assert!(qualifies_as_box(&candles, 45, 0.01, 0.0, false, Some(40)).is_none());
        // Ramp of 5% of max thickness per minute: by index 45 the threshold
        // has grown past 1.2%
        assert!(qualifies_as_box(&candles, 45, 0.01, 0.05, false, Some(40)).is_some());
    }

    #[test]
    fn test_closing_values_mode_ignores_wicks() {
        let mut candles = flat_candles(45, 100.0, 0);
        candles[10].high = 105.0; // wild wick, flat close
        assert!(qualifies_as_box(&candles, 45, 0.01, 0.0, true, None).is_some());
        assert!(qualifies_as_box(&candles, 45, 0.01, 0.0, false, None).is_none());
    }

    #[test]
    fn test_overlap_filter() {
        let previous = make_box(0, 60, 99.0, 101.0);
        // Disjoint: always allowed
        assert!(overlap_allowed(&previous, &make_box(61, 120, 99.0, 101.0), 0.5));
        // Heavy overlap of the previous box: rejected
        assert!(!overlap_allowed(&previous, &make_box(10, 70, 99.0, 101.0), 0.5));
        // Mild overlap, new box mostly beyond the old one: allowed
        assert!(overlap_allowed(&previous, &make_box(50, 120, 99.0, 101.0), 0.5));
    }

    #[test]
    fn test_breakout_up_classification() {
        let mut candles = DayCandles::new();
        // 50 minutes mostly closing above the midpoint of [99.5, 100.5]
        for i in 0..50 {
            let close = if i % 5 == 0 { 99.8 } else { 100.3 };
            let candle = Candle {
                open: close,
                high: 100.5,
                low: 99.5,
                close,
                volume: 1.0,
                moment: minute(i),
            };
            candles.insert(candle.moment, candle);
        }
        let mut cons_box = make_box(0, 49, 99.5, 100.5);
        let breakout_candle = Candle::flat(100.8, minute(50));
        let range = OpeningRange { high: 99.0, low: 98.0 };

        set_breaking_type(&mut cons_box, range, &breakout_candle, false, true, &candles).unwrap();
        assert_eq!(cons_box.breakout, Some(BoxBreakout::Up));
        assert_eq!(cons_box.range_relation, Some(RangeRelation::Above));
    }

    #[test]
    fn test_breakout_classification_is_idempotent() {
        let mut candles = DayCandles::new();
        for i in 0..50 {
            let candle = Candle::flat(100.3, minute(i));
            candles.insert(candle.moment, candle);
        }
        let mut cons_box = make_box(0, 49, 99.5, 100.5);
        let breakout_candle = Candle::flat(100.8, minute(50));
        let range = OpeningRange { high: 99.0, low: 98.0 };

        set_breaking_type(&mut cons_box, range, &breakout_candle, false, true, &candles).unwrap();
        let first = cons_box.breakout;
        set_breaking_type(&mut cons_box, range, &breakout_candle, false, true, &candles).unwrap();
        assert_eq!(cons_box.breakout, first);
    }

    #[test]
    fn test_market_close_classification() {
        let candles = DayCandles::new();
        let mut cons_box = make_box(0, 49, 99.5, 100.5);
        let last_candle = Candle::flat(100.0, minute(50));
        let range = OpeningRange { high: 99.0, low: 98.0 };

        set_breaking_type(&mut cons_box, range, &last_candle, true, false, &candles).unwrap();
        assert_eq!(cons_box.breakout, Some(BoxBreakout::MarketClose));
    }

    #[test]
    fn test_one_sided_fallback_forces_direction() {
        let mut candles = DayCandles::new();
        for i in 0..50 {
            let candle = Candle::flat(100.4, minute(i)); // all above midpoint
            candles.insert(candle.moment, candle);
        }
        let mut cons_box = make_box(0, 49, 99.5, 100.5);
        cons_box.breakout = None;
        apply_one_sided_fallback(&mut cons_box, &candles);
        assert_eq!(cons_box.breakout, Some(BoxBreakout::Up));
    }

    #[test]
    fn test_range_relation_inside_and_across() {
        let range = OpeningRange { high: 101.0, low: 99.0 };
        let inside = make_box(0, 50, 99.5, 100.5);
        assert_eq!(
            classify_range_relation(&inside, range).unwrap(),
            RangeRelation::Inside
        );
        let across = make_box(0, 50, 98.0, 102.0);
        assert_eq!(
            classify_range_relation(&across, range).unwrap(),
            RangeRelation::Across
        );
    }

    #[test]
    fn test_candle_inside_opening_range() {
        let range = OpeningRange { high: 101.0, low: 99.0 };
        let inside = Candle::flat(100.0, minute(0));
        assert!(candle_inside_opening_range(&inside, false, range));

        let above = Candle::flat(102.0, minute(0));
        assert!(!candle_inside_opening_range(&above, false, range));

        // Engulfing candle counts as inside
        let mut engulfing = Candle::flat(100.0, minute(0));
        engulfing.high = 102.0;
        engulfing.low = 98.0;
        assert!(candle_inside_opening_range(&engulfing, false, range));

        // Closing-values mode only looks at the close
        assert!(!candle_inside_opening_range(&above, true, range));
    }

    #[test]
    fn test_mark_closing_extreme_respects_window() {
        let mut engine = BoxEngine::new("test", BoxEngineConfig::default());
        engine.closed_boxes.push(make_box(0, 50, 99.5, 100.5));

        // Within 5 minutes of the close: attributed
        engine.mark_closing_extreme(minute(54), true, false);
        assert!(engine.closed_boxes[0].had_hod_after_close);
        assert!(!engine.closed_boxes[0].had_lod_after_close);

        // Outside the window: not attributed
        let mut engine = BoxEngine::new("test", BoxEngineConfig::default());
        engine.closed_boxes.push(make_box(0, 50, 99.5, 100.5));
        engine.mark_closing_extreme(minute(60), false, true);
        assert!(!engine.closed_boxes[0].had_lod_after_close);
    }
}
