//! Trade Lifecycle State Machine
//!
//! Implements the entry/exit protocol:
//! 1. IDLE - waiting for the once-daily pre-signal (volatility composite
//!    plus a directional trigger)
//! 2. PRE_SIGNAL_ARMED - pre-signal recorded, scanning just-closed boxes
//!    for a confirmation that passes the filter battery
//! 3. TRADE_OPEN - position live; tunnel, exit area and opposite-box-break
//!    checks drive the exit
//!
//! Guard rejections are ordinary "don't trade" decisions, logged with their
//! reason; they are never errors.

use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::box_engine::{BoxBreakout, BoxEngine, ConsolidationBox};
use crate::config::LifecycleConfig;
use crate::error::EngineError;
use crate::exit_area::ExitAreaTracker;
use crate::opening_range::OpeningRange;
use crate::signals::{
    avoid_long_confirmation, avoid_short_confirmation, box_closed_beyond_range,
    hod_lod_balance_trigger, DailyFeatures, SignalBook, SignalVerdict, VolatilityInputs,
};
use crate::tunnel::ExitReason;
use crate::types::{minutes_between, Candle, DayCandles, Direction};

/// State of the trade lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    /// No pre-signal today, no trade
    Idle,
    /// Pre-signal recorded, waiting for a confirmation box
    PreSignalArmed,
    /// Position live
    TradeOpen,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Idle => write!(f, "IDLE"),
            LifecycleState::PreSignalArmed => write!(f, "PRE_SIGNAL_ARMED"),
            LifecycleState::TradeOpen => write!(f, "TRADE_OPEN"),
        }
    }
}

/// Per-minute entry decision
#[derive(Debug, Clone, PartialEq)]
pub enum TradeDecision {
    Buy { quantity: f64 },
    Sell { quantity: f64 },
    DontTrade,
}

impl TradeDecision {
    pub fn direction(&self) -> Option<Direction> {
        match self {
            TradeDecision::Buy { .. } => Some(Direction::Long),
            TradeDecision::Sell { .. } => Some(Direction::Short),
            TradeDecision::DontTrade => None,
        }
    }
}

/// Why an open trade is being closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeExitReason {
    MarketClosed,
    Tunnel(ExitReason),
    ExitArea,
    OppositeBoxBreak,
}

impl std::fmt::Display for TradeExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeExitReason::MarketClosed => write!(f, "market_closed"),
            TradeExitReason::Tunnel(reason) => write!(f, "tunnel:{reason}"),
            TradeExitReason::ExitArea => write!(f, "exit_area"),
            TradeExitReason::OppositeBoxBreak => write!(f, "opposite_box_break"),
        }
    }
}

/// The once-daily provisional directional trigger
#[derive(Debug, Clone, Copy)]
pub struct PreSignal {
    pub moment: NaiveDateTime,
    pub candle: Candle,
}

/// Everything the decider reads for one minute's entry decision
#[derive(Debug, Clone, Copy)]
pub struct DecisionInputs<'a> {
    pub moment: NaiveDateTime,
    pub candle: Candle,
    pub candles: &'a DayCandles,
    pub engines: &'a [BoxEngine],
    pub opening_range: Option<OpeningRange>,
    pub closing_hod_count: usize,
    pub closing_lod_count: usize,
    pub volatility: VolatilityInputs,
    pub features: DailyFeatures,
}

/// The trade lifecycle decider
#[derive(Debug)]
pub struct TradeDecider {
    config: LifecycleConfig,
    state: LifecycleState,
    signals: SignalBook,
    pre_signal: Option<PreSignal>,
    pre_signal_date: Option<NaiveDate>,
    confirmation_box: Option<ConsolidationBox>,
    open_direction: Option<Direction>,
    entry_moment: Option<NaiveDateTime>,
    trades_today: u32,
    // Entry/exit price anchors survive the daily reset on purpose
    last_long_entry_price: Option<f64>,
    last_short_entry_price: Option<f64>,
    last_exit_price: Option<f64>,
}

impl TradeDecider {
    pub fn new(config: LifecycleConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            config,
            state: LifecycleState::Idle,
            signals: SignalBook::new(),
            pre_signal: None,
            pre_signal_date: None,
            confirmation_box: None,
            open_direction: None,
            entry_moment: None,
            trades_today: 0,
            last_long_entry_price: None,
            last_short_entry_price: None,
            last_exit_price: None,
        })
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn pre_signal(&self) -> Option<&PreSignal> {
        self.pre_signal.as_ref()
    }

    pub fn confirmation_box(&self) -> Option<&ConsolidationBox> {
        self.confirmation_box.as_ref()
    }

    pub fn open_direction(&self) -> Option<Direction> {
        self.open_direction
    }

    pub fn entry_moment(&self) -> Option<NaiveDateTime> {
        self.entry_moment
    }

    pub fn last_exit_price(&self) -> Option<f64> {
        self.last_exit_price
    }

    pub fn trades_today(&self) -> u32 {
        self.trades_today
    }

    /// Reset per-day state at session open. Last entry/exit price anchors
    /// persist across days.
    pub fn reset_daily_state(&mut self) {
        self.state = LifecycleState::Idle;
        self.pre_signal = None;
        self.pre_signal_date = None;
        self.confirmation_box = None;
        self.open_direction = None;
        self.entry_moment = None;
        self.trades_today = 0;
        self.signals.clear();
    }

    /// Per-minute entry decision. Must not be called while a trade is open.
    pub fn decide(&mut self, inputs: &DecisionInputs) -> TradeDecision {
        debug_assert!(self.state != LifecycleState::TradeOpen);

        if inputs.moment.time() >= self.config.entry_cutoff {
            return TradeDecision::DontTrade;
        }
        if self.trades_today >= self.config.trades_per_day {
            debug!(trades = self.trades_today, "entry refused: daily trade limit reached");
            return TradeDecision::DontTrade;
        }

        let balance_verdict = self.signals.observe(
            "hod_lod_balance",
            hod_lod_balance_trigger(
                inputs.closing_hod_count,
                inputs.closing_lod_count,
                inputs.moment,
                inputs.candle.close,
                self.config.hod_lod_balance_cutoff,
                self.config.hod_lod_balance_threshold,
                inputs.opening_range,
                self.config.opening_range_distance_fraction,
            ),
        );
        let box_high_verdict = self.signals.observe(
            "box_closed_above_range",
            box_closed_beyond_range(inputs.engines, inputs.moment, Direction::Long),
        );
        let box_low_verdict = self.signals.observe(
            "box_closed_below_range",
            box_closed_beyond_range(inputs.engines, inputs.moment, Direction::Short),
        );

        let any_trigger = balance_verdict != SignalVerdict::Quiet
            || box_high_verdict == SignalVerdict::Buy
            || box_low_verdict == SignalVerdict::Sell;

        if inputs.volatility.is_high_volatility()
            && self.pre_signal_date != Some(inputs.moment.date())
            && any_trigger
        {
            self.arm_pre_signal(inputs.candle, inputs.moment);
            if self.config.require_confirmation {
                return TradeDecision::DontTrade;
            }
        }

        if self.pre_signal_date == Some(inputs.moment.date()) && self.config.require_confirmation {
            if let Some(decision) = self.scan_for_confirmation(inputs) {
                return decision;
            }
            return TradeDecision::DontTrade;
        }

        if !self.config.require_confirmation {
            return self.decide_without_confirmation(
                inputs,
                box_high_verdict == SignalVerdict::Buy,
                box_low_verdict == SignalVerdict::Sell,
            );
        }

        TradeDecision::DontTrade
    }

    /// Anchor price and tunnel distance for the trade being opened.
    /// Confirmation mode anchors on the box boundary plus a height-scaled
    /// offset; the direct path anchors on the close offset by a fraction of
    /// the opening-range height.
    pub fn tunnel_anchor(
        &self,
        candle: &Candle,
        opening_range: Option<OpeningRange>,
    ) -> Option<(f64, f64)> {
        let direction = self.open_direction?;

        if self.config.require_confirmation {
            let confirmation = self.confirmation_box.as_ref()?;
            let height = confirmation.height();
            let anchor = match direction {
                Direction::Long => {
                    confirmation.high + height * self.config.tunnel_distance_box_coeff
                }
                Direction::Short => {
                    confirmation.low - height * self.config.tunnel_distance_box_coeff
                }
            };
            return Some((anchor, height));
        }

        let range = opening_range?;
        let distance = range.height() * self.config.tunnel_distance_range_coeff;
        let anchor = match direction {
            Direction::Long => candle.close + distance,
            Direction::Short => candle.close - distance,
        };
        Some((anchor, distance))
    }

    /// Called by the orchestrator once the entry is effective
    pub fn note_entry(&mut self, direction: Direction, price: f64, moment: NaiveDateTime) {
        self.state = LifecycleState::TradeOpen;
        self.open_direction = Some(direction);
        self.entry_moment = Some(moment);
        self.trades_today += 1;
        info!(%direction, price, %moment, trades_today = self.trades_today, "trade opened");
    }

    /// Called by the orchestrator when the position is closed. Falls back to
    /// PRE_SIGNAL_ARMED when today's pre-signal is still usable.
    pub fn note_exit(&mut self, price: f64, moment: NaiveDateTime, reason: TradeExitReason) {
        info!(price, %moment, %reason, "trade closed");
        self.last_exit_price = Some(price);
        self.open_direction = None;
        self.entry_moment = None;
        self.confirmation_box = None;
        self.state = if self.pre_signal_date == Some(moment.date()) {
            LifecycleState::PreSignalArmed
        } else {
            LifecycleState::Idle
        };
    }

    /// Exit evaluation while a trade is open. The tunnel verdict is computed
    /// by the caller (the tunnel owns its own mutable counters).
    pub fn should_exit(
        &self,
        moment: NaiveDateTime,
        candle: &Candle,
        candles: &DayCandles,
        market_open: bool,
        tunnel_verdict: Option<ExitReason>,
        exit_area: &ExitAreaTracker,
        opposite_break_engines: &[BoxEngine],
    ) -> Option<TradeExitReason> {
        let direction = self.open_direction?;

        if !market_open {
            return Some(TradeExitReason::MarketClosed);
        }

        if let Some(reason) = tunnel_verdict {
            return Some(TradeExitReason::Tunnel(reason));
        }

        let area_fires = exit_area.consecutive_closes_inside()
            >= self.config.exit_area_min_consecutive_closes
            && exit_area.close_is_inside(candle)
            && (!self.config.exit_area_require_worst_close
                || exit_area.is_worst_close_in_window(
                    moment,
                    self.config.exit_area_min_consecutive_closes as i64,
                    candles,
                ));
        if area_fires {
            return Some(TradeExitReason::ExitArea);
        }

        let entry_moment = self.entry_moment?;
        if minutes_between(entry_moment, moment) >= self.config.opposite_break_min_minutes_after_entry
            && self.opposite_box_break(moment, direction, entry_moment, candles, opposite_break_engines)
        {
            return Some(TradeExitReason::OppositeBoxBreak);
        }

        None
    }

    fn arm_pre_signal(&mut self, candle: Candle, moment: NaiveDateTime) {
        if self.pre_signal_date != Some(moment.date()) {
            self.pre_signal = Some(PreSignal { moment, candle });
            self.pre_signal_date = Some(moment.date());
            info!(%moment, close = candle.close, "pre-signal armed");
        }
        self.state = LifecycleState::PreSignalArmed;
    }

    /// The confirmation filter battery over boxes that closed exactly in the
    /// prior minute, across all engine variants. First qualifying box wins.
    fn scan_for_confirmation(&mut self, inputs: &DecisionInputs) -> Option<TradeDecision> {
        let pre_signal = self.pre_signal?;
        let previous_minute = inputs.moment - Duration::minutes(1);

        let avoid_long = !self.config.ignore_avoid_conditions_when_confirming
            && avoid_long_confirmation(&inputs.features);
        let avoid_short = !self.config.ignore_avoid_conditions_when_confirming
            && avoid_short_confirmation(&inputs.features);

        for engine in inputs.engines {
            for cons_box in engine.closed_boxes() {
                if cons_box.end_moment != previous_minute {
                    continue;
                }

                let Some(breakout_close) =
                    inputs.candles.get(&cons_box.end_moment).map(|c| c.close)
                else {
                    warn!(moment = %cons_box.end_moment, "missing breakout candle; skipping box");
                    continue;
                };

                if self.too_far_from(breakout_close, pre_signal.candle.close,
                    self.config.max_percent_from_pre_signal, "pre-signal close")
                {
                    continue;
                }
                if let Some(last_exit) = self.last_exit_price {
                    if self.too_far_from(breakout_close, last_exit,
                        self.config.max_percent_from_last_exit, "last exit price")
                    {
                        continue;
                    }
                }

                let earliest_allowed_start = pre_signal.moment
                    - Duration::minutes(self.config.confirmation_overlap_minutes);
                if cons_box.start_moment < earliest_allowed_start {
                    continue;
                }

                if !recent_closes_agree_with_breakout(cons_box, inputs.candles) {
                    debug!(end = %cons_box.end_moment, "confirmation rejected: 3-minute average against midpoint");
                    continue;
                }
                if !lifetime_closes_agree_with_breakout(cons_box, inputs.candles) {
                    debug!(end = %cons_box.end_moment, "confirmation rejected: midpoint majority against breakout");
                    continue;
                }

                let height = cons_box.height();
                let far_enough_long = inputs.candle.close
                    >= pre_signal.candle.close
                        + height * self.config.confirmation_distance_coeff_long;
                let far_enough_short = inputs.candle.close
                    <= pre_signal.candle.close
                        - height * self.config.confirmation_distance_coeff_short;

                match cons_box.breakout {
                    Some(BoxBreakout::Down) if !avoid_short && far_enough_short => {
                        if let Some(last_short) = self.last_short_entry_price {
                            let relative = (inputs.candle.close - last_short).abs() / last_short;
                            if relative <= 0.001 || inputs.candle.close > last_short {
                                debug!(
                                    close = inputs.candle.close,
                                    last_short, "short entry blocked by re-entry guard"
                                );
                                return Some(TradeDecision::DontTrade);
                            }
                        }
                        self.confirmation_box = Some(cons_box.clone());
                        self.last_short_entry_price = Some(inputs.candle.close);
                        return Some(TradeDecision::Sell {
                            quantity: self.config.order_quantity,
                        });
                    }
                    Some(BoxBreakout::Up) if !avoid_long && far_enough_long => {
                        if let Some(last_long) = self.last_long_entry_price {
                            let relative = (inputs.candle.close - last_long).abs() / last_long;
                            if relative <= 0.001 {
                                debug!(
                                    close = inputs.candle.close,
                                    last_long, "long entry blocked by re-entry guard"
                                );
                                return Some(TradeDecision::DontTrade);
                            }
                        }
                        self.confirmation_box = Some(cons_box.clone());
                        self.last_long_entry_price = Some(inputs.candle.close);
                        return Some(TradeDecision::Buy {
                            quantity: self.config.order_quantity,
                        });
                    }
                    _ => {}
                }
            }
        }
        None
    }

    /// Direct entry path when confirmation is disabled: the box-beyond-range
    /// trigger enters immediately, subject to the avoid conditions.
    fn decide_without_confirmation(
        &mut self,
        inputs: &DecisionInputs,
        box_high: bool,
        box_low: bool,
    ) -> TradeDecision {
        if !inputs.volatility.is_high_volatility() && !(box_high || box_low) {
            return TradeDecision::DontTrade;
        }

        if let Some(last_exit) = self.last_exit_price {
            let distance = (inputs.candle.close - last_exit).abs() / last_exit * 100.0;
            if distance > self.config.max_percent_from_last_exit {
                debug!(distance, "entry refused: too far from last exit");
                return TradeDecision::DontTrade;
            }
        }

        if box_high && !avoid_long_confirmation(&inputs.features) {
            self.last_long_entry_price = Some(inputs.candle.close);
            return TradeDecision::Buy {
                quantity: self.config.order_quantity,
            };
        }
        if box_low && !avoid_short_confirmation(&inputs.features) {
            self.last_short_entry_price = Some(inputs.candle.close);
            return TradeDecision::Sell {
                quantity: self.config.order_quantity,
            };
        }
        TradeDecision::DontTrade
    }

    fn too_far_from(&self, price: f64, reference: f64, max_percent: f64, what: &str) -> bool {
        let distance = (price - reference).abs() / reference * 100.0;
        if distance > max_percent {
            debug!(distance, max_percent, what, "confirmation rejected: reference distance");
            true
        } else {
            false
        }
    }

    /// A later box broken against the trade's direction, with enough
    /// consecutive closes past its boundary inside the post-break window.
    fn opposite_box_break(
        &self,
        moment: NaiveDateTime,
        direction: Direction,
        entry_moment: NaiveDateTime,
        candles: &DayCandles,
        engines: &[BoxEngine],
    ) -> bool {
        let wanted = match direction {
            Direction::Long => BoxBreakout::Down,
            Direction::Short => BoxBreakout::Up,
        };

        for engine in engines {
            for cons_box in engine.closed_boxes() {
                if cons_box.breakout != Some(wanted) {
                    continue;
                }
                if cons_box.end_moment > moment || cons_box.end_moment <= entry_moment {
                    continue;
                }

                let height = cons_box.height();
                let threshold = match direction {
                    Direction::Long => {
                        cons_box.low - self.config.opposite_break_threshold_fraction * height
                    }
                    Direction::Short => {
                        cons_box.high + self.config.opposite_break_threshold_fraction * height
                    }
                };

                let window_end =
                    cons_box.end_moment + Duration::minutes(self.config.opposite_break_window_minutes);
                let mut scan = cons_box.end_moment + Duration::minutes(1);
                let mut consecutive = 0u32;

                while scan <= moment && scan <= window_end {
                    if let Some(candle) = candles.get(&scan) {
                        let confirming = match direction {
                            Direction::Long => candle.close < threshold,
                            Direction::Short => candle.close > threshold,
                        };
                        if confirming {
                            consecutive += 1;
                            if consecutive >= self.config.opposite_break_min_consecutive_closes {
                                return true;
                            }
                        } else {
                            consecutive = 0;
                        }
                    }
                    scan += Duration::minutes(1);
                }
            }
        }
        false
    }
}

/// 3-minute average-close sanity filter: the closes just before the breakout
/// must not sit on the wrong side of the box midpoint (with 5% slack).
fn recent_closes_agree_with_breakout(cons_box: &ConsolidationBox, candles: &DayCandles) -> bool {
    let start = cons_box.end_moment - Duration::minutes(3);
    let closes: Vec<f64> = (0..3)
        .filter_map(|i| candles.get(&(start + Duration::minutes(i))).map(|c| c.close))
        .collect();
    if closes.is_empty() {
        return true;
    }
    let average = closes.iter().sum::<f64>() / closes.len() as f64;
    let midpoint = cons_box.midpoint();

    match cons_box.breakout {
        Some(BoxBreakout::Up) => average > midpoint * 0.95,
        Some(BoxBreakout::Down) => average < midpoint * 1.05,
        _ => true,
    }
}

/// Full-lifetime midpoint-majority filter: at least a tenth of the box's
/// closes must sit on the breakout side of the midpoint.
fn lifetime_closes_agree_with_breakout(cons_box: &ConsolidationBox, candles: &DayCandles) -> bool {
    let midpoint = cons_box.midpoint();
    let mut total = 0usize;
    let mut above = 0usize;
    let mut below = 0usize;

    for moment in cons_box.lifetime_moments() {
        let Some(candle) = candles.get(&moment) else {
            continue;
        };
        total += 1;
        if candle.close > midpoint {
            above += 1;
        } else if candle.close < midpoint {
            below += 1;
        }
    }

    match cons_box.breakout {
        Some(BoxBreakout::Up) => (above as f64) >= total as f64 / 10.0,
        Some(BoxBreakout::Down) => (below as f64) >= total as f64 / 10.0,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BoxEngineConfig;
    use crate::opening_range::OpeningRange;
    use chrono::NaiveDate;
    use uuid::Uuid;

    fn minute(m: i64) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 4)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap()
            + Duration::minutes(m)
    }

    fn high_volatility() -> VolatilityInputs {
        VolatilityInputs {
            overnight_gap_volatile: true,
            ..VolatilityInputs::default()
        }
    }

    fn closed_box(start: i64, end: i64, low: f64, high: f64, breakout: BoxBreakout) -> ConsolidationBox {
        ConsolidationBox {
            id: Uuid::new_v4(),
            start_moment: minute(start),
            end_moment: minute(end),
            creation_moment: minute(end),
            high,
            low,
            breakout: Some(breakout),
            range_relation: None,
            had_hod_after_close: false,
            had_lod_after_close: false,
            had_hod_before_close: false,
            had_lod_before_close: false,
            broke_from_top_band: false,
            broke_from_bottom_band: false,
        }
    }

    fn flat_closes(from: i64, to: i64, close: f64) -> DayCandles {
        let mut candles = DayCandles::new();
        for m in from..=to {
            let candle = Candle::flat(close, minute(m));
            candles.insert(candle.moment, candle);
        }
        candles
    }

    fn inputs<'a>(
        m: i64,
        close: f64,
        candles: &'a DayCandles,
        engines: &'a [BoxEngine],
        hod: usize,
        lod: usize,
    ) -> DecisionInputs<'a> {
        DecisionInputs {
            moment: minute(m),
            candle: Candle::flat(close, minute(m)),
            candles,
            engines,
            opening_range: Some(OpeningRange { high: 101.0, low: 99.0 }),
            closing_hod_count: hod,
            closing_lod_count: lod,
            volatility: high_volatility(),
            features: DailyFeatures::default(),
        }
    }

    #[test]
    fn test_pre_signal_arms_once_per_day() {
        let mut decider = TradeDecider::new(LifecycleConfig::default()).unwrap();
        let candles = DayCandles::new();
        let engines: Vec<BoxEngine> = Vec::new();

        // Balance +6, price far above the range: trigger fires
        let decision = decider.decide(&inputs(30, 102.0, &candles, &engines, 6, 0));
        assert_eq!(decision, TradeDecision::DontTrade);
        assert_eq!(decider.state(), LifecycleState::PreSignalArmed);
        let first_moment = decider.pre_signal().unwrap().moment;

        // Second trigger the same day keeps the original anchor
        decider.decide(&inputs(32, 102.5, &candles, &engines, 7, 0));
        assert_eq!(decider.pre_signal().unwrap().moment, first_moment);
    }

    #[test]
    fn test_no_pre_signal_without_volatility() {
        let mut decider = TradeDecider::new(LifecycleConfig::default()).unwrap();
        let candles = DayCandles::new();
        let engines: Vec<BoxEngine> = Vec::new();

        let mut quiet = inputs(30, 102.0, &candles, &engines, 6, 0);
        quiet.volatility = VolatilityInputs::default();
        decider.decide(&quiet);
        assert_eq!(decider.state(), LifecycleState::Idle);
    }

    /// Pre-signal prices in these scenarios sit beyond the opening range,
    /// further from the box close than the production 0.4% limit allows
    fn loose_distance_config() -> LifecycleConfig {
        LifecycleConfig {
            max_percent_from_pre_signal: 2.0,
            ..LifecycleConfig::default()
        }
    }

    #[test]
    fn test_confirmation_box_enters_long() {
        let mut decider = TradeDecider::new(loose_distance_config()).unwrap();
        // Lifetime closes at 100.4, above the [99.5, 100.5] midpoint
        let candles = flat_closes(30, 90, 100.4);
        let mut engine = BoxEngine::new("15min", BoxEngineConfig::default());
        engine.push_closed(closed_box(40, 90, 99.5, 100.5, BoxBreakout::Up));
        let engines = vec![engine];

        // Arm the pre-signal at minute 40 via the balance trigger
        decider.decide(&inputs(40, 102.0, &candles, &engines, 6, 0));
        assert_eq!(decider.state(), LifecycleState::PreSignalArmed);

        // The box closed at minute 90; minute 91 scans and confirms
        let decision = decider.decide(&inputs(91, 100.7, &candles, &engines, 6, 0));
        assert_eq!(decision, TradeDecision::Buy { quantity: 1.0 });
        assert!(decider.confirmation_box().is_some());

        decider.note_entry(Direction::Long, 100.7, minute(91));
        assert_eq!(decider.state(), LifecycleState::TradeOpen);
        assert_eq!(decider.trades_today(), 1);
    }

    #[test]
    fn test_confirmation_rejects_stale_box() {
        let mut decider = TradeDecider::new(loose_distance_config()).unwrap();
        let candles = flat_closes(10, 90, 100.4);
        let mut engine = BoxEngine::new("15min", BoxEngineConfig::default());
        // Box started 30 minutes before the pre-signal: outside the overlap tolerance
        engine.push_closed(closed_box(10, 90, 99.5, 100.5, BoxBreakout::Up));
        let engines = vec![engine];

        decider.decide(&inputs(40, 102.0, &candles, &engines, 6, 0));
        let decision = decider.decide(&inputs(91, 100.7, &candles, &engines, 6, 0));
        assert_eq!(decision, TradeDecision::DontTrade);
    }

    #[test]
    fn test_short_reentry_guard_blocks_worse_price() {
        let mut decider = TradeDecider::new(loose_distance_config()).unwrap();
        let candles = flat_closes(30, 90, 99.6);
        let mut engine = BoxEngine::new("15min", BoxEngineConfig::default());
        engine.push_closed(closed_box(40, 90, 99.5, 100.5, BoxBreakout::Down));
        let engines = vec![engine];

        decider.decide(&inputs(40, 98.4, &candles, &engines, 0, 6));
        // Simulate an earlier short at 99.0; new close above it is blocked
        decider.last_short_entry_price = Some(99.0);
        let decision = decider.decide(&inputs(91, 99.4, &candles, &engines, 0, 6));
        assert_eq!(decision, TradeDecision::DontTrade);
    }

    #[test]
    fn test_trade_count_guard() {
        let config = LifecycleConfig {
            trades_per_day: 1,
            ..LifecycleConfig::default()
        };
        let mut decider = TradeDecider::new(config).unwrap();
        decider.note_entry(Direction::Long, 100.0, minute(50));
        decider.note_exit(100.5, minute(60), TradeExitReason::ExitArea);

        let candles = DayCandles::new();
        let engines: Vec<BoxEngine> = Vec::new();
        let decision = decider.decide(&inputs(61, 102.0, &candles, &engines, 6, 0));
        assert_eq!(decision, TradeDecision::DontTrade);
    }

    #[test]
    fn test_entry_cutoff() {
        let mut decider = TradeDecider::new(LifecycleConfig::default()).unwrap();
        let candles = DayCandles::new();
        let engines: Vec<BoxEngine> = Vec::new();
        // 15:26 is minute 356 after a 9:30 open
        let decision = decider.decide(&inputs(356, 102.0, &candles, &engines, 6, 0));
        assert_eq!(decision, TradeDecision::DontTrade);
        assert_eq!(decider.state(), LifecycleState::Idle);
    }

    #[test]
    fn test_exit_on_market_close() {
        let mut decider = TradeDecider::new(LifecycleConfig::default()).unwrap();
        decider.note_entry(Direction::Long, 100.0, minute(50));

        let candles = DayCandles::new();
        let exit_area = ExitAreaTracker::new();
        let reason = decider.should_exit(
            minute(60),
            &Candle::flat(100.0, minute(60)),
            &candles,
            false,
            None,
            &exit_area,
            &[],
        );
        assert_eq!(reason, Some(TradeExitReason::MarketClosed));
    }

    #[test]
    fn test_exit_on_opposite_box_break() {
        let mut decider = TradeDecider::new(LifecycleConfig::default()).unwrap();
        decider.note_entry(Direction::Long, 100.0, minute(50));

        // Opposite box closed DOWN after entry; two closes below low - 0.3*height
        let mut engine = BoxEngine::new("15min", BoxEngineConfig::default());
        engine.push_closed(closed_box(55, 70, 99.5, 100.5, BoxBreakout::Down));
        let engines = vec![engine];

        let mut candles = DayCandles::new();
        for (m, close) in [(71, 99.1), (72, 99.1)] {
            let candle = Candle::flat(close, minute(m));
            candles.insert(candle.moment, candle);
        }

        let exit_area = ExitAreaTracker::new();
        let reason = decider.should_exit(
            minute(73),
            &Candle::flat(99.1, minute(73)),
            &candles,
            true,
            None,
            &exit_area,
            &engines,
        );
        assert_eq!(reason, Some(TradeExitReason::OppositeBoxBreak));
    }

    #[test]
    fn test_exit_area_requires_both_conditions() {
        let mut decider = TradeDecider::new(LifecycleConfig::default()).unwrap();
        decider.note_entry(Direction::Long, 100.0, minute(50));

        let mut exit_area = ExitAreaTracker::new();
        exit_area.arm(Direction::Long, 0.5);
        let session_end = minute(300);
        exit_area.record(&Candle::flat(100.0, minute(51)), session_end);
        exit_area.record(&Candle::flat(101.0, minute(52)), session_end); // boundary 100.5
        exit_area.record(&Candle::flat(100.3, minute(53)), session_end);
        exit_area.record(&Candle::flat(100.2, minute(54)), session_end);

        let candles = DayCandles::new();
        let inside = Candle::flat(100.2, minute(54));
        let reason = decider.should_exit(minute(54), &inside, &candles, true, None, &exit_area, &[]);
        assert_eq!(reason, Some(TradeExitReason::ExitArea));
    }

    #[test]
    fn test_note_exit_returns_to_armed_state_same_day() {
        let mut decider = TradeDecider::new(LifecycleConfig::default()).unwrap();
        let candles = DayCandles::new();
        let engines: Vec<BoxEngine> = Vec::new();
        decider.decide(&inputs(40, 102.0, &candles, &engines, 6, 0));

        decider.note_entry(Direction::Long, 100.0, minute(50));
        decider.note_exit(100.5, minute(70), TradeExitReason::ExitArea);
        assert_eq!(decider.state(), LifecycleState::PreSignalArmed);
        assert_eq!(decider.last_exit_price(), Some(100.5));

        decider.reset_daily_state();
        assert_eq!(decider.state(), LifecycleState::Idle);
        assert!(decider.pre_signal().is_none());
    }

    #[test]
    fn test_tunnel_anchor_from_confirmation_box() {
        let mut decider = TradeDecider::new(LifecycleConfig::default()).unwrap();
        decider.confirmation_box = Some(closed_box(40, 90, 99.5, 100.5, BoxBreakout::Up));
        decider.open_direction = Some(Direction::Long);

        let (anchor, distance) = decider
            .tunnel_anchor(&Candle::flat(100.7, minute(91)), None)
            .unwrap();
        // Box height 1.0; anchor = high + 0.4 * height
        assert!((anchor - 100.9).abs() < 1e-9);
        assert!((distance - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_tunnel_anchor_from_opening_range() {
        let config = LifecycleConfig {
            require_confirmation: false,
            ..LifecycleConfig::default()
        };
        let mut decider = TradeDecider::new(config).unwrap();
        decider.open_direction = Some(Direction::Short);

        let range = OpeningRange { high: 101.0, low: 99.0 };
        let (anchor, distance) = decider
            .tunnel_anchor(&Candle::flat(100.0, minute(20)), Some(range))
            .unwrap();
        // Distance = 0.4 * range height of 2.0
        assert!((distance - 0.8).abs() < 1e-9);
        assert!((anchor - 99.2).abs() < 1e-9);
    }
}
