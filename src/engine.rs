//! Per-minute orchestrator
//!
//! Owns every component and drives the strictly sequential minute pipeline:
//! session context -> opening-range trackers -> box engines -> tunnel ->
//! lifecycle decider. Exactly one candle is ingested and fully propagated
//! before the next one; all per-day state is reset before the first candle of
//! a new session touches any component.

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::box_engine::{BoxEngine, BoxUpdate};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::exit_area::ExitAreaTracker;
use crate::lifecycle::{DecisionInputs, TradeDecider, TradeDecision, TradeExitReason};
use crate::opening_range::{OpeningRange, OpeningRangeTracker};
use crate::session::SessionContext;
use crate::signals::{DailyFeatures, VolatilityInputs};
use crate::tunnel::TakeProfitTunnel;
use crate::types::{Candle, Direction};

/// A live position
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OpenTrade {
    pub id: Uuid,
    pub direction: Direction,
    pub entry_price: f64,
    pub entry_moment: NaiveDateTime,
    pub quantity: f64,
}

/// What this minute's processing produced for the caller
#[derive(Debug, Clone)]
pub enum MinuteAction {
    Entered(OpenTrade),
    Exited {
        trade: OpenTrade,
        price: f64,
        reason: TradeExitReason,
    },
    None,
}

/// The intraday signal engine
#[derive(Debug)]
pub struct IntradayEngine {
    config: EngineConfig,
    session: SessionContext,
    range_trackers: Vec<OpeningRangeTracker>,
    box_engines: Vec<BoxEngine>,
    decider: TradeDecider,
    exit_area: ExitAreaTracker,
    tunnel: Option<TakeProfitTunnel>,
    open_trade: Option<OpenTrade>,
}

impl IntradayEngine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;

        let range_trackers = config
            .opening_range_windows
            .iter()
            .map(|w| OpeningRangeTracker::new(*w))
            .collect();
        let box_engines = config
            .opening_range_windows
            .iter()
            .map(|w| BoxEngine::new(format!("box-{w}min"), config.box_engine.clone()))
            .collect();
        let decider = TradeDecider::new(config.lifecycle.clone())?;

        Ok(Self {
            config,
            session: SessionContext::new(),
            range_trackers,
            box_engines,
            decider,
            exit_area: ExitAreaTracker::new(),
            tunnel: None,
            open_trade: None,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn box_engines(&self) -> &[BoxEngine] {
        &self.box_engines
    }

    pub fn decider(&self) -> &TradeDecider {
        &self.decider
    }

    pub fn tunnel(&self) -> Option<&TakeProfitTunnel> {
        self.tunnel.as_ref()
    }

    pub fn open_trade(&self) -> Option<&OpenTrade> {
        self.open_trade.as_ref()
    }

    /// Ingest one minute candle and run the full pipeline.
    /// External daily volatility/gap features come from the caller; they are
    /// constant within a day.
    pub fn on_minute(
        &mut self,
        candle: Candle,
        volatility: VolatilityInputs,
        features: DailyFeatures,
    ) -> Result<MinuteAction, EngineError> {
        let moment = candle.moment;

        if self.session.is_new_session(moment) {
            self.reset_for_new_session(moment);
        }

        self.session.record(candle);
        self.refresh_max_thickness(moment);
        self.update_opening_ranges(candle);
        self.mark_closing_extremes(moment);
        self.update_box_engines(candle)?;

        if self.open_trade.is_some() {
            return Ok(self.manage_open_trade(candle));
        }
        self.try_enter(candle, volatility, features)
    }

    /// Final minute of the session for `moment`'s date
    fn last_session_moment(&self, moment: NaiveDateTime) -> NaiveDateTime {
        moment.date().and_time(self.config.session_close)
    }

    fn reset_for_new_session(&mut self, moment: NaiveDateTime) {
        if let Some(trade) = self.open_trade.take() {
            // Should have been force-closed at end of day; close it at its
            // entry price rather than carrying state across sessions.
            warn!(trade_id = %trade.id, "open trade survived the session; dropping at reset");
            self.decider
                .note_exit(trade.entry_price, moment, TradeExitReason::MarketClosed);
        }
        self.session.reset_for_new_session(moment);
        for engine in &mut self.box_engines {
            engine.erase_all();
        }
        self.decider.reset_daily_state();
        self.exit_area.disarm();
        self.tunnel = None;
        info!(date = %moment.date(), "session reset");
    }

    /// Once per day, scale each box engine's thickness threshold to the mean
    /// opening-range thickness of the trailing days for its window variant.
    fn refresh_max_thickness(&mut self, moment: NaiveDateTime) {
        let date = moment.date();
        for (tracker, engine) in self.range_trackers.iter().zip(self.box_engines.iter_mut()) {
            if !engine.needs_thickness_refresh(date) {
                continue;
            }
            if let Some(average) = tracker.average_thickness(self.config.thickness_average_days) {
                engine.set_max_thickness(date, average);
            }
        }
    }

    fn update_opening_ranges(&mut self, candle: Candle) {
        let (Some(open_moment), Some(first), Some(high), Some(low)) = (
            self.session.session_open_moment,
            self.session.first_candle,
            self.session.day_high,
            self.session.day_low,
        ) else {
            return;
        };
        for tracker in &mut self.range_trackers {
            tracker.update(
                candle.moment,
                open_moment,
                high,
                low,
                first.open,
                self.config.recenter_opening_range_on_open,
            );
        }
    }

    fn mark_closing_extremes(&mut self, moment: NaiveDateTime) {
        let is_hod = self.session.closing_hod_moments.last() == Some(&moment);
        let is_lod = self.session.closing_lod_moments.last() == Some(&moment);
        if !is_hod && !is_lod {
            return;
        }
        for engine in &mut self.box_engines {
            engine.mark_closing_extreme(moment, is_hod, is_lod);
        }
    }

    fn update_box_engines(&mut self, candle: Candle) -> Result<(), EngineError> {
        let moment = candle.moment;
        let Some(open_moment) = self.session.session_open_moment else {
            return Ok(());
        };
        let at_market_close = moment >= self.last_session_moment(moment);

        for (tracker, engine) in self.range_trackers.iter().zip(self.box_engines.iter_mut()) {
            let update = BoxUpdate {
                moment,
                candle,
                candles: &self.session.candles,
                opening_range: tracker.range_for(moment.date()),
                opening_range_end: open_moment + Duration::minutes(tracker.window_minutes),
                closing_hod: &self.session.closing_hod_moments,
                closing_lod: &self.session.closing_lod_moments,
                at_market_close,
            };
            engine.update(&update)?;

            // Last session minute: whatever still qualifies closes as a
            // MARKET_CLOSE box instead of leaking into the next day's reset
            if at_market_close {
                if let Some(range) = update.opening_range {
                    engine.close_open_box(&update, range, true, false)?;
                }
            }
        }
        Ok(())
    }

    /// First tracker that already has a range today; the pipeline consults
    /// the narrowest available variant for triggers and tunnel distances.
    fn current_opening_range(&self, moment: NaiveDateTime) -> Option<OpeningRange> {
        self.range_trackers
            .iter()
            .find_map(|t| t.range_for(moment.date()))
    }

    fn manage_open_trade(&mut self, candle: Candle) -> MinuteAction {
        let moment = candle.moment;
        let trade = self.open_trade.expect("trade present");

        let tunnel_verdict = self
            .tunnel
            .as_mut()
            .and_then(|tunnel| tunnel.should_exit(&candle, moment));

        self.exit_area.record(&candle, self.last_session_moment(moment));

        let market_open = moment.time() < self.config.forced_exit;

        // Opposite-box-break consults only the widest window variant
        let opposite_engines = &self.box_engines[self.box_engines.len() - 1..];
        let reason = self.decider.should_exit(
            moment,
            &candle,
            &self.session.candles,
            market_open,
            tunnel_verdict,
            &self.exit_area,
            opposite_engines,
        );

        let Some(reason) = reason else {
            return MinuteAction::None;
        };

        self.decider.note_exit(candle.close, moment, reason);
        self.exit_area.disarm();
        self.tunnel = None;
        self.open_trade = None;
        MinuteAction::Exited {
            trade,
            price: candle.close,
            reason,
        }
    }

    fn try_enter(
        &mut self,
        candle: Candle,
        volatility: VolatilityInputs,
        features: DailyFeatures,
    ) -> Result<MinuteAction, EngineError> {
        let moment = candle.moment;
        let opening_range = self.current_opening_range(moment);

        let decision = self.decider.decide(&DecisionInputs {
            moment,
            candle,
            candles: &self.session.candles,
            engines: &self.box_engines,
            opening_range,
            closing_hod_count: self.session.closing_hod_moments.len(),
            closing_lod_count: self.session.closing_lod_moments.len(),
            volatility,
            features,
        });

        let (direction, quantity) = match decision {
            TradeDecision::Buy { quantity } => (Direction::Long, quantity),
            TradeDecision::Sell { quantity } => (Direction::Short, quantity),
            TradeDecision::DontTrade => return Ok(MinuteAction::None),
        };

        self.decider.note_entry(direction, candle.close, moment);

        let Some((anchor, distance)) = self.decider.tunnel_anchor(&candle, opening_range) else {
            return Err(EngineError::InvariantViolation(
                "entry decision without a tunnel anchor source".to_string(),
            ));
        };

        self.tunnel = Some(TakeProfitTunnel::new(
            moment,
            anchor,
            candle.close,
            direction,
            distance,
            &self.config.tunnel,
        ));
        self.exit_area.arm(
            direction,
            distance * self.config.lifecycle.exit_area_stop_fraction,
        );

        let trade = OpenTrade {
            id: Uuid::new_v4(),
            direction,
            entry_price: candle.close,
            entry_moment: moment,
            quantity,
        };
        self.open_trade = Some(trade);
        Ok(MinuteAction::Entered(trade))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};

    fn minute(day: u32, m: i64) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, day)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap()
            + Duration::minutes(m)
    }

    fn candle(day: u32, m: i64, close: f64) -> Candle {
        Candle {
            open: close,
            high: close + 0.05,
            low: close - 0.05,
            close,
            volume: 10.0,
            moment: minute(day, m),
        }
    }

    fn quiet_day(engine: &mut IntradayEngine, day: u32, minutes: i64) {
        for m in 0..minutes {
            engine
                .on_minute(
                    candle(day, m, 100.0),
                    VolatilityInputs::default(),
                    DailyFeatures::default(),
                )
                .unwrap();
        }
    }

    #[test]
    fn test_session_reset_between_days() {
        let mut engine = IntradayEngine::new(EngineConfig::default()).unwrap();
        quiet_day(&mut engine, 4, 30);
        assert_eq!(engine.session().candles.len(), 30);

        engine
            .on_minute(
                candle(5, 0, 100.0),
                VolatilityInputs::default(),
                DailyFeatures::default(),
            )
            .unwrap();
        assert_eq!(engine.session().candles.len(), 1);
        assert_eq!(engine.session().date, Some(minute(5, 0).date()));
    }

    #[test]
    fn test_max_thickness_set_after_first_full_day() {
        let mut engine = IntradayEngine::new(EngineConfig::default()).unwrap();
        // Day one builds opening ranges; no thickness yet on its morning
        quiet_day(&mut engine, 4, 30);
        // Next morning the trailing average exists
        engine
            .on_minute(
                candle(5, 0, 100.0),
                VolatilityInputs::default(),
                DailyFeatures::default(),
            )
            .unwrap();
        assert!(engine.box_engines()[0].max_thickness().is_some());
    }

    #[test]
    fn test_opening_ranges_freeze_per_window() {
        let mut engine = IntradayEngine::new(EngineConfig::default()).unwrap();
        quiet_day(&mut engine, 4, 20);
        let date = minute(4, 0).date();
        // 5/10/15-minute variants all frozen by minute 20
        assert!(engine.range_trackers.iter().all(|t| t.range_for(date).is_some()));
    }

    #[test]
    fn test_open_box_closes_as_market_close_at_session_end() {
        use crate::box_engine::BoxBreakout;

        let mut engine = IntradayEngine::new(EngineConfig::default()).unwrap();
        // Day one: 2% oscillation so the next morning's thickness is roomy
        for m in 0..30 {
            let close = if m % 2 == 0 { 100.0 } else { 102.0 };
            engine
                .on_minute(
                    candle(4, m, close),
                    VolatilityInputs::default(),
                    DailyFeatures::default(),
                )
                .unwrap();
        }
        // Day two: climb out of the opening range, then shelf flat at 101.7
        // all the way through the 16:00 close without ever breaking out
        for m in 0..=390 {
            let close = if m <= 7 { 100.0 + 0.2 * m as f64 } else { 101.7 };
            engine
                .on_minute(
                    candle(5, m, close),
                    VolatilityInputs::default(),
                    DailyFeatures::default(),
                )
                .unwrap();
        }

        let boxes = engine.box_engines()[0].closed_boxes();
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].breakout, Some(BoxBreakout::MarketClose));
        assert_eq!(boxes[0].end_moment, minute(5, 390));
    }

    #[test]
    fn test_no_trade_on_quiet_tape() {
        let mut engine = IntradayEngine::new(EngineConfig::default()).unwrap();
        quiet_day(&mut engine, 4, 60);
        assert!(engine.open_trade().is_none());
        assert_eq!(engine.decider().trades_today(), 0);
    }
}
