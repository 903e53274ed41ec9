//! Exit / Take-Profit Tunnel Engine
//!
//! At trade entry a layered price tunnel is precomputed for every minute of
//! the trade's maximum life: layer 0 sits at the tunnel anchor and each outer
//! layer is offset by `distance / (2 + i)` in the trade direction, with the
//! whole stack shifted back toward the fill as minutes elapse (a "closing
//! tunnel"). Profit for the exit heuristics is always measured from the fill
//! price, not the anchor. On top of the tunnel sits an ordered battery of
//! stateful exit heuristics evaluated once per minute; the first match wins.

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::TunnelConfig;
use crate::types::{minutes_between, Candle, Direction};

const DYNAMIC_LOSS_MIN_MINUTES: i64 = 80;
const DYNAMIC_LOSS_THRESHOLD: f64 = -0.45;
const SHORT_FLAT_MIN_MINUTES: i64 = 75;
const SHORT_FLAT_MAX_PROFIT: f64 = 0.1;
const SHORT_FLAT_DROP_THRESHOLD: f64 = -0.35;
const EARLY_CLOSE_WINDOW: usize = 20;
const EARLY_CLOSE_FLAG_THRESHOLD: f64 = -0.05;
const EARLY_CLOSE_EXIT_LONG: f64 = -0.25;
const EARLY_CLOSE_EXIT_SHORT: f64 = -0.2;
const PROFIT_RUN_ARM_MINUTES: i64 = 95;
const NEGATIVE_CLOSE_COUNT_LIMIT: usize = 140;
const NEGATIVE_CLOSE_EXIT_THRESHOLD: f64 = -0.1;

/// Why the tunnel engine wants out of the trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    TrailingGiveback,
    MaxLoss,
    DrawdownExceedsPeakProfit,
    ShortFlatThenDrop,
    FlaggedEarlyClosesThenLoss,
    ProfitRunFlippedNegative,
    NegativeCloseCount,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExitReason::TrailingGiveback => "trailing_giveback_exceeded",
            ExitReason::MaxLoss => "max_loss_threshold_hit",
            ExitReason::DrawdownExceedsPeakProfit => "drawdown_exceeds_peak_profit",
            ExitReason::ShortFlatThenDrop => "short_flat_then_drop",
            ExitReason::FlaggedEarlyClosesThenLoss => "flagged_early_closes_then_loss",
            ExitReason::ProfitRunFlippedNegative => "profit_run_flipped_negative",
            ExitReason::NegativeCloseCount => "negative_close_count_exceeded",
        };
        write!(f, "{name}")
    }
}

/// The layered, time-decaying exit tunnel attached to one open trade.
/// Layer levels for every minute of the trade's maximum life are precomputed
/// at construction; the heuristic counters mutate minute by minute.
#[derive(Debug, Clone)]
pub struct TakeProfitTunnel {
    pub start_moment: NaiveDateTime,
    pub end_moment: NaiveDateTime,
    /// Layer-0 base of the tunnel stack
    pub anchor: f64,
    /// Fill price; the profit reference for every exit heuristic
    pub entry_price: f64,
    pub direction: Direction,
    pub distance: f64,
    layers_by_moment: BTreeMap<NaiveDateTime, Vec<f64>>,
    close_values_only: bool,
    trailing_giveback_percent: f64,
    max_loss_percent: Option<f64>,

    best_price_during_trade: f64,
    max_profit_percent_seen: f64,
    worst_drawdown_percent_seen: f64,
    early_closes: Vec<f64>,
    early_closes_flagged: bool,
    consecutive_profit_minutes: i64,
    profit_run_armed: bool,
    total_negative_closes: usize,
}

impl TakeProfitTunnel {
    pub fn new(
        start_moment: NaiveDateTime,
        anchor: f64,
        entry_price: f64,
        direction: Direction,
        distance: f64,
        config: &TunnelConfig,
    ) -> Self {
        let end_moment = start_moment + Duration::minutes(config.horizon_minutes);

        let mut layer_values = vec![anchor];
        for i in 0..config.layers.saturating_sub(1) {
            let delta = distance / (2 + i) as f64;
            let previous = *layer_values.last().expect("layer 0 always present");
            let next = match direction {
                Direction::Long => previous + delta,
                Direction::Short => previous - delta,
            };
            layer_values.push(next);
        }

        let mut layers_by_moment = BTreeMap::new();
        let total_minutes = minutes_between(start_moment, end_moment);
        for elapsed in 0..=total_minutes {
            let moment = start_moment + Duration::minutes(elapsed);
            let shift = distance
                * config.decay_coefficient
                * elapsed as f64
                * match direction {
                    Direction::Long => -1.0,
                    Direction::Short => 1.0,
                };
            let shifted: Vec<f64> = layer_values.iter().map(|v| v + shift).collect();
            layers_by_moment.insert(moment, shifted);
        }

        Self {
            start_moment,
            end_moment,
            anchor,
            entry_price,
            direction,
            distance,
            layers_by_moment,
            close_values_only: config.close_values_only,
            trailing_giveback_percent: config.trailing_giveback_percent,
            max_loss_percent: config.max_loss_percent,
            best_price_during_trade: entry_price,
            max_profit_percent_seen: 0.0,
            worst_drawdown_percent_seen: 0.0,
            early_closes: Vec::new(),
            early_closes_flagged: false,
            consecutive_profit_minutes: 0,
            profit_run_armed: false,
            total_negative_closes: 0,
        }
    }

    /// Layer levels precomputed for `moment`, innermost first
    pub fn layers_at(&self, moment: NaiveDateTime) -> Option<&[f64]> {
        self.layers_by_moment.get(&moment).map(Vec::as_slice)
    }

    /// Signed profit percentage of `price` relative to the fill price
    pub fn profit_percent(&self, price: f64) -> f64 {
        match self.direction {
            Direction::Long => (price - self.entry_price) / self.entry_price * 100.0,
            Direction::Short => (self.entry_price - price) / self.entry_price * 100.0,
        }
    }

    /// Innermost layer index the candle has not crossed back through at
    /// `moment` (long: price above the layer; short: below). `None` means the
    /// price has eroded past layer 0 or the moment is outside the tunnel.
    pub fn what_layer_is_candle_in(
        &self,
        candle: &Candle,
        moment: NaiveDateTime,
    ) -> Option<usize> {
        let layers = self.layers_by_moment.get(&moment)?;
        let value = if self.close_values_only {
            candle.close
        } else {
            match self.direction {
                Direction::Long => candle.low,
                Direction::Short => candle.high,
            }
        };

        let mut valid_layer = None;
        for (index, level) in layers.iter().enumerate() {
            let still_beyond = match self.direction {
                Direction::Long => value > *level,
                Direction::Short => value < *level,
            };
            if still_beyond {
                valid_layer = Some(index);
            } else {
                break;
            }
        }
        valid_layer
    }

    /// Run the ordered exit battery for this minute. Mutates the heuristic
    /// counters even when no rule fires; call exactly once per candle.
    pub fn should_exit(&mut self, candle: &Candle, moment: NaiveDateTime) -> Option<ExitReason> {
        let current_profit = self.profit_percent(candle.close);

        match self.direction {
            Direction::Long => {
                if candle.high > self.best_price_during_trade {
                    self.best_price_during_trade = candle.high;
                }
            }
            Direction::Short => {
                if candle.low < self.best_price_during_trade {
                    self.best_price_during_trade = candle.low;
                }
            }
        }
        let profit_from_best = self.profit_percent(self.best_price_during_trade);
        if profit_from_best > self.max_profit_percent_seen {
            self.max_profit_percent_seen = profit_from_best;
        }

        if self.max_profit_percent_seen - current_profit > self.trailing_giveback_percent {
            return Some(ExitReason::TrailingGiveback);
        }

        if let Some(max_loss) = self.max_loss_percent {
            let stop_price = match self.direction {
                Direction::Long => self.entry_price * (1.0 - max_loss / 100.0),
                Direction::Short => self.entry_price * (1.0 + max_loss / 100.0),
            };
            let stopped = match self.direction {
                Direction::Long => candle.close <= stop_price,
                Direction::Short => candle.close >= stop_price,
            };
            if stopped {
                return Some(ExitReason::MaxLoss);
            }
        }

        if let Some(reason) = self.dynamic_loss_exit(current_profit, moment) {
            return Some(reason);
        }
        if let Some(reason) = self.early_close_average_exit(current_profit) {
            return Some(reason);
        }
        if let Some(reason) = self.profit_run_flip_exit(current_profit) {
            return Some(reason);
        }
        self.negative_close_count_exit(current_profit)
    }

    /// Rule 3: after a minimum holding period, a drawdown deeper than the
    /// best profit ever reached means the trade thesis is dead. Shorts also
    /// get a flat-then-drop variant.
    fn dynamic_loss_exit(&mut self, current_profit: f64, moment: NaiveDateTime) -> Option<ExitReason> {
        let minutes_held = minutes_between(self.start_moment, moment);

        if current_profit < self.worst_drawdown_percent_seen {
            self.worst_drawdown_percent_seen = current_profit;
        }

        if minutes_held > DYNAMIC_LOSS_MIN_MINUTES
            && current_profit < DYNAMIC_LOSS_THRESHOLD
            && self.worst_drawdown_percent_seen.abs() > self.max_profit_percent_seen
        {
            return Some(ExitReason::DrawdownExceedsPeakProfit);
        }

        if self.direction == Direction::Short
            && minutes_held >= SHORT_FLAT_MIN_MINUTES
            && self.max_profit_percent_seen < SHORT_FLAT_MAX_PROFIT
            && current_profit <= SHORT_FLAT_DROP_THRESHOLD
        {
            return Some(ExitReason::ShortFlatThenDrop);
        }

        None
    }

    /// Rule 4: a weak average over the first 20 post-entry closes flags the
    /// trade; once flagged, any later dip below the direction-dependent
    /// threshold exits.
    fn early_close_average_exit(&mut self, current_profit: f64) -> Option<ExitReason> {
        if self.early_closes.len() < EARLY_CLOSE_WINDOW {
            self.early_closes.push(current_profit);
        }
        if self.early_closes.len() < EARLY_CLOSE_WINDOW {
            return None;
        }

        if !self.early_closes_flagged {
            let average = self.early_closes.iter().sum::<f64>() / EARLY_CLOSE_WINDOW as f64;
            if average <= EARLY_CLOSE_FLAG_THRESHOLD {
                self.early_closes_flagged = true;
            }
        }

        if self.early_closes_flagged {
            let threshold = match self.direction {
                Direction::Long => EARLY_CLOSE_EXIT_LONG,
                Direction::Short => EARLY_CLOSE_EXIT_SHORT,
            };
            if current_profit <= threshold {
                return Some(ExitReason::FlaggedEarlyClosesThenLoss);
            }
        }
        None
    }

    /// Rule 5: a long uninterrupted profitable run arms a trigger that exits
    /// the moment profit flips negative.
    fn profit_run_flip_exit(&mut self, current_profit: f64) -> Option<ExitReason> {
        if current_profit > 0.0 {
            self.consecutive_profit_minutes += 1;
        } else {
            if self.profit_run_armed && current_profit < 0.0 {
                return Some(ExitReason::ProfitRunFlippedNegative);
            }
            self.consecutive_profit_minutes = 0;
        }

        if self.consecutive_profit_minutes >= PROFIT_RUN_ARM_MINUTES {
            self.profit_run_armed = true;
        }
        None
    }

    /// Rule 6: too many losing minutes in total, and still underwater
    fn negative_close_count_exit(&mut self, current_profit: f64) -> Option<ExitReason> {
        if current_profit < 0.0 {
            self.total_negative_closes += 1;
        }
        if self.total_negative_closes >= NEGATIVE_CLOSE_COUNT_LIMIT
            && current_profit <= NEGATIVE_CLOSE_EXIT_THRESHOLD
        {
            return Some(ExitReason::NegativeCloseCount);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn minute(m: i64) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 4)
            .unwrap()
            .and_hms_opt(10, 30, 0)
            .unwrap()
            + Duration::minutes(m)
    }

    fn config(decay: f64) -> TunnelConfig {
        TunnelConfig {
            layers: 3,
            decay_coefficient: decay,
            horizon_minutes: 300,
            close_values_only: false,
            max_loss_percent: None,
            trailing_giveback_percent: 0.75,
        }
    }

    fn candle(m: i64, close: f64, high: f64, low: f64) -> Candle {
        Candle {
            open: close,
            high,
            low,
            close,
            volume: 1.0,
            moment: minute(m),
        }
    }

    #[test]
    fn test_layer_construction_at_minute_zero() {
        let tunnel = TakeProfitTunnel::new(minute(0), 100.0, 100.0, Direction::Long, 1.0, &config(0.0));
        let layers = tunnel.layers_at(minute(0)).unwrap();
        assert!((layers[0] - 100.0).abs() < 1e-9);
        assert!((layers[1] - 100.5).abs() < 1e-9);
        assert!((layers[2] - (100.5 + 1.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn test_layers_decay_toward_entry() {
        let tunnel = TakeProfitTunnel::new(minute(0), 100.0, 100.0, Direction::Long, 1.0, &config(0.002));
        // Closed form: each layer shifted down by distance * decay * minutes
        let layers = tunnel.layers_at(minute(50)).unwrap();
        let shift = 1.0 * 0.002 * 50.0;
        assert!((layers[0] - (100.0 - shift)).abs() < 1e-9);
        assert!((layers[1] - (100.5 - shift)).abs() < 1e-9);

        // Short tunnels shift up instead
        let tunnel = TakeProfitTunnel::new(minute(0), 100.0, 100.0, Direction::Short, 1.0, &config(0.002));
        let layers = tunnel.layers_at(minute(50)).unwrap();
        assert!((layers[0] - (100.0 + shift)).abs() < 1e-9);
    }

    #[test]
    fn test_what_layer_is_candle_in() {
        let tunnel = TakeProfitTunnel::new(minute(0), 100.0, 100.0, Direction::Long, 1.0, &config(0.0));
        let inside_first = candle(0, 100.4, 100.4, 100.4);
        assert_eq!(tunnel.what_layer_is_candle_in(&inside_first, minute(0)), Some(0));

        let below_anchor = candle(0, 99.9, 99.9, 99.9);
        assert_eq!(tunnel.what_layer_is_candle_in(&below_anchor, minute(0)), None);

        let deep = candle(0, 100.9, 100.9, 100.9);
        assert_eq!(tunnel.what_layer_is_candle_in(&deep, minute(0)), Some(2));

        // Outside the precomputed horizon
        assert_eq!(tunnel.what_layer_is_candle_in(&inside_first, minute(301)), None);
    }

    #[test]
    fn test_trailing_giveback_exit() {
        let mut tunnel = TakeProfitTunnel::new(minute(0), 100.0, 100.0, Direction::Long, 1.0, &config(0.0));
        // Peak at +1.0%
        assert_eq!(tunnel.should_exit(&candle(1, 101.0, 101.0, 100.9), minute(1)), None);
        // Drop to +0.2%: giveback of 0.8 > 0.75
        assert_eq!(
            tunnel.should_exit(&candle(2, 100.2, 100.3, 100.2), minute(2)),
            Some(ExitReason::TrailingGiveback)
        );
    }

    #[test]
    fn test_max_loss_exit() {
        let mut cfg = config(0.0);
        cfg.max_loss_percent = Some(0.5);
        let mut tunnel = TakeProfitTunnel::new(minute(0), 100.0, 100.0, Direction::Long, 1.0, &cfg);
        assert_eq!(tunnel.should_exit(&candle(1, 99.8, 99.9, 99.8), minute(1)), None);
        assert_eq!(
            tunnel.should_exit(&candle(2, 99.5, 99.6, 99.5), minute(2)),
            Some(ExitReason::MaxLoss)
        );
    }

    #[test]
    fn test_profit_reference_is_fill_not_anchor() {
        let mut cfg = config(0.0);
        cfg.max_loss_percent = Some(0.5);
        // Anchor sits above the fill, as a long confirmation-box entry produces
        let mut tunnel =
            TakeProfitTunnel::new(minute(0), 100.9, 100.7, Direction::Long, 1.0, &cfg);

        // The layer stack builds from the anchor
        assert!((tunnel.layers_at(minute(0)).unwrap()[0] - 100.9).abs() < 1e-9);

        // -0.31% from the fill: inside the 0.5% stop measured from 100.7.
        // Measured from the anchor this close would already be stopped out.
        assert_eq!(
            tunnel.should_exit(&candle(1, 100.39, 100.4, 100.39), minute(1)),
            None
        );
        // -0.55% from the fill: stopped
        assert_eq!(
            tunnel.should_exit(&candle(2, 100.15, 100.2, 100.15), minute(2)),
            Some(ExitReason::MaxLoss)
        );
    }

    #[test]
    fn test_flagged_early_closes_exit() {
        let mut tunnel = TakeProfitTunnel::new(minute(0), 100.0, 100.0, Direction::Long, 1.0, &config(0.0));
        // Twenty slightly losing minutes flag the trade
        for m in 1..=20 {
            assert_eq!(
                tunnel.should_exit(&candle(m, 99.93, 99.95, 99.93), minute(m)),
                None
            );
        }
        // Flagged: the next dip below -0.25% exits
        assert_eq!(
            tunnel.should_exit(&candle(21, 99.7, 99.75, 99.7), minute(21)),
            Some(ExitReason::FlaggedEarlyClosesThenLoss)
        );
    }

    #[test]
    fn test_profit_run_flip_exit() {
        let mut tunnel = TakeProfitTunnel::new(minute(0), 100.0, 100.0, Direction::Long, 1.0, &config(0.0));
        for m in 1..=95 {
            // Small steady profit, small enough not to trip the giveback rule
            assert_eq!(
                tunnel.should_exit(&candle(m, 100.1, 100.1, 100.05), minute(m)),
                None
            );
        }
        assert_eq!(
            tunnel.should_exit(&candle(96, 99.95, 100.0, 99.95), minute(96)),
            Some(ExitReason::ProfitRunFlippedNegative)
        );
    }

    #[test]
    fn test_short_profit_direction() {
        let mut tunnel = TakeProfitTunnel::new(minute(0), 100.0, 100.0, Direction::Short, 1.0, &config(0.0));
        assert!(tunnel.profit_percent(99.0) > 0.0);
        assert!(tunnel.profit_percent(101.0) < 0.0);
        // A falling market is profit for the short; no exit
        assert_eq!(tunnel.should_exit(&candle(1, 99.8, 99.9, 99.8), minute(1)), None);
    }
}
