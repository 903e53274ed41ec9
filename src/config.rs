//! Engine configuration
//!
//! Defaults mirror the production parameter set. Everything is validated once,
//! at engine construction; a bad value is rejected with
//! `EngineError::InvalidConfig` instead of surfacing mid-session.

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Configuration for one consolidation-box engine instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoxEngineConfig {
    /// Minimum qualifying width of a box, in minutes (default: 45)
    pub min_minutes: i64,
    /// Max fraction of overlap tolerated between consecutive closed boxes (default: 0.6)
    pub max_overlap_threshold: f64,
    /// Per-minute thickness tolerance ramp past the creation moment,
    /// as a fraction of max thickness per elapsed minute (default: 1/240)
    pub tolerance_coefficient: f64,
    /// Qualify on closes instead of highs/lows (default: false)
    pub use_closing_values: bool,
    /// Allow boxes to live inside the opening-range price band (default: false)
    pub allow_in_opening_range: bool,
    /// Window after a box closes in which a closing HOD/LOD is attributed to it (default: 5)
    pub hod_lod_after_close_minutes: i64,
    /// Lookback window before a box closes for HOD/LOD attribution (default: 5)
    pub hod_lod_before_close_minutes: i64,
}

impl Default for BoxEngineConfig {
    fn default() -> Self {
        Self {
            min_minutes: 45,
            max_overlap_threshold: 0.6,
            tolerance_coefficient: 1.0 / (60.0 * 4.0),
            use_closing_values: false,
            allow_in_opening_range: false,
            hod_lod_after_close_minutes: 5,
            hod_lod_before_close_minutes: 5,
        }
    }
}

impl BoxEngineConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.min_minutes < 1 {
            return Err(EngineError::InvalidConfig(format!(
                "box min_minutes must be >= 1, got {}",
                self.min_minutes
            )));
        }
        if !(0.0..=1.0).contains(&self.max_overlap_threshold) {
            return Err(EngineError::InvalidConfig(format!(
                "box max_overlap_threshold must be in [0, 1], got {}",
                self.max_overlap_threshold
            )));
        }
        if self.tolerance_coefficient < 0.0 {
            return Err(EngineError::InvalidConfig(
                "box tolerance_coefficient must be >= 0".to_string(),
            ));
        }
        if self.hod_lod_after_close_minutes < 0 || self.hod_lod_before_close_minutes < 0 {
            return Err(EngineError::InvalidConfig(
                "HOD/LOD attribution windows must be >= 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for the take-profit tunnel attached to an open trade
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Number of tunnel layers including the anchor layer (default: 3)
    pub layers: usize,
    /// Per-minute contraction of all layers toward entry, as a fraction
    /// of the tunnel distance (default: 0.002)
    pub decay_coefficient: f64,
    /// Tunnel lifetime from entry, in minutes (default: 300)
    pub horizon_minutes: i64,
    /// Evaluate layers against closes only, instead of highs/lows (default: false)
    pub close_values_only: bool,
    /// Hard stop-loss as a percentage of entry price; `None` disables
    /// the stop (default: 0.5)
    pub max_loss_percent: Option<f64>,
    /// Exit once profit has given back this many percentage points
    /// from the best profit seen since entry (default: 0.75)
    pub trailing_giveback_percent: f64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            layers: 3,
            decay_coefficient: 0.002,
            horizon_minutes: 300,
            close_values_only: false,
            max_loss_percent: Some(0.5),
            trailing_giveback_percent: 0.75,
        }
    }
}

impl TunnelConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.layers < 1 {
            return Err(EngineError::InvalidConfig(
                "tunnel must have at least one layer".to_string(),
            ));
        }
        if self.horizon_minutes < 1 {
            return Err(EngineError::InvalidConfig(
                "tunnel horizon must be >= 1 minute".to_string(),
            ));
        }
        if self.decay_coefficient < 0.0 {
            return Err(EngineError::InvalidConfig(
                "tunnel decay_coefficient must be >= 0".to_string(),
            ));
        }
        if let Some(max_loss) = self.max_loss_percent {
            if max_loss <= 0.0 {
                return Err(EngineError::InvalidConfig(
                    "tunnel max_loss_percent must be > 0 when set".to_string(),
                ));
            }
        }
        if self.trailing_giveback_percent <= 0.0 {
            return Err(EngineError::InvalidConfig(
                "tunnel trailing_giveback_percent must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for the trade lifecycle decider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Order quantity attached to BUY/SELL decisions (default: 1.0)
    pub order_quantity: f64,
    /// Maximum entries per trading day (default: 5)
    pub trades_per_day: u32,
    /// Require a confirmation box after the pre-signal before entering (default: true)
    pub require_confirmation: bool,
    /// With confirmation required, skip the pre-signal avoid lists (default: true)
    pub ignore_avoid_conditions_when_confirming: bool,
    /// A confirmation box may start at most this many minutes before
    /// the pre-signal moment (default: 10)
    pub confirmation_overlap_minutes: i64,
    /// Reject confirmation boxes further than this percent from the
    /// pre-signal close (default: 0.4)
    pub max_percent_from_pre_signal: f64,
    /// Reject entries further than this percent from the last exit price (default: 1.25)
    pub max_percent_from_last_exit: f64,
    /// Confirmation close must sit beyond the pre-signal close by
    /// `coefficient * box height`, per direction (defaults: -5.0 each,
    /// i.e. effectively disabled in the reference parameter set)
    pub confirmation_distance_coeff_long: f64,
    pub confirmation_distance_coeff_short: f64,
    /// No new entries at or after this time of day (default: 15:26)
    pub entry_cutoff: NaiveTime,
    /// HOD/LOD balance needed for the cumulative-extremes pre-signal trigger (default: 5)
    pub hod_lod_balance_threshold: i64,
    /// The balance trigger only fires before this time of day (default: 10:15)
    pub hod_lod_balance_cutoff: NaiveTime,
    /// Fraction of the opening-range height price must clear beyond the range
    /// for the balance trigger (default: 0.25)
    pub opening_range_distance_fraction: f64,
    /// Tunnel distance as a fraction of the confirmation box height (default: 0.4)
    pub tunnel_distance_box_coeff: f64,
    /// Tunnel distance as a fraction of the opening-range height when no
    /// confirmation box exists (default: 0.4)
    pub tunnel_distance_range_coeff: f64,
    /// Fraction of the confirmation-box thickness used for the trailing
    /// exit-area stop distance (default: 0.65)
    pub exit_area_stop_fraction: f64,
    /// Consecutive closes inside the exit area required to exit (default: 2)
    pub exit_area_min_consecutive_closes: u32,
    /// Only exit on the exit-area signal when the current close is the worst
    /// close of the lookback window (default: false)
    pub exit_area_require_worst_close: bool,
    /// Opposite-box-break exit: minimum minutes after entry before it is
    /// consulted (default: 5)
    pub opposite_break_min_minutes_after_entry: i64,
    /// Opposite-box-break exit: post-break scan window in minutes (default: 100)
    pub opposite_break_window_minutes: i64,
    /// Opposite-box-break exit: confirming closes must clear the box boundary
    /// by this fraction of the box height (default: 0.3)
    pub opposite_break_threshold_fraction: f64,
    /// Opposite-box-break exit: consecutive confirming closes required (default: 2)
    pub opposite_break_min_consecutive_closes: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            order_quantity: 1.0,
            trades_per_day: 5,
            require_confirmation: true,
            ignore_avoid_conditions_when_confirming: true,
            confirmation_overlap_minutes: 10,
            max_percent_from_pre_signal: 0.4,
            max_percent_from_last_exit: 1.25,
            confirmation_distance_coeff_long: -5.0,
            confirmation_distance_coeff_short: -5.0,
            entry_cutoff: NaiveTime::from_hms_opt(15, 26, 0).unwrap(),
            hod_lod_balance_threshold: 5,
            hod_lod_balance_cutoff: NaiveTime::from_hms_opt(10, 15, 0).unwrap(),
            opening_range_distance_fraction: 0.25,
            tunnel_distance_box_coeff: 0.4,
            tunnel_distance_range_coeff: 0.4,
            exit_area_stop_fraction: 0.65,
            exit_area_min_consecutive_closes: 2,
            exit_area_require_worst_close: false,
            opposite_break_min_minutes_after_entry: 5,
            opposite_break_window_minutes: 100,
            opposite_break_threshold_fraction: 0.3,
            opposite_break_min_consecutive_closes: 2,
        }
    }
}

impl LifecycleConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.trades_per_day < 1 {
            return Err(EngineError::InvalidConfig(
                "trades_per_day must be >= 1".to_string(),
            ));
        }
        if self.max_percent_from_pre_signal < 0.0 || self.max_percent_from_last_exit < 0.0 {
            return Err(EngineError::InvalidConfig(
                "distance-from-reference limits must be >= 0".to_string(),
            ));
        }
        if self.hod_lod_balance_threshold < 0 {
            return Err(EngineError::InvalidConfig(
                "hod_lod_balance_threshold must be >= 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.opening_range_distance_fraction) {
            return Err(EngineError::InvalidConfig(
                "opening_range_distance_fraction must be in [0, 1]".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.exit_area_stop_fraction) {
            return Err(EngineError::InvalidConfig(
                "exit_area_stop_fraction must be in [0, 1]".to_string(),
            ));
        }
        if self.exit_area_min_consecutive_closes < 1 {
            return Err(EngineError::InvalidConfig(
                "exit_area_min_consecutive_closes must be >= 1".to_string(),
            ));
        }
        if self.opposite_break_min_consecutive_closes < 1 {
            return Err(EngineError::InvalidConfig(
                "opposite_break_min_consecutive_closes must be >= 1".to_string(),
            ));
        }
        if self.order_quantity <= 0.0 {
            return Err(EngineError::InvalidConfig(
                "order_quantity must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Opening-range window variants, in minutes, ascending (default: [5, 10, 15]).
    /// One box engine runs per variant; the last (widest) variant is the one
    /// the confirmation and opposite-break logic reads.
    pub opening_range_windows: Vec<i64>,
    /// Trailing days averaged for the daily max-thickness refresh (default: 6)
    pub thickness_average_days: usize,
    /// Recenter each opening range on the day's opening price (default: false)
    pub recenter_opening_range_on_open: bool,
    /// First minute of the session (default: 9:30)
    pub session_open: NaiveTime,
    /// Last minute of the session (default: 16:00)
    pub session_close: NaiveTime,
    /// Open positions are force-closed at this time (default: 15:58)
    pub forced_exit: NaiveTime,
    pub box_engine: BoxEngineConfig,
    pub tunnel: TunnelConfig,
    pub lifecycle: LifecycleConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            opening_range_windows: vec![5, 10, 15],
            thickness_average_days: 6,
            recenter_opening_range_on_open: false,
            session_open: NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
            session_close: NaiveTime::from_hms_opt(16, 0, 0).unwrap(),
            forced_exit: NaiveTime::from_hms_opt(15, 58, 0).unwrap(),
            box_engine: BoxEngineConfig::default(),
            tunnel: TunnelConfig::default(),
            lifecycle: LifecycleConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.opening_range_windows.is_empty() {
            return Err(EngineError::InvalidConfig(
                "at least one opening-range window is required".to_string(),
            ));
        }
        if self
            .opening_range_windows
            .windows(2)
            .any(|pair| pair[0] >= pair[1])
        {
            return Err(EngineError::InvalidConfig(
                "opening_range_windows must be strictly ascending".to_string(),
            ));
        }
        if self.opening_range_windows.iter().any(|w| *w < 1) {
            return Err(EngineError::InvalidConfig(
                "opening-range windows must be >= 1 minute".to_string(),
            ));
        }
        if self.thickness_average_days < 1 {
            return Err(EngineError::InvalidConfig(
                "thickness_average_days must be >= 1".to_string(),
            ));
        }
        if self.session_open >= self.session_close {
            return Err(EngineError::InvalidConfig(
                "session_open must precede session_close".to_string(),
            ));
        }
        if self.forced_exit > self.session_close {
            return Err(EngineError::InvalidConfig(
                "forced_exit must not be after session_close".to_string(),
            ));
        }
        self.box_engine.validate()?;
        self.tunnel.validate()?;
        self.lifecycle.validate()?;
        Ok(())
    }
}
