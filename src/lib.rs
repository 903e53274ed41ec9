// Library crate - consolidation-box breakout engine and trade lifecycle

pub mod box_engine;
pub mod config;
pub mod engine;
pub mod error;
pub mod exit_area;
pub mod lifecycle;
pub mod opening_range;
pub mod session;
pub mod signals;
pub mod tunnel;
pub mod types;

// Re-export commonly used types
pub use config::EngineConfig;
pub use engine::{IntradayEngine, MinuteAction, OpenTrade};
pub use error::EngineError;
pub use types::{Candle, DayCandles, Direction};
