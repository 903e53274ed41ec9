//! CSV replay harness
//!
//! Feeds a minute-candle CSV through the engine deterministically and logs
//! every entry and exit. Timestamps are either exchange-local already or,
//! with --utc-epoch, epoch seconds converted to Eastern time.

use anyhow::{Context, Result};
use chrono::{NaiveDateTime, TimeZone, Utc};
use chrono_tz::America::New_York;
use clap::Parser;
use serde::Deserialize;
use tracing::info;

use rangebreak::signals::{DailyFeatures, VolatilityInputs};
use rangebreak::{Candle, EngineConfig, IntradayEngine, MinuteAction};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Candle CSV with columns: timestamp,open,high,low,close,volume
    #[arg(short, long)]
    input: String,

    /// Engine configuration as JSON; defaults apply when omitted
    #[arg(short, long)]
    config: Option<String>,

    /// Treat the timestamp column as epoch seconds in UTC and convert
    /// to Eastern time
    #[arg(long)]
    utc_epoch: bool,

    /// Treat every day as a high-volatility regime (the replay file carries
    /// no prior-day features)
    #[arg(long)]
    assume_high_volatility: bool,
}

#[derive(Debug, Deserialize)]
struct CandleRow {
    timestamp: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

impl CandleRow {
    fn to_candle(&self, utc_epoch: bool) -> Result<Candle> {
        let moment: NaiveDateTime = if utc_epoch {
            let secs: i64 = self
                .timestamp
                .parse()
                .with_context(|| format!("bad epoch timestamp: {}", self.timestamp))?;
            let utc = Utc
                .timestamp_opt(secs, 0)
                .single()
                .with_context(|| format!("out-of-range epoch timestamp: {secs}"))?;
            utc.with_timezone(&New_York).naive_local()
        } else {
            NaiveDateTime::parse_from_str(&self.timestamp, "%Y-%m-%d %H:%M:%S")
                .with_context(|| format!("bad timestamp: {}", self.timestamp))?
        };
        Ok(Candle {
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            moment,
        })
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rangebreak=info".parse()?)
                .add_directive("replay=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let config: EngineConfig = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {path}"))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing config {path}"))?
        }
        None => EngineConfig::default(),
    };

    let mut engine = IntradayEngine::new(config)?;

    let volatility = if args.assume_high_volatility {
        VolatilityInputs {
            overnight_gap_volatile: true,
            ..VolatilityInputs::default()
        }
    } else {
        VolatilityInputs::default()
    };
    let features = DailyFeatures::default();

    let mut reader = csv::Reader::from_path(&args.input)
        .with_context(|| format!("opening {}", args.input))?;

    let mut candles = 0u64;
    let mut entries = 0u64;
    let mut exits = 0u64;

    for row in reader.deserialize() {
        let row: CandleRow = row.context("malformed candle row")?;
        let candle = row.to_candle(args.utc_epoch)?;
        candles += 1;

        match engine.on_minute(candle, volatility, features)? {
            MinuteAction::Entered(trade) => {
                entries += 1;
                info!(
                    trade_id = %trade.id,
                    direction = %trade.direction,
                    price = trade.entry_price,
                    moment = %trade.entry_moment,
                    "entered"
                );
            }
            MinuteAction::Exited { trade, price, reason } => {
                exits += 1;
                info!(
                    trade_id = %trade.id,
                    entry = trade.entry_price,
                    exit = price,
                    %reason,
                    "exited"
                );
            }
            MinuteAction::None => {}
        }
    }

    info!(candles, entries, exits, "replay complete");
    Ok(())
}
