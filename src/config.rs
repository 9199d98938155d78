use crate::error::PipelineError;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Days, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Build a labeled sleep/wake feature dataset from raw wearable logs
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Merge raw signals, extract window features and label them
    Prepare(PrepareArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct PrepareArgs {
    /// Directory holding one sub-directory per user
    #[arg(long, default_value = "data/raw", env = "SLEEP_FEATURES_RAW_DIR")]
    pub raw_dir: PathBuf,

    /// Directory receiving the per-user merged tables
    #[arg(long, default_value = "data/processed")]
    pub processed_dir: PathBuf,

    /// Output dataset path (.csv, or .feather/.arrow for Arrow IPC)
    #[arg(long, default_value = "data/features/all_users.csv")]
    pub output: PathBuf,

    /// Aggregation bin width in seconds
    #[arg(long, default_value = "60")]
    pub bin_seconds: i64,

    /// Rolling window lengths in seconds, comma separated
    #[arg(long, value_delimiter = ',', default_value = "300,900")]
    pub rolling_windows: Vec<i64>,

    /// Calendar date of recording day 1 (format: YYYY-MM-DD)
    #[arg(long, default_value = "2023-01-01")]
    pub recording_start: String,

    /// Prefix identifying user directories under the raw directory
    #[arg(long, default_value = "user_")]
    pub user_prefix: String,
}

impl PrepareArgs {
    pub fn into_config(self) -> Result<PipelineConfig, PipelineError> {
        let recording_start = NaiveDate::parse_from_str(self.recording_start.trim(), "%Y-%m-%d")
            .map_err(|e| {
                PipelineError::InvalidConfig(format!(
                    "recording start '{}' is not a YYYY-MM-DD date: {}",
                    self.recording_start, e
                ))
            })?;

        let features = FeatureConfig {
            bin_seconds: self.bin_seconds,
            rolling_windows: self.rolling_windows,
        }
        .validate()?;

        Ok(PipelineConfig {
            raw_dir: self.raw_dir,
            processed_dir: self.processed_dir,
            output: self.output,
            user_prefix: self.user_prefix,
            features,
            calendar: RecordingCalendar::new(recording_start),
        })
    }
}

/// Window geometry for feature extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureConfig {
    /// Width of the non-overlapping aggregation bins.
    pub bin_seconds: i64,
    /// Trailing rolling window lengths, ascending and unique once validated.
    pub rolling_windows: Vec<i64>,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            bin_seconds: 60,
            rolling_windows: vec![300, 900],
        }
    }
}

impl FeatureConfig {
    pub fn validate(mut self) -> Result<Self, PipelineError> {
        if self.bin_seconds <= 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "bin width must be positive, got {}s",
                self.bin_seconds
            )));
        }
        if self.rolling_windows.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "at least one rolling window is required".to_string(),
            ));
        }
        if let Some(bad) = self.rolling_windows.iter().find(|w| **w <= 0) {
            return Err(PipelineError::InvalidConfig(format!(
                "rolling windows must be positive, got {}s",
                bad
            )));
        }
        self.rolling_windows.sort_unstable();
        self.rolling_windows.dedup();
        Ok(self)
    }

    pub fn bin_width(&self) -> Duration {
        Duration::seconds(self.bin_seconds)
    }
}

/// Maps the date and time cells of the raw files onto absolute timestamps.
///
/// A date cell is either an ISO date or a 1-based recording day index counted
/// from `recording_start`. A time cell is `HH:MM:SS` (fractional seconds
/// allowed) or `HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordingCalendar {
    pub recording_start: NaiveDate,
}

impl Default for RecordingCalendar {
    fn default() -> Self {
        Self::new(NaiveDate::from_ymd_opt(2023, 1, 1).unwrap_or_default())
    }
}

impl RecordingCalendar {
    pub fn new(recording_start: NaiveDate) -> Self {
        Self { recording_start }
    }

    pub fn parse_date(&self, cell: &str) -> Result<NaiveDate> {
        let cell = cell.trim();
        if let Some(day) = parse_day_index(cell) {
            if day == 0 {
                return Err(anyhow!("recording day index starts at 1, got 0"));
            }
            return self
                .recording_start
                .checked_add_days(Days::new(day - 1))
                .ok_or_else(|| anyhow!("recording day {} is out of range", day));
        }
        NaiveDate::parse_from_str(cell, "%Y-%m-%d")
            .map_err(|e| anyhow!("invalid date '{}': {}", cell, e))
    }

    pub fn parse_time(&self, cell: &str) -> Result<NaiveTime> {
        let cell = cell.trim();
        NaiveTime::parse_from_str(cell, "%H:%M:%S%.f")
            .or_else(|_| NaiveTime::parse_from_str(cell, "%H:%M"))
            .map_err(|e| anyhow!("invalid time of day '{}': {}", cell, e))
    }

    pub fn resolve(&self, date: &str, time: &str) -> Result<DateTime<Utc>> {
        let date = self.parse_date(date)?;
        let time = self.parse_time(time)?;
        Ok(NaiveDateTime::new(date, time).and_utc())
    }
}

// Day cells sometimes come out of spreadsheets as "2.0".
fn parse_day_index(cell: &str) -> Option<u64> {
    if let Ok(day) = cell.parse::<u64>() {
        return Some(day);
    }
    let value = cell.parse::<f64>().ok()?;
    if value.is_finite() && value >= 0.0 && value.fract() == 0.0 {
        Some(value as u64)
    } else {
        None
    }
}

/// Everything a `prepare` run needs.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub raw_dir: PathBuf,
    pub processed_dir: PathBuf,
    pub output: PathBuf,
    pub user_prefix: String,
    pub features: FeatureConfig,
    pub calendar: RecordingCalendar,
}

impl PipelineConfig {
    pub fn new(
        raw_dir: impl Into<PathBuf>,
        processed_dir: impl Into<PathBuf>,
        output: impl Into<PathBuf>,
    ) -> Self {
        Self {
            raw_dir: raw_dir.into(),
            processed_dir: processed_dir.into(),
            output: output.into(),
            user_prefix: "user_".to_string(),
            features: FeatureConfig::default(),
            calendar: RecordingCalendar::default(),
        }
    }
}
