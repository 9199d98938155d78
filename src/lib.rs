pub mod builder;
pub mod config;
pub mod data_loading;
pub mod dataset;
pub mod error;
pub mod labeling;
pub mod merge;
pub mod output;
pub mod preprocessing;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

pub use builder::{BuildOutcome, BuildReport, DatasetBuilder, LogObserver, PipelineObserver};
pub use config::{FeatureConfig, PipelineConfig, RecordingCalendar};
pub use dataset::{Dataset, FeatureTable, FeatureWindow};
pub use error::{PipelineError, SchemaError, SkipReason};

/// One inter-beat interval reading, in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeartIntervalSample {
    pub timestamp: DateTime<Utc>,
    pub ibi_s: f64,
}

impl HeartIntervalSample {
    /// Instantaneous rate in beats per minute.
    pub fn bpm(&self) -> f64 {
        60.0 / self.ibi_s
    }
}

/// One row of the actigraphy stream. Missing cells stay `None`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivitySample {
    pub timestamp: DateTime<Utc>,
    pub heart_rate: Option<f64>,
    pub vector_magnitude: Option<f64>,
    pub steps: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergedSample {
    pub timestamp: DateTime<Utc>,
    pub heart_rate: Option<f64>,
    pub vector_magnitude: Option<f64>,
    pub steps: Option<f64>,
    /// Heart rate derived from the interval stream, on the 1 Hz grid.
    pub bpm: Option<f64>,
}

/// Merged per-user series together with the signal columns that were
/// actually present in the source activity file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedSeries {
    pub columns: BTreeSet<Signal>,
    pub samples: Vec<MergedSample>,
}

impl MergedSeries {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// One in-bed to out-of-bed session. Bounds are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SleepInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl SleepInterval {
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t <= self.end
    }
}

/// Activity signals the feature extractor depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Signal {
    HeartRate,
    VectorMagnitude,
    Steps,
}

impl Signal {
    pub const REQUIRED: [Signal; 3] = [Signal::HeartRate, Signal::VectorMagnitude, Signal::Steps];

    /// Column header used by the activity and merged files.
    pub fn column(&self) -> &'static str {
        match self {
            Signal::HeartRate => "HR",
            Signal::VectorMagnitude => "Vector Magnitude",
            Signal::Steps => "Steps",
        }
    }

    /// Lower-cased prefix used for aggregated feature columns.
    pub fn feature_prefix(&self) -> &'static str {
        match self {
            Signal::HeartRate => "hr",
            Signal::VectorMagnitude => "vector_magnitude",
            Signal::Steps => "steps",
        }
    }

    pub fn from_column(name: &str) -> Option<Signal> {
        Signal::REQUIRED
            .into_iter()
            .find(|signal| signal.column() == name.trim())
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}
