//! Error taxonomy for the dataset pipeline.
//!
//! `PipelineError` aborts a run. `SkipReason` excludes a single user and the
//! run continues. A missing sleep-session file is neither: labels degrade to
//! "not sleeping" and the observer is warned.

use crate::Signal;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("No user directories found in {0}")]
    NoUserDirectories(PathBuf),

    #[error("Failed to list user directories: {0:#}")]
    Discovery(anyhow::Error),

    #[error("No valid user data processed. Checked {checked} users")]
    NoValidUsers { checked: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Report serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Why a user was left out of the dataset.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    #[error("no data: {0}")]
    MissingRawData(String),

    #[error("missing required signals: {}", join_signals(.0))]
    MissingSignals(BTreeSet<Signal>),

    #[error("merged series is empty")]
    EmptyMerge,

    #[error("no features generated")]
    EmptyFeatures,

    #[error("invalid sleep sessions: {0}")]
    InvalidSleepSessions(String),

    #[error("bin width {bin_seconds}s is narrower than the sampling interval {native_seconds}s")]
    BinNarrowerThanSampling { bin_seconds: i64, native_seconds: i64 },
}

/// Required signals absent from an input table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("missing required signals: {}", join_signals(.missing))]
pub struct SchemaError {
    pub missing: BTreeSet<Signal>,
}

impl From<SchemaError> for SkipReason {
    fn from(err: SchemaError) -> Self {
        SkipReason::MissingSignals(err.missing)
    }
}

fn join_signals(signals: &BTreeSet<Signal>) -> String {
    signals
        .iter()
        .map(|s| s.column())
        .collect::<Vec<_>>()
        .join(", ")
}
