//! Window feature extraction.
//!
//! Runs in two streaming phases over a time-sorted merged series:
//!
//! 1. [`RollingAccumulator`] computes trailing statistics per sample for every
//!    configured window length, forward-filling gaps as it goes and holding
//!    back only the leading samples that still need a backward fill.
//! 2. [`BinReducer`] folds the filled samples into fixed, non-overlapping bins
//!    and emits one row per occupied bin.

use crate::config::FeatureConfig;
use crate::dataset::{FeatureTable, FeatureWindow};
use crate::error::{SchemaError, SkipReason};
use crate::{MergedSample, MergedSeries, Signal};
use chrono::{DateTime, Duration, NaiveTime, Utc};
use log::debug;
use std::collections::{BTreeSet, VecDeque};
use std::fmt;

/// Explicit declaration of the signal columns a series must carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalSchema {
    required: BTreeSet<Signal>,
}

impl Default for SignalSchema {
    fn default() -> Self {
        Self {
            required: Signal::REQUIRED.into_iter().collect(),
        }
    }
}

impl SignalSchema {
    pub fn validate(&self, columns: &BTreeSet<Signal>) -> Result<(), SchemaError> {
        let missing: BTreeSet<Signal> = self.required.difference(columns).copied().collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(SchemaError { missing })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollingStat {
    Mean,
    Std,
}

impl fmt::Display for RollingStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollingStat::Mean => f.write_str("mean"),
            RollingStat::Std => f.write_str("std"),
        }
    }
}

/// One trailing statistic of one signal over one window length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollingFeature {
    pub signal: Signal,
    pub stat: RollingStat,
    pub window_seconds: i64,
}

impl RollingFeature {
    /// Features produced for each window: heart rate mean and std, motion mean.
    pub fn for_windows(windows: &[i64]) -> Vec<RollingFeature> {
        windows
            .iter()
            .flat_map(|&window_seconds| {
                [
                    (Signal::HeartRate, RollingStat::Mean),
                    (Signal::HeartRate, RollingStat::Std),
                    (Signal::VectorMagnitude, RollingStat::Mean),
                ]
                .map(|(signal, stat)| RollingFeature {
                    signal,
                    stat,
                    window_seconds,
                })
            })
            .collect()
    }

    /// e.g. `hr_roll_std_300s`
    pub fn name(&self) -> String {
        let short = match self.signal {
            Signal::HeartRate => "hr",
            Signal::VectorMagnitude => "vm",
            Signal::Steps => "steps",
        };
        format!("{}_roll_{}_{}s", short, self.stat, self.window_seconds)
    }

    /// Name of the bin-level column, the within-bin mean of this feature.
    pub fn column_name(&self) -> String {
        format!("{}_mean", self.name())
    }
}

fn signal_value(sample: &MergedSample, signal: Signal) -> Option<f64> {
    match signal {
        Signal::HeartRate => sample.heart_rate,
        Signal::VectorMagnitude => sample.vector_magnitude,
        Signal::Steps => sample.steps,
    }
}

/// Trailing window over `(t - window, t]`, counting only observed values.
///
/// Sums are kept relative to the first value ever seen so a constant signal
/// yields an exact zero deviation.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    window: Duration,
    buffer: VecDeque<(DateTime<Utc>, f64)>,
    shift: Option<f64>,
    sum: f64,
    sum_sq: f64,
}

impl RollingWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            buffer: VecDeque::new(),
            shift: None,
            sum: 0.0,
            sum_sq: 0.0,
        }
    }

    pub fn push(&mut self, t: DateTime<Utc>, value: Option<f64>) {
        let cutoff = t - self.window;
        while let Some(&(front, old)) = self.buffer.front() {
            if front > cutoff {
                break;
            }
            let d = old - self.shift.unwrap_or(0.0);
            self.sum -= d;
            self.sum_sq -= d * d;
            self.buffer.pop_front();
        }
        if self.buffer.is_empty() {
            self.sum = 0.0;
            self.sum_sq = 0.0;
        }

        if let Some(v) = value {
            let shift = *self.shift.get_or_insert(v);
            let d = v - shift;
            self.sum += d;
            self.sum_sq += d * d;
            self.buffer.push_back((t, v));
        }
    }

    pub fn count(&self) -> usize {
        self.buffer.len()
    }

    pub fn mean(&self) -> Option<f64> {
        let n = self.buffer.len();
        if n == 0 {
            return None;
        }
        Some(self.shift.unwrap_or(0.0) + self.sum / n as f64)
    }

    /// Sample standard deviation; undefined below two observations.
    pub fn std(&self) -> Option<f64> {
        let n = self.buffer.len();
        if n < 2 {
            return None;
        }
        let n = n as f64;
        let var = (self.sum_sq - self.sum * self.sum / n) / (n - 1.0);
        Some(var.max(0.0).sqrt())
    }
}

/// A merged sample with its gap-filled rolling feature values, in the order of
/// the accumulator's feature list.
#[derive(Debug, Clone, PartialEq)]
pub struct FilledSample {
    pub sample: MergedSample,
    pub rolling: Vec<Option<f64>>,
}

/// Causal rolling features with forward fill, plus backward fill of the
/// leading gap.
#[derive(Debug, Clone)]
pub struct RollingAccumulator {
    features: Vec<RollingFeature>,
    // (signal, window) pairs and, per feature, the index of its window
    windows: Vec<(Signal, RollingWindow)>,
    window_of: Vec<usize>,
    last_valid: Vec<Option<f64>>,
    first_valid: Vec<Option<f64>>,
    pending: VecDeque<FilledSample>,
}

impl RollingAccumulator {
    pub fn new(features: Vec<RollingFeature>) -> Self {
        let mut windows: Vec<(Signal, i64, RollingWindow)> = Vec::new();
        let mut window_of = Vec::with_capacity(features.len());
        for feature in &features {
            let idx = match windows
                .iter()
                .position(|(s, w, _)| *s == feature.signal && *w == feature.window_seconds)
            {
                Some(idx) => idx,
                None => {
                    windows.push((
                        feature.signal,
                        feature.window_seconds,
                        RollingWindow::new(Duration::seconds(feature.window_seconds)),
                    ));
                    windows.len() - 1
                }
            };
            window_of.push(idx);
        }

        let n = features.len();
        Self {
            features,
            windows: windows.into_iter().map(|(s, _, w)| (s, w)).collect(),
            window_of,
            last_valid: vec![None; n],
            first_valid: vec![None; n],
            pending: VecDeque::new(),
        }
    }

    pub fn features(&self) -> &[RollingFeature] {
        &self.features
    }

    /// Feeds one sample (in time order) and returns the samples that are now
    /// fully filled.
    pub fn push(&mut self, sample: MergedSample) -> Vec<FilledSample> {
        for (signal, window) in &mut self.windows {
            window.push(sample.timestamp, signal_value(&sample, *signal));
        }

        let mut rolling = Vec::with_capacity(self.features.len());
        for (i, feature) in self.features.iter().enumerate() {
            let window = &self.windows[self.window_of[i]].1;
            let raw = match feature.stat {
                RollingStat::Mean => window.mean(),
                RollingStat::Std => window.std(),
            };
            let value = match raw {
                Some(v) => {
                    self.last_valid[i] = Some(v);
                    self.first_valid[i].get_or_insert(v);
                    Some(v)
                }
                None => self.last_valid[i],
            };
            rolling.push(value);
        }

        let complete = rolling.iter().all(Option::is_some);
        self.pending.push_back(FilledSample { sample, rolling });
        if complete {
            self.drain_pending()
        } else {
            Vec::new()
        }
    }

    /// Flushes held-back samples. Columns that never produced a value stay
    /// empty.
    pub fn finish(mut self) -> Vec<FilledSample> {
        self.drain_pending()
    }

    fn drain_pending(&mut self) -> Vec<FilledSample> {
        let first_valid = &self.first_valid;
        self.pending
            .drain(..)
            .map(|mut filled| {
                for (value, first) in filled.rolling.iter_mut().zip(first_valid) {
                    if value.is_none() {
                        *value = *first;
                    }
                }
                filled
            })
            .collect()
    }
}

/// Mean and sample standard deviation. `None` where undefined.
pub fn calculate_stats(data: &[f64]) -> (Option<f64>, Option<f64>) {
    let n = data.len();
    if n == 0 {
        return (None, None);
    }
    let mean = data.iter().sum::<f64>() / n as f64;
    if n < 2 {
        return (Some(mean), None);
    }
    let variance = data
        .iter()
        .map(|&x| {
            let diff = x - mean;
            diff * diff
        })
        .sum::<f64>()
        / (n - 1) as f64;
    (Some(mean), Some(variance.sqrt()))
}

fn mean_of(data: &[f64]) -> Option<f64> {
    calculate_stats(data).0
}

#[derive(Debug)]
struct OpenBin {
    index: i64,
    heart_rate: Vec<f64>,
    vector_magnitude: Vec<f64>,
    steps: f64,
    rolling: Vec<Vec<f64>>,
}

impl OpenBin {
    fn new(index: i64, rolling_len: usize) -> Self {
        Self {
            index,
            heart_rate: Vec::new(),
            vector_magnitude: Vec::new(),
            steps: 0.0,
            rolling: vec![Vec::new(); rolling_len],
        }
    }

    fn add(&mut self, filled: &FilledSample) {
        let s = &filled.sample;
        self.heart_rate.extend(s.heart_rate);
        self.vector_magnitude.extend(s.vector_magnitude);
        self.steps += s.steps.unwrap_or(0.0);
        for (values, v) in self.rolling.iter_mut().zip(&filled.rolling) {
            values.extend(*v);
        }
    }
}

/// One reduced bin: start timestamp and values in extractor column order.
#[derive(Debug, Clone, PartialEq)]
pub struct BinRow {
    pub start: DateTime<Utc>,
    pub values: Vec<Option<f64>>,
}

/// Folds time-ordered samples into bins anchored at midnight of the first
/// sample's day.
#[derive(Debug)]
pub struct BinReducer {
    width: Duration,
    rolling_len: usize,
    origin: Option<DateTime<Utc>>,
    current: Option<OpenBin>,
}

impl BinReducer {
    pub fn new(width: Duration, rolling_len: usize) -> Self {
        Self {
            width,
            rolling_len,
            origin: None,
            current: None,
        }
    }

    /// Adds a sample; returns the previous bin once a sample lands in a later one.
    pub fn push(&mut self, filled: &FilledSample) -> Option<BinRow> {
        let t = filled.sample.timestamp;
        let origin = *self
            .origin
            .get_or_insert_with(|| t.date_naive().and_time(NaiveTime::MIN).and_utc());
        let width_ms = self.width.num_milliseconds();
        let index = (t - origin).num_milliseconds().div_euclid(width_ms);

        let mut closed = None;
        if self.current.as_ref().is_some_and(|bin| bin.index != index) {
            closed = self.current.take().map(|bin| self.close(bin));
        }
        let rolling_len = self.rolling_len;
        self.current
            .get_or_insert_with(|| OpenBin::new(index, rolling_len))
            .add(filled);
        closed
    }

    pub fn finish(mut self) -> Option<BinRow> {
        self.current.take().map(|bin| self.close(bin))
    }

    fn close(&self, bin: OpenBin) -> BinRow {
        let origin = self.origin.unwrap_or_default();
        let start = origin + Duration::milliseconds(self.width.num_milliseconds() * bin.index);
        let (hr_mean, hr_std) = calculate_stats(&bin.heart_rate);
        let (vm_mean, vm_std) = calculate_stats(&bin.vector_magnitude);

        let mut values = vec![hr_mean, hr_std, vm_mean, vm_std, Some(bin.steps)];
        values.extend(bin.rolling.iter().map(|v| mean_of(v)));
        BinRow { start, values }
    }
}

/// Turns a merged series into per-bin feature rows for one user.
#[derive(Debug, Clone)]
pub struct WindowFeatureExtractor {
    schema: SignalSchema,
    config: FeatureConfig,
    features: Vec<RollingFeature>,
}

impl WindowFeatureExtractor {
    pub fn new(config: FeatureConfig) -> Self {
        let features = RollingFeature::for_windows(&config.rolling_windows);
        Self {
            schema: SignalSchema::default(),
            config,
            features,
        }
    }

    pub fn rolling_features(&self) -> &[RollingFeature] {
        &self.features
    }

    /// Output column names, excluding timestamp, user id and label.
    pub fn columns(&self) -> Vec<String> {
        let mut columns = Vec::with_capacity(5 + self.features.len());
        for signal in [Signal::HeartRate, Signal::VectorMagnitude] {
            columns.push(format!("{}_mean", signal.feature_prefix()));
            columns.push(format!("{}_std", signal.feature_prefix()));
        }
        columns.push(format!("{}_sum", Signal::Steps.feature_prefix()));
        columns.extend(self.features.iter().map(RollingFeature::column_name));
        columns
    }

    pub fn extract(&self, user_id: &str, series: &MergedSeries) -> Result<FeatureTable, SkipReason> {
        self.schema.validate(&series.columns)?;

        let mut samples = series.samples.clone();
        samples.sort_by_key(|s| s.timestamp);
        self.check_sampling(&samples)?;

        let mut accumulator = RollingAccumulator::new(self.features.clone());
        let mut reducer = BinReducer::new(self.config.bin_width(), self.features.len());
        let mut bins = Vec::new();

        for sample in samples {
            for filled in accumulator.push(sample) {
                bins.extend(reducer.push(&filled));
            }
        }
        for filled in accumulator.finish() {
            bins.extend(reducer.push(&filled));
        }
        bins.extend(reducer.finish());

        if bins.is_empty() {
            return Err(SkipReason::EmptyFeatures);
        }
        debug!("{}: {} feature windows", user_id, bins.len());

        let rows = bins
            .into_iter()
            .map(|bin| FeatureWindow {
                user_id: user_id.to_string(),
                timestamp: bin.start,
                is_sleeping: false,
                values: bin.values,
            })
            .collect();
        Ok(FeatureTable {
            user_id: user_id.to_string(),
            columns: self.columns(),
            rows,
        })
    }

    // Bins must be at least as wide as the typical sample spacing.
    fn check_sampling(&self, samples: &[MergedSample]) -> Result<(), SkipReason> {
        let mut gaps: Vec<i64> = samples
            .windows(2)
            .map(|w| (w[1].timestamp - w[0].timestamp).num_milliseconds())
            .filter(|gap| *gap > 0)
            .collect();
        if gaps.is_empty() {
            return Ok(());
        }
        gaps.sort_unstable();
        let median_ms = gaps[gaps.len() / 2];
        if self.config.bin_width().num_milliseconds() < median_ms {
            return Err(SkipReason::BinNarrowerThanSampling {
                bin_seconds: self.config.bin_seconds,
                native_seconds: (median_ms + 999) / 1000,
            });
        }
        Ok(())
    }
}
