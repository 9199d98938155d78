use crate::config::RecordingCalendar;
use crate::data_loading::{self, UserSignals};
use crate::error::SkipReason;
use crate::{ActivitySample, HeartIntervalSample, MergedSample, MergedSeries, Signal};
use chrono::{DateTime, Utc};
use log::{debug, trace};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

/// Interval-derived heart rate on a uniform 1-second grid.
///
/// Slots between the first and last observed second are filled by linear
/// interpolation; nothing outside that range is represented.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SecondGrid {
    start: i64,
    values: Vec<Option<f64>>,
}

impl SecondGrid {
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// First covered second, if any.
    pub fn start(&self) -> Option<DateTime<Utc>> {
        if self.values.is_empty() {
            None
        } else {
            DateTime::from_timestamp(self.start, 0)
        }
    }

    /// Exact lookup: only whole-second timestamps inside the grid match.
    pub fn get(&self, t: DateTime<Utc>) -> Option<f64> {
        if t.timestamp_subsec_nanos() != 0 {
            return None;
        }
        let offset = t.timestamp().checked_sub(self.start)?;
        if offset < 0 {
            return None;
        }
        self.values.get(offset as usize).copied().flatten()
    }
}

/// Converts intervals to beats per minute after dropping repeated timestamps
/// (first occurrence wins). Intervals that cannot yield a finite positive
/// rate are discarded.
pub fn instantaneous_rates(intervals: &[HeartIntervalSample]) -> Vec<(DateTime<Utc>, f64)> {
    let mut seen = HashSet::with_capacity(intervals.len());
    let mut rates = Vec::with_capacity(intervals.len());
    let mut duplicates = 0usize;

    for sample in intervals {
        if !seen.insert(sample.timestamp) {
            duplicates += 1;
            continue;
        }
        if !(sample.ibi_s > 0.0 && sample.ibi_s.is_finite()) {
            trace!("Dropping unusable interval {} at {}", sample.ibi_s, sample.timestamp);
            continue;
        }
        rates.push((sample.timestamp, sample.bpm()));
    }

    if duplicates > 0 {
        debug!("Dropped {} duplicate interval timestamps", duplicates);
    }
    rates
}

/// Averages rates falling in the same second and interpolates the empty
/// seconds between the earliest and latest observation.
pub fn resample_per_second(rates: &[(DateTime<Utc>, f64)]) -> SecondGrid {
    let mut bins: BTreeMap<i64, (f64, usize)> = BTreeMap::new();
    for (t, bpm) in rates {
        let slot = bins.entry(t.timestamp()).or_insert((0.0, 0));
        slot.0 += bpm;
        slot.1 += 1;
    }

    let (Some(&first), Some(&last)) = (bins.keys().next(), bins.keys().next_back()) else {
        return SecondGrid::default();
    };

    let mut values = vec![None; (last - first + 1) as usize];
    for (second, (sum, count)) in &bins {
        values[(second - first) as usize] = Some(sum / *count as f64);
    }
    interpolate_interior(&mut values);

    SecondGrid {
        start: first,
        values,
    }
}

// Both ends of the grid are always observed, so every gap has two anchors.
fn interpolate_interior(values: &mut [Option<f64>]) {
    let mut prev: Option<(usize, f64)> = None;
    let mut i = 0;
    while i < values.len() {
        match values[i] {
            Some(v) => {
                prev = Some((i, v));
                i += 1;
            }
            None => {
                let next = (i..values.len()).find_map(|j| values[j].map(|v| (j, v)));
                match (prev, next) {
                    (Some((i0, v0)), Some((i1, v1))) => {
                        let span = (i1 - i0) as f64;
                        for (k, slot) in values.iter_mut().enumerate().take(i1).skip(i) {
                            let weight = (k - i0) as f64 / span;
                            *slot = Some(v0 + (v1 - v0) * weight);
                        }
                        i = i1;
                    }
                    _ => break,
                }
            }
        }
    }
}

/// Left-joins the per-second rate onto the activity timeline. The timeline is
/// deduplicated (first row wins) and sorted, and activity timestamps without an
/// exact grid match carry no rate.
pub fn merge_signals(
    intervals: &[HeartIntervalSample],
    activity_columns: BTreeSet<Signal>,
    activity: &[ActivitySample],
) -> MergedSeries {
    let grid = resample_per_second(&instantaneous_rates(intervals));
    debug!(
        "Rate grid covers {} seconds starting {:?}",
        grid.len(),
        grid.start()
    );

    let mut seen = HashSet::with_capacity(activity.len());
    let mut samples: Vec<MergedSample> = activity
        .iter()
        .filter(|a| seen.insert(a.timestamp))
        .map(|a| MergedSample {
            timestamp: a.timestamp,
            heart_rate: a.heart_rate,
            vector_magnitude: a.vector_magnitude,
            steps: a.steps,
            bpm: grid.get(a.timestamp),
        })
        .collect();
    samples.sort_by_key(|s| s.timestamp);

    MergedSeries {
        columns: activity_columns,
        samples,
    }
}

/// Loads and merges one user's raw streams. Unreadable or absent raw files
/// mean there is no data for the user.
pub fn merge_user(user_dir: &Path, calendar: &RecordingCalendar) -> Result<MergedSeries, SkipReason> {
    let UserSignals {
        heart_intervals,
        activity_columns,
        activity,
    } = data_loading::load_user_signals(user_dir, calendar)
        .map_err(|e| SkipReason::MissingRawData(format!("{:#}", e)))?;

    let merged = merge_signals(&heart_intervals, activity_columns, &activity);
    if merged.is_empty() {
        return Err(SkipReason::EmptyMerge);
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_672_567_200 + secs, 0).unwrap()
    }

    fn ibi(secs: i64, ibi_s: f64) -> HeartIntervalSample {
        HeartIntervalSample {
            timestamp: at(secs),
            ibi_s,
        }
    }

    fn act(secs: i64, hr: f64) -> ActivitySample {
        ActivitySample {
            timestamp: at(secs),
            heart_rate: Some(hr),
            vector_magnitude: Some(1.0),
            steps: Some(0.0),
        }
    }

    #[test]
    fn duplicate_interval_timestamps_keep_first_value() {
        let rates = instantaneous_rates(&[ibi(0, 1.0), ibi(0, 0.5), ibi(1, 0.8)]);
        assert_eq!(rates.len(), 2);
        assert_eq!(rates[0], (at(0), 60.0));

        let merged = merge_signals(
            &[ibi(0, 1.0), ibi(0, 0.5)],
            BTreeSet::from(Signal::REQUIRED),
            &[act(0, 70.0)],
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.samples[0].bpm, Some(60.0));
    }

    #[test]
    fn rate_is_sixty_over_interval() {
        let intervals = [ibi(0, 0.8), ibi(1, 1.2), ibi(2, 0.6667)];
        for ((_, bpm), sample) in instantaneous_rates(&intervals).iter().zip(&intervals) {
            assert!((bpm - 60.0 / sample.ibi_s).abs() < 1e-12);
        }
    }

    #[test]
    fn unusable_intervals_are_dropped() {
        let rates = instantaneous_rates(&[ibi(0, 0.0), ibi(1, -0.5), ibi(2, 1.0)]);
        assert_eq!(rates, vec![(at(2), 60.0)]);
    }

    #[test]
    fn same_second_values_are_averaged() {
        let half = at(0) + Duration::milliseconds(500);
        let grid = resample_per_second(&[(at(0), 60.0), (half, 80.0)]);
        assert_eq!(grid.len(), 1);
        assert_eq!(grid.get(at(0)), Some(70.0));
        assert_eq!(grid.get(half), None);
    }

    #[test]
    fn interior_gaps_interpolate_without_extrapolation() {
        let grid = resample_per_second(&[(at(10), 60.0), (at(14), 80.0)]);
        assert_eq!(grid.len(), 5);
        assert_eq!(grid.get(at(11)), Some(65.0));
        assert_eq!(grid.get(at(13)), Some(75.0));
        assert_eq!(grid.get(at(9)), None);
        assert_eq!(grid.get(at(15)), None);
    }

    #[test]
    fn unmatched_activity_rows_have_no_rate() {
        let merged = merge_signals(
            &[ibi(5, 1.0), ibi(7, 0.5)],
            BTreeSet::from(Signal::REQUIRED),
            &[act(8, 61.0), act(4, 60.0), act(6, 62.0), act(4, 99.0)],
        );
        let rows: Vec<(DateTime<Utc>, Option<f64>, Option<f64>)> = merged
            .samples
            .iter()
            .map(|s| (s.timestamp, s.heart_rate, s.bpm))
            .collect();
        assert_eq!(
            rows,
            vec![
                (at(4), Some(60.0), None),
                (at(6), Some(62.0), Some(90.0)),
                (at(8), Some(61.0), None),
            ]
        );
    }

    #[test]
    fn missing_user_files_mean_no_data() {
        let dir = tempfile::tempdir().unwrap();
        let err = merge_user(dir.path(), &RecordingCalendar::default()).unwrap_err();
        assert!(matches!(err, SkipReason::MissingRawData(_)));
    }
}
