use crate::config::RecordingCalendar;
use crate::{ActivitySample, HeartIntervalSample, MergedSample, MergedSeries, Signal, SleepInterval};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use csv::StringRecord;
use log::{debug, trace, warn};
use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};

pub const HEART_INTERVAL_FILE: &str = "RR.csv";
pub const ACTIVITY_FILE: &str = "Actigraph.csv";
pub const SLEEP_FILE: &str = "sleep.csv";

const IBI_COLUMN: &str = "ibi_s";
const IN_BED_DATE: &str = "In Bed Date";
const IN_BED_TIME: &str = "In Bed Time";
const OUT_BED_DATE: &str = "Out Bed Date";
const OUT_BED_TIME: &str = "Out Bed Time";

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserDir {
    pub user_id: String,
    pub path: PathBuf,
}

/// Raw streams for one user, as read from disk.
#[derive(Debug, Clone)]
pub struct UserSignals {
    pub heart_intervals: Vec<HeartIntervalSample>,
    pub activity_columns: BTreeSet<Signal>,
    pub activity: Vec<ActivitySample>,
}

/// Lists the user directories under `raw_dir` whose name starts with `prefix`,
/// in natural order (`user_2` before `user_10`). A missing root yields an
/// empty list.
pub fn discover_user_dirs(raw_dir: &Path, prefix: &str) -> Result<Vec<UserDir>> {
    if !raw_dir.is_dir() {
        warn!("Raw data directory {} does not exist", raw_dir.display());
        return Ok(Vec::new());
    }

    let mut users = Vec::new();
    for entry in std::fs::read_dir(raw_dir)
        .with_context(|| format!("Failed to list {}", raw_dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if name.starts_with(prefix) {
            debug!("Found user directory: {}", path.display());
            users.push(UserDir {
                user_id: name.to_string(),
                path,
            });
        }
    }

    users.sort_by(|a, b| natural_key(&a.user_id, prefix).cmp(&natural_key(&b.user_id, prefix)));
    Ok(users)
}

fn natural_key<'a>(user_id: &'a str, prefix: &str) -> (u8, u64, &'a str) {
    match user_id[prefix.len()..].parse::<u64>() {
        Ok(n) => (0, n, user_id),
        Err(_) => (1, 0, user_id),
    }
}

/// Reads both signal files of a user directory.
pub fn load_user_signals(user_dir: &Path, calendar: &RecordingCalendar) -> Result<UserSignals> {
    let heart_intervals = read_heart_intervals(&user_dir.join(HEART_INTERVAL_FILE), calendar)?;
    let (activity_columns, activity) = read_activity(&user_dir.join(ACTIVITY_FILE), calendar)?;
    Ok(UserSignals {
        heart_intervals,
        activity_columns,
        activity,
    })
}

pub fn read_heart_intervals(
    path: &Path,
    calendar: &RecordingCalendar,
) -> Result<Vec<HeartIntervalSample>> {
    let mut rdr = open_csv(path)?;
    let headers = rdr.headers()?.clone();
    let clock = TimestampColumns::locate(&headers)
        .with_context(|| format!("No timestamp columns in {}", path.display()))?;
    let ibi_idx = column_index(&headers, IBI_COLUMN)
        .ok_or_else(|| anyhow!("Column '{}' missing in {}", IBI_COLUMN, path.display()))?;

    let mut samples = Vec::new();
    for (row, result) in rdr.records().enumerate() {
        let record = result?;
        let context = || format!("{} row {}", path.display(), row + 1);
        let Some(ibi_s) = parse_value(record.get(ibi_idx)).with_context(context)? else {
            trace!("Skipping blank interval at {}", context());
            continue;
        };
        let timestamp = clock.resolve(&record, calendar).with_context(context)?;
        samples.push(HeartIntervalSample { timestamp, ibi_s });
    }

    debug!("Read {} heart intervals from {}", samples.len(), path.display());
    Ok(samples)
}

/// Reads the actigraphy file. Returns the required signals that have a column
/// in the file along with the samples; absent signals read as `None`.
pub fn read_activity(
    path: &Path,
    calendar: &RecordingCalendar,
) -> Result<(BTreeSet<Signal>, Vec<ActivitySample>)> {
    let mut rdr = open_csv(path)?;
    let headers = rdr.headers()?.clone();
    let clock = TimestampColumns::locate(&headers)
        .with_context(|| format!("No timestamp columns in {}", path.display()))?;
    let signal_idx = SignalColumns::locate(&headers);

    let mut samples = Vec::new();
    for (row, result) in rdr.records().enumerate() {
        let record = result?;
        let context = || format!("{} row {}", path.display(), row + 1);
        let timestamp = clock.resolve(&record, calendar).with_context(context)?;
        samples.push(ActivitySample {
            timestamp,
            heart_rate: signal_idx.read(&record, Signal::HeartRate).with_context(context)?,
            vector_magnitude: signal_idx
                .read(&record, Signal::VectorMagnitude)
                .with_context(context)?,
            steps: signal_idx.read(&record, Signal::Steps).with_context(context)?,
        });
    }

    debug!("Read {} activity rows from {}", samples.len(), path.display());
    Ok((signal_idx.present(), samples))
}

/// Reads in-bed/out-bed sessions. Each date cell goes through the recording
/// calendar, so both day indices and ISO dates are accepted.
pub fn read_sleep_sessions(path: &Path, calendar: &RecordingCalendar) -> Result<Vec<SleepInterval>> {
    let mut rdr = open_csv(path)?;
    let headers = rdr.headers()?.clone();
    let required = |name: &str| {
        column_index(&headers, name)
            .ok_or_else(|| anyhow!("Column '{}' missing in {}", name, path.display()))
    };
    let (in_date, in_time) = (required(IN_BED_DATE)?, required(IN_BED_TIME)?);
    let (out_date, out_time) = (required(OUT_BED_DATE)?, required(OUT_BED_TIME)?);

    let mut sessions = Vec::new();
    for (row, result) in rdr.records().enumerate() {
        let record = result?;
        let context = || format!("{} row {}", path.display(), row + 1);
        let start = calendar
            .resolve(cell(&record, in_date), cell(&record, in_time))
            .with_context(context)?;
        let end = calendar
            .resolve(cell(&record, out_date), cell(&record, out_time))
            .with_context(context)?;
        if end < start {
            warn!(
                "Sleep session at {} ends before it starts ({} > {})",
                context(),
                start.format(TIMESTAMP_FORMAT),
                end.format(TIMESTAMP_FORMAT)
            );
        }
        sessions.push(SleepInterval { start, end });
    }

    Ok(sessions)
}

/// Reads a merged table previously written by `output::write_merged_csv`.
pub fn read_merged_csv(path: &Path) -> Result<MergedSeries> {
    let mut rdr = open_csv(path)?;
    let headers = rdr.headers()?.clone();
    let ts_idx = column_index(&headers, "timestamp")
        .ok_or_else(|| anyhow!("Column 'timestamp' missing in {}", path.display()))?;
    let bpm_idx = column_index(&headers, "bpm");
    let signal_idx = SignalColumns::locate(&headers);

    let mut samples = Vec::new();
    for (row, result) in rdr.records().enumerate() {
        let record = result?;
        let context = || format!("{} row {}", path.display(), row + 1);
        let timestamp = parse_timestamp(cell(&record, ts_idx)).with_context(context)?;
        let bpm = match bpm_idx {
            Some(idx) => parse_value(record.get(idx)).with_context(context)?,
            None => None,
        };
        samples.push(MergedSample {
            timestamp,
            heart_rate: signal_idx.read(&record, Signal::HeartRate).with_context(context)?,
            vector_magnitude: signal_idx
                .read(&record, Signal::VectorMagnitude)
                .with_context(context)?,
            steps: signal_idx.read(&record, Signal::Steps).with_context(context)?,
            bpm,
        });
    }

    Ok(MergedSeries {
        columns: signal_idx.present(),
        samples,
    })
}

fn open_csv(path: &Path) -> Result<csv::Reader<File>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open file: {}", path.display()))?;
    Ok(csv::ReaderBuilder::new()
        .flexible(true) // Handle trailing commas
        .trim(csv::Trim::All)
        .from_reader(file))
}

fn column_index(headers: &StringRecord, name: &str) -> Option<usize> {
    headers.iter().position(|h| h.trim() == name)
}

fn cell(record: &StringRecord, idx: usize) -> &str {
    record.get(idx).unwrap_or("")
}

/// Blank and NaN cells are missing values rather than errors.
fn parse_value(cell: Option<&str>) -> Result<Option<f64>> {
    let Some(cell) = cell.map(str::trim) else {
        return Ok(None);
    };
    if cell.is_empty() || cell.eq_ignore_ascii_case("nan") {
        return Ok(None);
    }
    let value = cell
        .parse::<f64>()
        .map_err(|e| anyhow!("'{}' is not a number: {}", cell, e))?;
    Ok(value.is_finite().then_some(value))
}

/// Accepts `YYYY-MM-DD HH:MM:SS[.fff]`, the `T`-separated variant and RFC 3339.
pub fn parse_timestamp(cell: &str) -> Result<DateTime<Utc>> {
    let cell = cell.trim();
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(cell, format) {
            return Ok(dt.and_utc());
        }
    }
    DateTime::parse_from_rfc3339(cell)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| anyhow!("invalid timestamp '{}': {}", cell, e))
}

enum TimestampColumns {
    Single(usize),
    DayTime { day: usize, time: usize },
}

impl TimestampColumns {
    fn locate(headers: &StringRecord) -> Result<Self> {
        if let Some(idx) = column_index(headers, "timestamp") {
            return Ok(TimestampColumns::Single(idx));
        }
        match (column_index(headers, "day"), column_index(headers, "time")) {
            (Some(day), Some(time)) => Ok(TimestampColumns::DayTime { day, time }),
            _ => Err(anyhow!("expected a 'timestamp' column or 'day' and 'time' columns")),
        }
    }

    fn resolve(&self, record: &StringRecord, calendar: &RecordingCalendar) -> Result<DateTime<Utc>> {
        match *self {
            TimestampColumns::Single(idx) => parse_timestamp(cell(record, idx)),
            TimestampColumns::DayTime { day, time } => {
                calendar.resolve(cell(record, day), cell(record, time))
            }
        }
    }
}

struct SignalColumns {
    indices: [Option<usize>; 3],
}

impl SignalColumns {
    fn locate(headers: &StringRecord) -> Self {
        Self {
            indices: Signal::REQUIRED.map(|signal| column_index(headers, signal.column())),
        }
    }

    fn slot(signal: Signal) -> usize {
        match signal {
            Signal::HeartRate => 0,
            Signal::VectorMagnitude => 1,
            Signal::Steps => 2,
        }
    }

    fn read(&self, record: &StringRecord, signal: Signal) -> Result<Option<f64>> {
        match self.indices[Self::slot(signal)] {
            Some(idx) => parse_value(record.get(idx)),
            None => Ok(None),
        }
    }

    fn present(&self) -> BTreeSet<Signal> {
        Signal::REQUIRED
            .into_iter()
            .filter(|signal| self.indices[Self::slot(*signal)].is_some())
            .collect()
    }
}
