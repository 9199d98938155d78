use crate::config::RecordingCalendar;
use crate::data_loading::{self, SLEEP_FILE};
use crate::dataset::FeatureTable;
use crate::error::SkipReason;
use crate::SleepInterval;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;

/// Where a user's labels came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "source", content = "sessions", rename_all = "snake_case")]
pub enum LabelSource {
    /// Labeled against this many recorded sessions.
    Sessions(usize),
    /// No session file; every window is labeled awake.
    Missing,
}

/// True if any session contains `t`, bounds included. Sessions may be
/// unsorted or overlapping.
pub fn is_sleeping(t: DateTime<Utc>, sessions: &[SleepInterval]) -> bool {
    sessions.iter().any(|session| session.contains(t))
}

/// Sets `is_sleeping` on every window. Without sessions every window is
/// labeled awake.
pub fn label_windows(table: &mut FeatureTable, sessions: Option<&[SleepInterval]>) -> LabelSource {
    match sessions {
        Some(sessions) => {
            for row in &mut table.rows {
                row.is_sleeping = is_sleeping(row.timestamp, sessions);
            }
            LabelSource::Sessions(sessions.len())
        }
        None => {
            for row in &mut table.rows {
                row.is_sleeping = false;
            }
            LabelSource::Missing
        }
    }
}

/// Reads the user's session file. An absent file is `Ok(None)`; a file that
/// exists but cannot be parsed is a soft skip.
pub fn load_sessions(
    user_dir: &Path,
    calendar: &RecordingCalendar,
) -> Result<Option<Vec<SleepInterval>>, SkipReason> {
    let path = user_dir.join(SLEEP_FILE);
    if !path.is_file() {
        return Ok(None);
    }
    data_loading::read_sleep_sessions(&path, calendar)
        .map(Some)
        .map_err(|e| SkipReason::InvalidSleepSessions(format!("{:#}", e)))
}
