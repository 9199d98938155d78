//! Dataset orchestration across users.
//!
//! Each discovered user goes through merge → feature extraction → labeling.
//! Per-user problems are recorded and the user is skipped; only an empty raw
//! root or a run where every user was skipped is fatal.

use crate::config::PipelineConfig;
use crate::data_loading::{self, UserDir};
use crate::dataset::{Dataset, FeatureTable};
use crate::error::{PipelineError, SkipReason};
use crate::labeling::{self, LabelSource};
use crate::merge;
use crate::output;
use crate::preprocessing::WindowFeatureExtractor;
use crate::{MergedSeries, SleepInterval};
use log::{info, warn};
use serde::Serialize;
use std::path::PathBuf;

pub const REPORT_FILE: &str = "build_report.json";

/// Receives progress from a build. All methods default to no-ops.
pub trait PipelineObserver {
    fn user_started(&mut self, _user_id: &str) {}
    fn user_skipped(&mut self, _user_id: &str, _reason: &SkipReason) {}
    fn labels_missing(&mut self, _user_id: &str) {}
    fn user_included(&mut self, _user_id: &str, _rows: usize) {}
}

/// Reports progress through the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl PipelineObserver for LogObserver {
    fn user_started(&mut self, user_id: &str) {
        info!("Processing {}...", user_id);
    }

    fn user_skipped(&mut self, user_id: &str, reason: &SkipReason) {
        warn!("Skipping {} - {}", user_id, reason);
    }

    fn labels_missing(&mut self, user_id: &str) {
        warn!(
            "{} missing for {}, labeling all windows awake",
            data_loading::SLEEP_FILE,
            user_id
        );
    }

    fn user_included(&mut self, user_id: &str, rows: usize) {
        info!("Added {} feature windows for {}", rows, user_id);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UserStatus {
    Included { rows: usize, labels: LabelSource },
    Skipped { reason: SkipReason },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserOutcome {
    pub user_id: String,
    #[serde(flatten)]
    pub status: UserStatus,
}

/// Per-user diagnostics of one build, in processing order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BuildReport {
    pub users: Vec<UserOutcome>,
}

impl BuildReport {
    pub fn included(&self) -> impl Iterator<Item = &UserOutcome> {
        self.users
            .iter()
            .filter(|u| matches!(u.status, UserStatus::Included { .. }))
    }

    pub fn skipped(&self) -> impl Iterator<Item = (&str, &SkipReason)> {
        self.users.iter().filter_map(|u| match &u.status {
            UserStatus::Skipped { reason } => Some((u.user_id.as_str(), reason)),
            UserStatus::Included { .. } => None,
        })
    }

    pub fn status(&self, user_id: &str) -> Option<&UserStatus> {
        self.users
            .iter()
            .find(|u| u.user_id == user_id)
            .map(|u| &u.status)
    }
}

#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub dataset: Dataset,
    pub report: BuildReport,
}

/// Extracts and labels features for one user's merged series.
pub fn features_for_user(
    extractor: &WindowFeatureExtractor,
    user_id: &str,
    merged: &MergedSeries,
    sessions: Option<&[SleepInterval]>,
) -> Result<(FeatureTable, LabelSource), SkipReason> {
    let mut table = extractor.extract(user_id, merged)?;
    if table.is_empty() {
        return Err(SkipReason::EmptyFeatures);
    }
    let labels = labeling::label_windows(&mut table, sessions);
    Ok((table, labels))
}

pub struct DatasetBuilder {
    config: PipelineConfig,
    extractor: WindowFeatureExtractor,
}

impl DatasetBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        let extractor = WindowFeatureExtractor::new(config.features.clone());
        Self { config, extractor }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn merged_path(&self, user_id: &str) -> PathBuf {
        self.config.processed_dir.join(format!("{}.csv", user_id))
    }

    pub fn report_path(&self) -> PathBuf {
        self.config.output.with_file_name(REPORT_FILE)
    }

    /// Processes every user and concatenates the surviving tables. Writes the
    /// per-user merged tables but not the final dataset.
    pub fn build(&self, observer: &mut dyn PipelineObserver) -> Result<BuildOutcome, PipelineError> {
        let users =
            data_loading::discover_user_dirs(&self.config.raw_dir, &self.config.user_prefix)
                .map_err(PipelineError::Discovery)?;
        if users.is_empty() {
            return Err(PipelineError::NoUserDirectories(self.config.raw_dir.clone()));
        }

        let mut tables = Vec::new();
        let mut report = BuildReport::default();

        for user in &users {
            observer.user_started(&user.user_id);
            let status = match self.process_user(user)? {
                Ok((table, labels)) => {
                    if labels == LabelSource::Missing {
                        observer.labels_missing(&user.user_id);
                    }
                    let rows = table.rows.len();
                    observer.user_included(&user.user_id, rows);
                    tables.push(table);
                    UserStatus::Included { rows, labels }
                }
                Err(reason) => {
                    observer.user_skipped(&user.user_id, &reason);
                    UserStatus::Skipped { reason }
                }
            };
            report.users.push(UserOutcome {
                user_id: user.user_id.clone(),
                status,
            });
        }

        if tables.is_empty() {
            return Err(PipelineError::NoValidUsers {
                checked: users.len(),
            });
        }

        Ok(BuildOutcome {
            dataset: Dataset::concat(tables),
            report,
        })
    }

    /// `build`, then persist the dataset and the report.
    pub fn run(&self, observer: &mut dyn PipelineObserver) -> Result<BuildOutcome, PipelineError> {
        let outcome = self.build(observer)?;
        output::write_dataset(&self.config.output, &outcome.dataset)?;
        output::write_report(&self.report_path(), &outcome.report)?;
        Ok(outcome)
    }

    // Outer error: the run cannot continue. Inner error: skip this user.
    fn process_user(
        &self,
        user: &UserDir,
    ) -> Result<Result<(FeatureTable, LabelSource), SkipReason>, PipelineError> {
        let merged = match merge::merge_user(&user.path, &self.config.calendar) {
            Ok(merged) => merged,
            Err(reason) => return Ok(Err(reason)),
        };
        output::write_merged_csv(&self.merged_path(&user.user_id), &merged)?;

        let sessions = match labeling::load_sessions(&user.path, &self.config.calendar) {
            Ok(sessions) => sessions,
            Err(reason) => return Ok(Err(reason)),
        };

        Ok(features_for_user(
            &self.extractor,
            &user.user_id,
            &merged,
            sessions.as_deref(),
        ))
    }
}
