use pretty_assertions::assert_eq;
use sleep_features::builder::UserStatus;
use sleep_features::labeling::LabelSource;
use sleep_features::{
    DatasetBuilder, LogObserver, PipelineConfig, PipelineError, Signal, SkipReason,
};
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

const SECONDS: u32 = 600;

fn clock(offset: u32) -> String {
    let t = 22 * 3600 + offset;
    format!("{:02}:{:02}:{:02}", t / 3600, t / 60 % 60, t % 60)
}

struct Fixture {
    _dir: TempDir,
    root: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        fs::create_dir_all(root.join("raw")).unwrap();
        Fixture { _dir: dir, root }
    }

    fn raw(&self) -> PathBuf {
        self.root.join("raw")
    }

    fn config(&self) -> PipelineConfig {
        PipelineConfig::new(
            self.raw(),
            self.root.join("processed"),
            self.root.join("features").join("all_users.csv"),
        )
    }

    fn add_user(&self, user: &str, with_steps: bool, with_sleep: bool) -> PathBuf {
        let dir = self.raw().join(user);
        fs::create_dir_all(&dir).unwrap();

        let mut rr = String::from(",ibi_s,day,time\n");
        for i in (0..SECONDS).step_by(2) {
            let ibi = 0.8 + 0.01 * ((i / 2) % 5) as f64;
            rr.push_str(&format!("{},{},1,{}\n", i, ibi, clock(i)));
        }
        fs::write(dir.join("RR.csv"), rr).unwrap();

        let mut act = if with_steps {
            String::from(",Axis1,Steps,HR,Vector Magnitude,day,time\n")
        } else {
            String::from(",Axis1,HR,Vector Magnitude,day,time\n")
        };
        for i in 0..SECONDS {
            let hr = 60 + i % 7;
            let vm = (i % 13) as f64 * 1.5;
            let steps = u32::from(i % 3 == 0);
            if with_steps {
                act.push_str(&format!("{},0,{},{},{},1,{}\n", i, steps, hr, vm, clock(i)));
            } else {
                act.push_str(&format!("{},0,{},{},1,{}\n", i, hr, vm, clock(i)));
            }
        }
        fs::write(dir.join("Actigraph.csv"), act).unwrap();

        if with_sleep {
            fs::write(
                dir.join("sleep.csv"),
                ",In Bed Date,In Bed Time,Out Bed Date,Out Bed Time,Onset Date,Onset Time\n\
                 0,1,22:03,1,22:06,1,22:04\n",
            )
            .unwrap();
        }
        dir
    }
}

fn labels_for(dataset: &sleep_features::Dataset, user: &str) -> Vec<bool> {
    dataset
        .rows
        .iter()
        .filter(|r| r.user_id == user)
        .map(|r| r.is_sleeping)
        .collect()
}

#[test]
fn no_user_directories_is_fatal() {
    let fixture = Fixture::new();
    fs::create_dir_all(fixture.raw().join("calibration")).unwrap();

    let err = DatasetBuilder::new(fixture.config())
        .run(&mut LogObserver)
        .unwrap_err();
    assert!(matches!(err, PipelineError::NoUserDirectories(_)));
    assert!(!fixture.root.join("features").join("all_users.csv").exists());
}

#[test]
fn missing_raw_root_is_fatal() {
    let fixture = Fixture::new();
    let mut config = fixture.config();
    config.raw_dir = fixture.root.join("does-not-exist");

    let err = DatasetBuilder::new(config).run(&mut LogObserver).unwrap_err();
    assert!(matches!(err, PipelineError::NoUserDirectories(_)));
}

#[test]
fn every_user_skipped_is_fatal() {
    let fixture = Fixture::new();
    fs::create_dir_all(fixture.raw().join("user_1")).unwrap();
    fs::create_dir_all(fixture.raw().join("user_2")).unwrap();

    let err = DatasetBuilder::new(fixture.config())
        .run(&mut LogObserver)
        .unwrap_err();
    assert!(matches!(err, PipelineError::NoValidUsers { checked: 2 }));
}

#[test]
fn user_without_sessions_is_labeled_awake() {
    let fixture = Fixture::new();
    fixture.add_user("user_1", true, true);
    fixture.add_user("user_2", true, false);

    let outcome = DatasetBuilder::new(fixture.config())
        .run(&mut LogObserver)
        .unwrap();
    let dataset = &outcome.dataset;

    assert_eq!(dataset.user_ids(), vec!["user_1", "user_2"]);
    assert_eq!(
        labels_for(dataset, "user_1"),
        vec![false, false, false, true, true, true, true, false, false, false]
    );
    assert_eq!(labels_for(dataset, "user_2"), vec![false; 10]);

    assert_eq!(
        outcome.report.status("user_1"),
        Some(&UserStatus::Included {
            rows: 10,
            labels: LabelSource::Sessions(1)
        })
    );
    assert_eq!(
        outcome.report.status("user_2"),
        Some(&UserStatus::Included {
            rows: 10,
            labels: LabelSource::Missing
        })
    );
}

#[test]
fn user_missing_steps_is_skipped_and_run_continues() {
    let fixture = Fixture::new();
    fixture.add_user("user_1", true, true);
    fixture.add_user("user_3", false, true);

    let outcome = DatasetBuilder::new(fixture.config())
        .run(&mut LogObserver)
        .unwrap();

    assert_eq!(outcome.dataset.user_ids(), vec!["user_1"]);
    let skipped: Vec<(&str, &SkipReason)> = outcome.report.skipped().collect();
    assert_eq!(
        skipped,
        vec![(
            "user_3",
            &SkipReason::MissingSignals(BTreeSet::from([Signal::Steps]))
        )]
    );

    let report = fs::read_to_string(fixture.root.join("features").join("build_report.json"))
        .unwrap();
    assert!(report.contains("missing_signals"));
}

#[test]
fn dataset_columns_and_step_totals() {
    let fixture = Fixture::new();
    fixture.add_user("user_1", true, true);

    let outcome = DatasetBuilder::new(fixture.config())
        .run(&mut LogObserver)
        .unwrap();
    let dataset = &outcome.dataset;

    assert_eq!(dataset.columns.len(), 11);
    let steps = dataset.column_index("steps_sum").unwrap();
    let total: f64 = dataset.rows.iter().filter_map(|r| r.values[steps]).sum();
    assert_eq!(total, f64::from(SECONDS / 3));

    let csv = fs::read_to_string(fixture.root.join("features").join("all_users.csv")).unwrap();
    let header = csv.lines().next().unwrap();
    assert!(header.starts_with("timestamp,user_id,is_sleeping,hr_mean,hr_std"));
    assert_eq!(csv.lines().count(), 11);
    assert!(csv.lines().nth(1).unwrap().starts_with("2023-01-01 22:00:00,user_1,false,"));
}

#[test]
fn merged_table_is_persisted_per_user() {
    let fixture = Fixture::new();
    fixture.add_user("user_1", true, false);

    DatasetBuilder::new(fixture.config())
        .run(&mut LogObserver)
        .unwrap();

    let merged = sleep_features::data_loading::read_merged_csv(
        &fixture.root.join("processed").join("user_1.csv"),
    )
    .unwrap();
    assert_eq!(merged.len(), SECONDS as usize);
    assert_eq!(
        merged.columns,
        Signal::REQUIRED.into_iter().collect::<BTreeSet<Signal>>()
    );
    // 22:00:00 has ibi 0.8, 22:00:01 sits halfway to the 0.81 sample
    assert!((merged.samples[0].bpm.unwrap() - 75.0).abs() < 1e-9);
    let halfway = (75.0 + 60.0 / 0.81) / 2.0;
    assert!((merged.samples[1].bpm.unwrap() - halfway).abs() < 1e-9);
    // the interval stream ends at 22:09:58
    assert_eq!(merged.samples.last().unwrap().bpm, None);
}

#[test]
fn rerunning_produces_identical_output() {
    let fixture = Fixture::new();
    fixture.add_user("user_1", true, true);
    fixture.add_user("user_2", true, false);

    let output = fixture.root.join("features").join("all_users.csv");
    let first = DatasetBuilder::new(fixture.config())
        .run(&mut LogObserver)
        .unwrap();
    let first_bytes = fs::read(&output).unwrap();

    let second = DatasetBuilder::new(fixture.config())
        .run(&mut LogObserver)
        .unwrap();
    let second_bytes = fs::read(&output).unwrap();

    assert_eq!(first.dataset, second.dataset);
    assert_eq!(first_bytes, second_bytes);
}

#[test]
fn arrow_output_is_selected_by_extension() {
    let fixture = Fixture::new();
    fixture.add_user("user_1", true, true);
    let mut config = fixture.config();
    config.output = fixture.root.join("features").join("all_users.feather");

    DatasetBuilder::new(config).run(&mut LogObserver).unwrap();

    let bytes = fs::read(fixture.root.join("features").join("all_users.feather")).unwrap();
    assert!(bytes.starts_with(b"ARROW1"));
    assert!(fixture.root.join("features").join("build_report.json").exists());
}
