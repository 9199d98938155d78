use crate::builder::BuildReport;
use crate::dataset::{Dataset, LABEL_COLUMN, TIMESTAMP_COLUMN, USER_COLUMN};
use crate::error::PipelineError;
use crate::{MergedSample, MergedSeries, Signal};
use arrow::array::{ArrayRef, BooleanArray, Float64Array, StringArray, TimestampMillisecondArray};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::ipc::writer::FileWriter;
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use log::info;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetFormat {
    Csv,
    ArrowIpc,
}

impl DatasetFormat {
    /// `.feather`/`.arrow`/`.ipc` select Arrow IPC, anything else CSV.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|s| s.to_str()) {
            Some("feather") | Some("arrow") | Some("ipc") => DatasetFormat::ArrowIpc,
            _ => DatasetFormat::Csv,
        }
    }
}

/// Creates (or truncates) `path`, creating parent directories as needed.
pub fn create_output(path: &Path) -> Result<File, PipelineError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|e| PipelineError::io(dir, e))?;
    }
    File::create(path).map_err(|e| PipelineError::io(path, e))
}

fn format_timestamp(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S%.f").to_string()
}

fn format_value(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Writes a merged per-user table. Signal columns absent from the source are
/// left out so a re-read sees the same schema.
pub fn write_merged_csv(path: &Path, series: &MergedSeries) -> Result<(), PipelineError> {
    let file = create_output(path)?;
    let mut writer = csv::Writer::from_writer(file);

    let signals: Vec<Signal> = Signal::REQUIRED
        .into_iter()
        .filter(|s| series.columns.contains(s))
        .collect();

    let mut header = vec![TIMESTAMP_COLUMN];
    header.extend(signals.iter().map(|s| s.column()));
    header.push("bpm");
    writer.write_record(&header)?;

    for sample in &series.samples {
        let mut record = vec![format_timestamp(sample.timestamp)];
        record.extend(signals.iter().map(|s| format_value(signal_cell(sample, *s))));
        record.push(format_value(sample.bpm));
        writer.write_record(&record)?;
    }

    writer.flush().map_err(|e| PipelineError::io(path, e))?;
    info!("Merged data saved: {}", path.display());
    Ok(())
}

fn signal_cell(sample: &MergedSample, signal: Signal) -> Option<f64> {
    match signal {
        Signal::HeartRate => sample.heart_rate,
        Signal::VectorMagnitude => sample.vector_magnitude,
        Signal::Steps => sample.steps,
    }
}

pub fn write_dataset(path: &Path, dataset: &Dataset) -> Result<DatasetFormat, PipelineError> {
    let format = DatasetFormat::from_path(path);
    match format {
        DatasetFormat::Csv => write_dataset_csv(path, dataset)?,
        DatasetFormat::ArrowIpc => write_dataset_ipc(path, dataset)?,
    }
    info!("Full dataset saved to {} ({} rows)", path.display(), dataset.len());
    Ok(format)
}

pub fn write_dataset_csv(path: &Path, dataset: &Dataset) -> Result<(), PipelineError> {
    let file = create_output(path)?;
    let mut writer = csv::Writer::from_writer(file);

    let mut header = vec![TIMESTAMP_COLUMN, USER_COLUMN, LABEL_COLUMN];
    header.extend(dataset.columns.iter().map(String::as_str));
    writer.write_record(&header)?;

    for row in &dataset.rows {
        let mut record = vec![
            format_timestamp(row.timestamp),
            row.user_id.clone(),
            row.is_sleeping.to_string(),
        ];
        record.extend(row.values.iter().map(|v| format_value(*v)));
        writer.write_record(&record)?;
    }

    writer.flush().map_err(|e| PipelineError::io(path, e))?;
    Ok(())
}

/// Writes the dataset as a single-batch Arrow IPC file (Feather v2).
pub fn write_dataset_ipc(path: &Path, dataset: &Dataset) -> Result<(), PipelineError> {
    let mut fields = vec![
        Field::new(
            TIMESTAMP_COLUMN,
            DataType::Timestamp(TimeUnit::Millisecond, None),
            false,
        ),
        Field::new(USER_COLUMN, DataType::Utf8, false),
        Field::new(LABEL_COLUMN, DataType::Boolean, false),
    ];
    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(TimestampMillisecondArray::from(
            dataset
                .rows
                .iter()
                .map(|r| r.timestamp.timestamp_millis())
                .collect::<Vec<i64>>(),
        )),
        Arc::new(StringArray::from(
            dataset
                .rows
                .iter()
                .map(|r| r.user_id.as_str())
                .collect::<Vec<&str>>(),
        )),
        Arc::new(BooleanArray::from(
            dataset.rows.iter().map(|r| r.is_sleeping).collect::<Vec<bool>>(),
        )),
    ];

    for (i, name) in dataset.columns.iter().enumerate() {
        fields.push(Field::new(name.as_str(), DataType::Float64, true));
        columns.push(Arc::new(Float64Array::from(
            dataset
                .rows
                .iter()
                .map(|r| r.values.get(i).copied().flatten())
                .collect::<Vec<Option<f64>>>(),
        )));
    }

    let schema = Arc::new(Schema::new(fields));
    let batch = RecordBatch::try_new(schema.clone(), columns)?;

    let file = create_output(path)?;
    let mut writer = FileWriter::try_new(file, &schema)?;
    writer.write(&batch)?;
    writer.finish()?;
    Ok(())
}

pub fn write_report(path: &Path, report: &BuildReport) -> Result<(), PipelineError> {
    let file = create_output(path)?;
    serde_json::to_writer_pretty(file, report)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_loading::read_merged_csv;
    use crate::dataset::{FeatureTable, FeatureWindow};
    use arrow::ipc::reader::FileReaderBuilder;
    use std::collections::BTreeSet;
    use tempfile::tempdir;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_672_567_200 + secs, 0).unwrap()
    }

    fn dataset() -> Dataset {
        Dataset::concat(vec![FeatureTable {
            user_id: "user_1".to_string(),
            columns: vec!["hr_mean".to_string(), "hr_std".to_string()],
            rows: vec![
                FeatureWindow {
                    user_id: "user_1".to_string(),
                    timestamp: at(0),
                    is_sleeping: true,
                    values: vec![Some(61.5), None],
                },
                FeatureWindow {
                    user_id: "user_1".to_string(),
                    timestamp: at(60),
                    is_sleeping: false,
                    values: vec![Some(70.0), Some(1.25)],
                },
            ],
        }])
    }

    #[test]
    fn merged_table_keeps_its_schema() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("processed").join("user_1.csv");
        let series = MergedSeries {
            columns: BTreeSet::from([Signal::HeartRate, Signal::VectorMagnitude]),
            samples: vec![MergedSample {
                timestamp: at(0),
                heart_rate: Some(60.0),
                vector_magnitude: None,
                steps: None,
                bpm: Some(62.5),
            }],
        };

        write_merged_csv(&path, &series).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "timestamp,HR,Vector Magnitude,bpm\n2023-01-01 10:00:00,60,,62.5\n"
        );
        assert_eq!(read_merged_csv(&path).unwrap(), series);
    }

    #[test]
    fn dataset_csv_layout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("all_users.csv");
        assert_eq!(write_dataset(&path, &dataset()).unwrap(), DatasetFormat::Csv);

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "timestamp,user_id,is_sleeping,hr_mean,hr_std\n\
             2023-01-01 10:00:00,user_1,true,61.5,\n\
             2023-01-01 10:01:00,user_1,false,70,1.25\n"
        );
    }

    #[test]
    fn dataset_ipc_round_trips_schema() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("all_users.feather");
        assert_eq!(write_dataset(&path, &dataset()).unwrap(), DatasetFormat::ArrowIpc);

        let reader = FileReaderBuilder::new().build(File::open(&path).unwrap()).unwrap();
        let names: Vec<String> = reader
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();
        assert_eq!(names, vec!["timestamp", "user_id", "is_sleeping", "hr_mean", "hr_std"]);
        let rows: usize = reader.map(|batch| batch.unwrap().num_rows()).sum();
        assert_eq!(rows, 2);
    }
}
