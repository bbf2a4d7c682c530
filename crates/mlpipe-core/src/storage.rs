//! Storage layer: Parquet metric history, YAML run records, file system management.
//!
//! Layout under a tracking root:
//!
//! ```text
//! experiments/<experiment>/experiment.yaml
//! experiments/<experiment>/<run_id>/{run,params,tags,inputs}.yaml
//! experiments/<experiment>/<run_id>/metrics.parquet
//! experiments/<experiment>/<run_id>/artifacts/...
//! registry/<model>.yaml
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, Float64Array, Int64Array, StringArray, TimestampMicrosecondArray,
};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::file::properties::WriterProperties;

use crate::error::Result;
use crate::models::{DatasetInput, ExperimentMetadata, MetricRow, MetricValue, RunMetadata};

pub const RUN_FILE: &str = "run.yaml";
pub const PARAMS_FILE: &str = "params.yaml";
pub const TAGS_FILE: &str = "tags.yaml";
pub const INPUTS_FILE: &str = "inputs.yaml";
pub const METRICS_FILE: &str = "metrics.parquet";
pub const LOG_FILE: &str = "run.log";
pub const ARTIFACTS_DIR: &str = "artifacts";

// ─── Directory helpers ────────────────────────────────────────────────────────

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub fn experiments_root(tracking_dir: &Path) -> PathBuf {
    tracking_dir.join("experiments")
}

pub fn registry_root(tracking_dir: &Path) -> PathBuf {
    tracking_dir.join("registry")
}

fn list_subdirs(dir: &Path) -> Result<Vec<String>> {
    if !dir.exists() {
        return Ok(vec![]);
    }
    let mut names = vec![];
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

pub fn list_experiments(tracking_dir: &Path) -> Result<Vec<String>> {
    list_subdirs(&experiments_root(tracking_dir))
}

/// Run ids of an experiment. Only directories holding a `run.yaml` count as runs.
pub fn list_runs(experiment_dir: &Path) -> Result<Vec<String>> {
    Ok(list_subdirs(experiment_dir)?
        .into_iter()
        .filter(|name| experiment_dir.join(name).join(RUN_FILE).exists())
        .collect())
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ArtifactInfo {
    pub path: String,
    pub size: u64,
}

pub fn list_artifacts(run_dir: &Path) -> Result<Vec<ArtifactInfo>> {
    let mut files = vec![];
    let artifacts_dir = run_dir.join(ARTIFACTS_DIR);
    if artifacts_dir.exists() {
        collect_files(&artifacts_dir, &artifacts_dir, &mut files)?;
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<ArtifactInfo>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else {
            let rel = path.strip_prefix(root).unwrap_or(&path);
            out.push(ArtifactInfo {
                path: rel.to_string_lossy().replace('\\', "/"),
                size: path.metadata()?.len(),
            });
        }
    }
    Ok(())
}

// ─── YAML / JSON I/O ─────────────────────────────────────────────────────────

pub fn save_yaml<T: serde::Serialize>(path: &Path, data: &T) -> Result<()> {
    let content = serde_yaml::to_string(data)?;
    fs::write(path, content)?;
    Ok(())
}

pub fn load_yaml<T>(path: &Path) -> Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    if !path.exists() {
        return Ok(T::default());
    }
    let content = fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(T::default());
    }
    Ok(serde_yaml::from_str(&content)?)
}

pub fn load_yaml_value(path: &Path) -> Result<serde_yaml::Value> {
    if !path.exists() {
        return Ok(serde_yaml::Value::Mapping(Default::default()));
    }
    let content = fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&content)?)
}

pub fn save_json<T: serde::Serialize>(path: &Path, data: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(data)?)?;
    Ok(())
}

pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

// ─── Run records ─────────────────────────────────────────────────────────────

pub fn save_run_metadata(run_dir: &Path, meta: &RunMetadata) -> Result<()> {
    save_yaml(&run_dir.join(RUN_FILE), meta)
}

pub fn load_run_metadata(run_dir: &Path) -> Result<RunMetadata> {
    let content = fs::read_to_string(run_dir.join(RUN_FILE))?;
    Ok(serde_yaml::from_str(&content)?)
}

pub fn load_params(run_dir: &Path) -> Result<BTreeMap<String, String>> {
    load_yaml(&run_dir.join(PARAMS_FILE))
}

pub fn load_tags(run_dir: &Path) -> Result<BTreeMap<String, String>> {
    load_yaml(&run_dir.join(TAGS_FILE))
}

pub fn load_inputs(run_dir: &Path) -> Result<Vec<DatasetInput>> {
    load_yaml(&run_dir.join(INPUTS_FILE))
}

/// Merge `entries` into the string map stored at `path`.
pub fn merge_string_map(path: &Path, entries: BTreeMap<String, String>) -> Result<()> {
    let mut existing: BTreeMap<String, String> = load_yaml(path)?;
    existing.extend(entries);
    save_yaml(path, &existing)
}

pub fn save_experiment_metadata(exp_dir: &Path, meta: &ExperimentMetadata) -> Result<()> {
    save_yaml(&exp_dir.join("experiment.yaml"), meta)
}

pub fn load_experiment_metadata(exp_dir: &Path) -> Result<ExperimentMetadata> {
    load_yaml(&exp_dir.join("experiment.yaml"))
}

// ─── Parquet metrics I/O ─────────────────────────────────────────────────────

/// Append metric rows to a Parquet file.
/// Strategy: read existing → concat → write back. Runs log a handful of rows,
/// so rewriting the file is acceptable.
pub fn append_metrics(path: &Path, rows: &[MetricRow]) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }

    let new_batch = rows_to_record_batch(rows)?;
    let final_batch = if path.exists() {
        let existing = read_parquet(path)?;
        concat_batches(&existing, &new_batch)?
    } else {
        new_batch
    };

    write_parquet(path, &final_batch)
}

/// Read all metrics from a Parquet file as a list of row maps.
pub fn read_metrics(path: &Path) -> Result<Vec<HashMap<String, serde_json::Value>>> {
    if !path.exists() {
        return Ok(vec![]);
    }
    let batch = read_parquet(path)?;
    record_batch_to_rows(&batch)
}

/// Latest value of every numeric metric column: the last non-null entry.
pub fn read_latest_scalar_metrics(path: &Path) -> Result<HashMap<String, f64>> {
    let mut latest = HashMap::new();
    for row in read_metrics(path)? {
        for (key, value) in row {
            if key == "step" || key == "timestamp" {
                continue;
            }
            if let Some(f) = value.as_f64() {
                latest.insert(key, f);
            }
        }
    }
    Ok(latest)
}

fn base_fields() -> Vec<Field> {
    vec![
        Field::new("step", DataType::Int64, true),
        Field::new(
            "timestamp",
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            false,
        ),
    ]
}

fn read_parquet(path: &Path) -> Result<RecordBatch> {
    let file = fs::File::open(path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let reader = builder.build()?;
    let mut batches = vec![];
    for batch in reader {
        batches.push(batch?);
    }
    match batches.len() {
        0 => Ok(RecordBatch::new_empty(Arc::new(Schema::new(base_fields())))),
        1 => Ok(batches.remove(0)),
        _ => {
            let schema = batches[0].schema();
            Ok(arrow::compute::concat_batches(&schema, &batches)?)
        }
    }
}

fn write_parquet(path: &Path, batch: &RecordBatch) -> Result<()> {
    let file = fs::File::create(path)?;
    let props = WriterProperties::builder()
        .set_compression(parquet::basic::Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;
    Ok(())
}

fn concat_batches(existing: &RecordBatch, new: &RecordBatch) -> Result<RecordBatch> {
    // New rows may introduce columns the file does not have yet
    let merged_schema = Arc::new(merge_schemas(existing.schema_ref(), new.schema_ref()));

    let existing_aligned = align_batch(existing, &merged_schema)?;
    let new_aligned = align_batch(new, &merged_schema)?;

    Ok(arrow::compute::concat_batches(
        &merged_schema,
        &[existing_aligned, new_aligned],
    )?)
}

fn merge_schemas(a: &Schema, b: &Schema) -> Schema {
    let mut fields: Vec<Field> = a.fields().iter().map(|f| f.as_ref().clone()).collect();
    for field in b.fields() {
        if a.field_with_name(field.name()).is_err() {
            fields.push(field.as_ref().clone());
        }
    }
    Schema::new(fields)
}

fn align_batch(batch: &RecordBatch, target_schema: &Arc<Schema>) -> Result<RecordBatch> {
    let n = batch.num_rows();
    let mut columns: Vec<ArrayRef> = vec![];

    for field in target_schema.fields() {
        if let Some(col) = batch.column_by_name(field.name()) {
            columns.push(col.clone());
        } else {
            let null_array: ArrayRef = match field.data_type() {
                DataType::Float64 => Arc::new(Float64Array::from(vec![None::<f64>; n])),
                DataType::Int64 => Arc::new(Int64Array::from(vec![None::<i64>; n])),
                DataType::Timestamp(TimeUnit::Microsecond, _) => Arc::new(
                    TimestampMicrosecondArray::from(vec![None::<i64>; n])
                        .with_timezone_opt(Some("UTC".to_string())),
                ),
                _ => Arc::new(StringArray::from(vec![None::<&str>; n])),
            };
            columns.push(null_array);
        }
    }

    Ok(RecordBatch::try_new(target_schema.clone(), columns)?)
}

fn rows_to_record_batch(rows: &[MetricRow]) -> Result<RecordBatch> {
    let mut all_keys: Vec<String> = vec![];
    for row in rows {
        for key in row.values.keys() {
            if !all_keys.contains(key) {
                all_keys.push(key.clone());
            }
        }
    }
    all_keys.sort();

    let mut fields = base_fields();
    let mut arrays: Vec<ArrayRef> = vec![];

    let steps: Vec<Option<i64>> = rows.iter().map(|r| r.step.map(|s| s as i64)).collect();
    arrays.push(Arc::new(Int64Array::from(steps)));

    let timestamps: Vec<Option<i64>> = rows
        .iter()
        .map(|r| Some(r.timestamp.timestamp_micros()))
        .collect();
    arrays.push(Arc::new(
        TimestampMicrosecondArray::from(timestamps).with_timezone_opt(Some("UTC".to_string())),
    ));

    for key in &all_keys {
        // Column type follows the first value seen for the key
        let first_val = rows.iter().find_map(|r| r.values.get(key));
        match first_val {
            Some(MetricValue::Float(_)) | Some(MetricValue::Int(_)) => {
                let vals: Vec<Option<f64>> = rows
                    .iter()
                    .map(|r| r.values.get(key).and_then(MetricValue::as_f64))
                    .collect();
                fields.push(Field::new(key, DataType::Float64, true));
                arrays.push(Arc::new(Float64Array::from(vals)));
            }
            _ => {
                let vals: Vec<Option<String>> = rows
                    .iter()
                    .map(|r| match r.values.get(key) {
                        Some(MetricValue::Text(s)) => Some(s.clone()),
                        Some(MetricValue::Bool(b)) => Some(b.to_string()),
                        Some(MetricValue::Float(f)) => Some(f.to_string()),
                        Some(MetricValue::Int(i)) => Some(i.to_string()),
                        None => None,
                    })
                    .collect();
                fields.push(Field::new(key, DataType::Utf8, true));
                arrays.push(Arc::new(StringArray::from(vals)));
            }
        }
    }

    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?)
}

fn record_batch_to_rows(batch: &RecordBatch) -> Result<Vec<HashMap<String, serde_json::Value>>> {
    let schema = batch.schema();
    let n = batch.num_rows();
    let mut rows = vec![HashMap::new(); n];

    for (col_idx, field) in schema.fields().iter().enumerate() {
        let col = batch.column(col_idx);
        let name = field.name().clone();

        for (row_idx, row) in rows.iter_mut().enumerate() {
            let val = if col.is_null(row_idx) {
                serde_json::Value::Null
            } else {
                cell_to_json(col, field.data_type(), row_idx)
            };
            row.insert(name.clone(), val);
        }
    }

    Ok(rows)
}

fn cell_to_json(col: &ArrayRef, data_type: &DataType, idx: usize) -> serde_json::Value {
    let any = col.as_any();
    match data_type {
        DataType::Float64 => match any.downcast_ref::<Float64Array>() {
            Some(arr) if arr.value(idx).is_finite() => serde_json::json!(arr.value(idx)),
            _ => serde_json::Value::Null,
        },
        DataType::Int64 => any
            .downcast_ref::<Int64Array>()
            .map(|arr| serde_json::json!(arr.value(idx)))
            .unwrap_or(serde_json::Value::Null),
        DataType::Timestamp(TimeUnit::Microsecond, _) => any
            .downcast_ref::<TimestampMicrosecondArray>()
            .and_then(|arr| DateTime::<Utc>::from_timestamp_micros(arr.value(idx)))
            .map(|dt| serde_json::json!(dt.to_rfc3339()))
            .unwrap_or(serde_json::Value::Null),
        DataType::Utf8 => any
            .downcast_ref::<StringArray>()
            .map(|arr| serde_json::json!(arr.value(idx)))
            .unwrap_or(serde_json::Value::Null),
        _ => serde_json::Value::Null,
    }
}
