//! Data models for tracked runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Configuration for a single tracked run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Name of the experiment (e.g. "iris-rf-train")
    pub experiment: String,
    /// Human readable run name
    pub run_name: String,
    /// Unique run id (32 lowercase hex chars)
    pub run_id: String,
    /// Tracking root, holding `experiments/` and `registry/`
    pub tracking_dir: PathBuf,
    /// Flush metrics to disk every N rows (default: 50)
    pub flush_interval_rows: usize,
    /// Flush metrics to disk every N milliseconds (default: 500)
    pub flush_interval_ms: u64,
}

impl RunConfig {
    pub fn new(experiment: impl Into<String>, tracking_dir: impl Into<PathBuf>) -> Self {
        let now = chrono::Local::now();
        Self {
            experiment: experiment.into(),
            run_name: now.format("%Y%m%d_%H%M%S").to_string(),
            run_id: uuid::Uuid::new_v4().simple().to_string(),
            tracking_dir: tracking_dir.into(),
            flush_interval_rows: 50,
            flush_interval_ms: 500,
        }
    }

    pub fn with_run_name(mut self, run_name: impl Into<String>) -> Self {
        self.run_name = run_name.into();
        self
    }

    pub fn experiment_dir(&self) -> PathBuf {
        experiment_dir(&self.tracking_dir, &self.experiment)
    }

    pub fn run_dir(&self) -> PathBuf {
        self.experiment_dir().join(&self.run_id)
    }
}

/// `<tracking_dir>/experiments/<experiment>`
pub fn experiment_dir(tracking_dir: &Path, experiment: &str) -> PathBuf {
    tracking_dir.join("experiments").join(experiment)
}

/// A single metric value: float, int, bool or string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MetricValue {
    Float(f64),
    Int(i64),
    Bool(bool),
    Text(String),
}

impl MetricValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Float(f) => Some(*f),
            MetricValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Float(v)
    }
}
impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        MetricValue::Int(v)
    }
}
impl From<usize> for MetricValue {
    fn from(v: usize) -> Self {
        MetricValue::Int(v as i64)
    }
}
impl From<bool> for MetricValue {
    fn from(v: bool) -> Self {
        MetricValue::Bool(v)
    }
}
impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        MetricValue::Text(v.to_string())
    }
}

/// A row of metrics logged at a specific step/time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricRow {
    pub step: Option<u64>,
    pub timestamp: DateTime<Utc>,
    pub values: HashMap<String, MetricValue>,
}

impl MetricRow {
    pub fn new(values: HashMap<String, MetricValue>, step: Option<u64>) -> Self {
        Self {
            step,
            timestamp: Utc::now(),
            values,
        }
    }
}

/// Status of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Running,
    Finished,
    Failed,
    Crashed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "RUNNING"),
            RunStatus::Finished => write!(f, "FINISHED"),
            RunStatus::Failed => write!(f, "FAILED"),
            RunStatus::Crashed => write!(f, "CRASHED"),
        }
    }
}

/// Metadata stored alongside a run in `run.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub run_name: String,
    pub experiment: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    /// Latest scalar metrics, refreshed when the run is closed.
    #[serde(default)]
    pub metrics: Option<HashMap<String, f64>>,
}

impl Default for RunMetadata {
    fn default() -> Self {
        Self {
            run_id: String::new(),
            run_name: String::new(),
            experiment: String::new(),
            status: RunStatus::Crashed,
            started_at: Utc::now(),
            finished_at: None,
            duration_secs: None,
            metrics: None,
        }
    }
}

/// A dataset consumed by a run, recorded for lineage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetInput {
    pub name: String,
    /// Content digest (the md5 tracked by the data-versioning tool)
    pub digest: String,
    pub source: String,
    /// How the run used the dataset, e.g. "training"
    pub context: String,
}

/// The full record of a run, as returned by a tracking store.
#[derive(Debug, Clone, Serialize)]
pub struct Run {
    pub info: RunMetadata,
    pub params: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,
    pub metrics: HashMap<String, f64>,
    pub inputs: Vec<DatasetInput>,
}

impl Run {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn metric(&self, key: &str) -> Option<f64> {
        self.metrics.get(key).copied()
    }
}

/// Metadata stored for an experiment.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExperimentMetadata {
    pub display_name: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}
