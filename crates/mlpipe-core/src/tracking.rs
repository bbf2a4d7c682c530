//! Record-oriented access to tracked experiments and runs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::models::{experiment_dir, ExperimentMetadata, Run};
use crate::storage;

/// Read and annotate tracked runs.
pub trait TrackingStore {
    fn get_experiment(&self, name: &str) -> Result<Option<ExperimentMetadata>>;

    fn get_run(&self, experiment: &str, run_id: &str) -> Result<Run>;

    /// Look a run up by id across all experiments.
    fn find_run(&self, run_id: &str) -> Result<Run>;

    /// Runs of an experiment, newest first.
    fn search_runs(&self, experiment: &str, max_results: usize) -> Result<Vec<Run>>;

    fn set_tag(&self, run_id: &str, key: &str, value: &str) -> Result<()>;
}

/// Tracking store over the on-disk layout written by [`crate::LoggingEngine`].
#[derive(Debug, Clone)]
pub struct FileTrackingStore {
    tracking_dir: PathBuf,
}

impl FileTrackingStore {
    pub fn new(tracking_dir: impl Into<PathBuf>) -> Self {
        Self {
            tracking_dir: tracking_dir.into(),
        }
    }

    pub fn tracking_dir(&self) -> &Path {
        &self.tracking_dir
    }

    pub fn run_dir(&self, experiment: &str, run_id: &str) -> PathBuf {
        experiment_dir(&self.tracking_dir, experiment).join(run_id)
    }

    fn locate_run(&self, run_id: &str) -> Result<PathBuf> {
        for experiment in storage::list_experiments(&self.tracking_dir)? {
            let dir = self.run_dir(&experiment, run_id);
            if dir.join(storage::RUN_FILE).exists() {
                return Ok(dir);
            }
        }
        Err(PipelineError::RunNotFound(run_id.to_string()))
    }
}

/// Assemble a full run record from a run directory.
pub fn load_run(run_dir: &Path) -> Result<Run> {
    let info = storage::load_run_metadata(run_dir)?;
    let mut metrics = info.metrics.clone().unwrap_or_default();
    // The parquet history is authoritative while a run is still open
    metrics.extend(storage::read_latest_scalar_metrics(
        &run_dir.join(storage::METRICS_FILE),
    )?);
    Ok(Run {
        info,
        params: storage::load_params(run_dir)?,
        tags: storage::load_tags(run_dir)?,
        metrics,
        inputs: storage::load_inputs(run_dir)?,
    })
}

impl TrackingStore for FileTrackingStore {
    fn get_experiment(&self, name: &str) -> Result<Option<ExperimentMetadata>> {
        let dir = experiment_dir(&self.tracking_dir, name);
        if !dir.is_dir() {
            return Ok(None);
        }
        Ok(Some(storage::load_experiment_metadata(&dir)?))
    }

    fn get_run(&self, experiment: &str, run_id: &str) -> Result<Run> {
        let dir = self.run_dir(experiment, run_id);
        if !dir.join(storage::RUN_FILE).exists() {
            return Err(PipelineError::RunNotFound(run_id.to_string()));
        }
        load_run(&dir)
    }

    fn find_run(&self, run_id: &str) -> Result<Run> {
        load_run(&self.locate_run(run_id)?)
    }

    fn search_runs(&self, experiment: &str, max_results: usize) -> Result<Vec<Run>> {
        let dir = experiment_dir(&self.tracking_dir, experiment);
        if !dir.is_dir() {
            return Err(PipelineError::ExperimentNotFound(experiment.to_string()));
        }
        let mut runs = vec![];
        for run_id in storage::list_runs(&dir)? {
            match load_run(&dir.join(&run_id)) {
                Ok(run) => runs.push(run),
                Err(e) => debug!(run_id = %run_id, error = %e, "Skipping unreadable run"),
            }
        }
        runs.sort_by(|a, b| b.info.started_at.cmp(&a.info.started_at));
        runs.truncate(max_results);
        Ok(runs)
    }

    fn set_tag(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        let dir = self.locate_run(run_id)?;
        let mut entry = BTreeMap::new();
        entry.insert(key.to_string(), value.to_string());
        storage::merge_string_map(&dir.join(storage::TAGS_FILE), entry)
    }
}
