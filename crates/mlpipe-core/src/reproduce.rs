//! Reproduce an experiment from a registered model version.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_yaml::{Mapping, Value};
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::registry::ModelRegistry;
use crate::storage;
use crate::tracking::TrackingStore;

/// Hyperparameters restored into the `train` section of `params.yaml`.
pub const REPRODUCIBLE_PARAMS: [&str; 3] = ["n_estimators", "max_depth", "random_state"];

#[derive(Debug, Clone, Serialize)]
pub struct ExperimentInfo {
    pub run_id: String,
    pub model_version: u32,
    pub params: BTreeMap<String, String>,
    pub metrics: HashMap<String, f64>,
    /// Tags of the model version
    pub tags: BTreeMap<String, String>,
    pub model_uri: String,
}

/// Gather the run parameters and metrics behind `model` at `version_or_alias`.
pub fn experiment_info<T, R>(
    tracking: &T,
    registry: &R,
    model: &str,
    version_or_alias: &str,
) -> Result<ExperimentInfo>
where
    T: TrackingStore + ?Sized,
    R: ModelRegistry + ?Sized,
{
    let mv = registry.resolve(model, version_or_alias)?;
    let run = tracking.find_run(&mv.run_id)?;
    Ok(ExperimentInfo {
        run_id: run.info.run_id,
        model_version: mv.version,
        params: run.params,
        metrics: run.metrics,
        tags: mv.tags,
        model_uri: format!("models:/{}@{}", model, version_or_alias),
    })
}

/// Write `experiment_<run_id>.json` into `dir`.
pub fn save_experiment_info(dir: &Path, info: &ExperimentInfo) -> Result<PathBuf> {
    let path = dir.join(format!("experiment_{}.json", info.run_id));
    storage::save_json(&path, info)?;
    Ok(path)
}

/// Rewrite the `train` section of `params.yaml` with the reproducible
/// hyperparameters found in `params`. Other sections are left untouched.
pub fn update_train_params(params_path: &Path, params: &BTreeMap<String, String>) -> Result<()> {
    let mut doc = storage::load_yaml_value(params_path)?;
    if doc.is_null() {
        doc = Value::Mapping(Mapping::new());
    }
    let root = doc.as_mapping_mut().ok_or_else(|| {
        PipelineError::InvalidParam(format!("{} is not a mapping", params_path.display()))
    })?;

    let train_key = Value::String("train".to_string());
    if !matches!(root.get(&train_key), Some(Value::Mapping(_))) {
        root.insert(train_key.clone(), Value::Mapping(Mapping::new()));
    }
    let train = root
        .get_mut(&train_key)
        .and_then(Value::as_mapping_mut)
        .ok_or_else(|| PipelineError::Other("train section unavailable".to_string()))?;

    for key in REPRODUCIBLE_PARAMS {
        if let Some(raw) = params.get(key) {
            let value: i64 = raw.trim().parse().map_err(|_| {
                PipelineError::InvalidParam(format!("{} = '{}' is not an integer", key, raw))
            })?;
            train.insert(Value::String(key.to_string()), Value::Number(value.into()));
        }
    }

    storage::save_yaml(params_path, &doc)?;
    info!(path = %params_path.display(), "Updated params");
    Ok(())
}
