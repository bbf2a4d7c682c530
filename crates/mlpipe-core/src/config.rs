//! Pipeline configuration: `params.yaml` sections and the workspace layout.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::promotion::PromotionPolicy;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct IngestParams {
    /// CSV to ingest instead of the bundled iris sample
    pub source: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PreprocessParams {
    pub test_size: f64,
    pub random_state: u64,
}

impl Default for PreprocessParams {
    fn default() -> Self {
        Self {
            test_size: 0.2,
            random_state: 42,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrainParams {
    pub n_estimators: usize,
    pub max_depth: usize,
    pub random_state: u64,
}

impl Default for TrainParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: 5,
            random_state: 42,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrackingParams {
    pub experiment: String,
    pub run_name: String,
    pub model_name: String,
}

impl Default for TrackingParams {
    fn default() -> Self {
        Self {
            experiment: "iris-rf-train".to_string(),
            run_name: "iris-rf-train".to_string(),
            model_name: "iris-classifier".to_string(),
        }
    }
}

/// Contents of `params.yaml`. Missing sections and keys take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct PipelineParams {
    pub ingest: IngestParams,
    pub preprocess: PreprocessParams,
    pub train: TrainParams,
    pub promotion: PromotionPolicy,
    pub tracking: TrackingParams,
}

impl PipelineParams {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No params file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let params: Self = if content.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(&content)?
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        let t = self.preprocess.test_size;
        if !(t > 0.0 && t < 1.0) {
            return Err(PipelineError::InvalidParam(format!(
                "preprocess.test_size must be in (0, 1), got {}",
                t
            )));
        }
        if self.train.n_estimators == 0 || self.train.max_depth == 0 {
            return Err(PipelineError::InvalidParam(
                "train.n_estimators and train.max_depth must be positive".to_string(),
            ));
        }
        if self.tracking.experiment.is_empty() || self.tracking.model_name.is_empty() {
            return Err(PipelineError::InvalidParam(
                "tracking.experiment and tracking.model_name must be set".to_string(),
            ));
        }
        self.promotion.validate()
    }
}

/// File locations inside a pipeline workspace.
#[derive(Debug, Clone)]
pub struct WorkspaceLayout {
    pub root: PathBuf,
}

impl WorkspaceLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn params_file(&self) -> PathBuf {
        self.root.join("params.yaml")
    }

    pub fn raw_data(&self) -> PathBuf {
        self.root.join("data/raw/iris.csv")
    }

    pub fn train_data(&self) -> PathBuf {
        self.root.join(Self::TRAIN_DATA)
    }

    pub fn test_data(&self) -> PathBuf {
        self.root.join(Self::TEST_DATA)
    }

    pub fn model_metadata(&self) -> PathBuf {
        self.root.join("models/model_metadata.json")
    }

    pub fn metrics_file(&self) -> PathBuf {
        self.root.join("metrics/metrics.json")
    }

    pub fn confusion_matrix_file(&self) -> PathBuf {
        self.root.join("metrics/confusion_matrix.json")
    }

    pub fn dvc_lock(&self) -> PathBuf {
        self.root.join("dvc.lock")
    }

    /// Candidate locations of the data versioning config, in lookup order.
    pub fn dvc_config_candidates(&self) -> Vec<PathBuf> {
        vec![self.root.join(".dvc/config"), self.root.join(".dvc/config.local")]
    }

    pub fn default_tracking_dir(&self) -> PathBuf {
        self.root.join("mlruns")
    }

    /// Workspace-relative paths of the processed splits, as recorded in `dvc.lock`.
    pub const TRAIN_DATA: &'static str = "data/processed/train.csv";
    pub const TEST_DATA: &'static str = "data/processed/test.csv";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_params_fill_defaults() {
        let params: PipelineParams =
            serde_yaml::from_str("train:\n  n_estimators: 10\npromotion:\n  min_improvement: 0.01\n")
                .unwrap();
        assert_eq!(params.train.n_estimators, 10);
        assert_eq!(params.train.max_depth, 5);
        assert_eq!(params.preprocess.test_size, 0.2);
        assert_eq!(params.promotion.metric, "test_accuracy");
        assert_eq!(params.promotion.min_improvement, 0.01);
        assert_eq!(params.tracking.model_name, "iris-classifier");
    }

    #[test]
    fn invalid_test_size_is_rejected() {
        let mut params = PipelineParams::default();
        params.preprocess.test_size = 1.5;
        assert!(params.validate().is_err());
    }
}
