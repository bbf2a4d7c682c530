//! Pipeline stages: ingest → preprocess → train → evaluate.

pub mod evaluate;
pub mod ingest;
pub mod preprocess;
pub mod train;

use std::path::PathBuf;

use serde::Serialize;
use tracing::info;

use crate::config::{PipelineParams, WorkspaceLayout};
use crate::error::Result;
use crate::registry::FileModelRegistry;
use crate::tracking::FileTrackingStore;

pub use evaluate::EvaluationOutcome;
pub use ingest::IngestReport;
pub use preprocess::PreprocessReport;
pub use train::ModelMetadata;

/// Everything a stage needs: where files live, the parameters, and the tracking root.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub layout: WorkspaceLayout,
    pub params: PipelineParams,
    pub tracking_dir: PathBuf,
}

impl StageContext {
    /// Load `params.yaml` from `root`. The tracking root defaults to `<root>/mlruns`.
    pub fn load(root: impl Into<PathBuf>, tracking_dir: Option<PathBuf>) -> Result<Self> {
        let layout = WorkspaceLayout::new(root);
        let params = PipelineParams::load(&layout.params_file())?;
        let tracking_dir = tracking_dir.unwrap_or_else(|| layout.default_tracking_dir());
        Ok(Self {
            layout,
            params,
            tracking_dir,
        })
    }

    pub fn tracking_store(&self) -> FileTrackingStore {
        FileTrackingStore::new(&self.tracking_dir)
    }

    pub fn registry(&self) -> FileModelRegistry {
        FileModelRegistry::new(&self.tracking_dir)
    }

    pub fn run_stage(&self, stage: PipelineStage) -> Result<StageReport> {
        info!(stage = stage.name(), "Running stage");
        Ok(match stage {
            PipelineStage::Ingest => StageReport::Ingest(ingest::run(self)?),
            PipelineStage::Preprocess => StageReport::Preprocess(preprocess::run(self)?),
            PipelineStage::Train => StageReport::Train(Box::new(train::run(self)?)),
            PipelineStage::Evaluate => StageReport::Evaluate(evaluate::run(self)?),
        })
    }

    /// Run every stage in order, stopping at the first failure.
    pub fn run_all(&self) -> Result<Vec<StageReport>> {
        PipelineStage::ALL.iter().map(|s| self.run_stage(*s)).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Ingest,
    Preprocess,
    Train,
    Evaluate,
}

impl PipelineStage {
    pub const ALL: [PipelineStage; 4] = [
        PipelineStage::Ingest,
        PipelineStage::Preprocess,
        PipelineStage::Train,
        PipelineStage::Evaluate,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PipelineStage::Ingest => "ingest",
            PipelineStage::Preprocess => "preprocess",
            PipelineStage::Train => "train",
            PipelineStage::Evaluate => "evaluate",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "stage", rename_all = "lowercase")]
pub enum StageReport {
    Ingest(IngestReport),
    Preprocess(PreprocessReport),
    Train(Box<ModelMetadata>),
    Evaluate(EvaluationOutcome),
}

impl std::fmt::Display for StageReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageReport::Ingest(r) => write!(
                f,
                "ingested {} rows x {} features into {}",
                r.rows,
                r.features,
                r.path.display()
            ),
            StageReport::Preprocess(r) => write!(
                f,
                "split into {} train / {} test rows",
                r.train_rows, r.test_rows
            ),
            StageReport::Train(m) => write!(
                f,
                "run {} test_accuracy={:.4}, {} v{} -> {}",
                m.run_id, m.test_accuracy, m.model_name, m.model_version, m.stage
            ),
            StageReport::Evaluate(e) => write!(
                f,
                "accuracy={:.4} precision={:.4} recall={:.4} f1={:.4}",
                e.accuracy, e.precision, e.recall, e.f1_score
            ),
        }
    }
}
