//! Train: fit the model inside a tracked run, link the data lineage, register
//! the model and decide on its promotion.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::StageContext;
use crate::classifier::{Classifier, RandomForest};
use crate::config::{TrainParams, WorkspaceLayout};
use crate::dataset::{Dataset, IRIS_TARGET_NAMES};
use crate::engine::{LogLevel, LoggingEngine};
use crate::error::Result;
use crate::lineage::{self, RemoteRepo, DATA_VERSION_KEY};
use crate::models::{MetricValue, RunConfig, RunStatus};
use crate::promotion::{self, PromotionDecision};
use crate::registry::{ModelRegistry, ModelVersion};
use crate::storage;
use crate::tracking::TrackingStore;

/// Artifact directory of the model inside a run.
pub const MODEL_ARTIFACT_DIR: &str = "model";
pub const MODEL_FILE: &str = "model.json";

/// Summary of a training run, written to `models/model_metadata.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub run_id: String,
    pub experiment: String,
    pub train_accuracy: f64,
    pub test_accuracy: f64,
    pub model_type: String,
    pub params: TrainParams,
    pub data_version: Option<String>,
    pub model_name: String,
    pub model_version: u32,
    pub stage: String,
    pub promotion: PromotionSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionSummary {
    pub decision: String,
    pub reason: String,
}

impl From<&PromotionDecision> for PromotionSummary {
    fn from(d: &PromotionDecision) -> Self {
        Self {
            decision: d.label().to_string(),
            reason: d.reason.clone(),
        }
    }
}

pub fn run(ctx: &StageContext) -> Result<ModelMetadata> {
    info!("Starting model training");
    let params = &ctx.params.train;
    info!(
        n_estimators = params.n_estimators,
        max_depth = params.max_depth,
        random_state = params.random_state,
        "Hyperparameters"
    );

    let train = Dataset::read_csv(&ctx.layout.train_data(), &IRIS_TARGET_NAMES)?;
    let test = Dataset::read_csv(&ctx.layout.test_data(), &IRIS_TARGET_NAMES)?;

    let tracking = &ctx.params.tracking;
    let config = RunConfig::new(&tracking.experiment, &ctx.tracking_dir)
        .with_run_name(&tracking.run_name);
    let engine = LoggingEngine::start(config)?;

    match train_in_run(ctx, &engine, &train, &test) {
        Ok(metadata) => {
            engine.close(RunStatus::Finished);
            info!(run_id = %metadata.run_id, "Model logged");
            info!(model = %metadata.model_name, version = metadata.model_version, "Model registered");
            Ok(metadata)
        }
        Err(e) => {
            engine.log_message(LogLevel::Error, format!("training failed: {}", e));
            engine.close(RunStatus::Failed);
            Err(e)
        }
    }
}

fn train_in_run(
    ctx: &StageContext,
    engine: &LoggingEngine,
    train: &Dataset,
    test: &Dataset,
) -> Result<ModelMetadata> {
    let params = &ctx.params.train;
    engine.log_params([
        ("n_estimators", params.n_estimators.to_string()),
        ("max_depth", params.max_depth.to_string()),
        ("random_state", params.random_state.to_string()),
        ("model_type", RandomForest::MODEL_TYPE.to_string()),
    ]);

    let data_version = link_data_lineage(&ctx.layout, engine);

    let mut model = RandomForest::new(params.n_estimators, params.max_depth, params.random_state);
    model.fit(train)?;
    let train_accuracy = model.score(train)?;
    let test_accuracy = model.score(test)?;

    let metrics: HashMap<String, MetricValue> = [
        ("train_accuracy".to_string(), MetricValue::Float(train_accuracy)),
        ("test_accuracy".to_string(), MetricValue::Float(test_accuracy)),
    ]
    .into_iter()
    .collect();
    engine.log_metrics(metrics, None);
    info!("Train accuracy: {:.4}", train_accuracy);
    info!("Test accuracy: {:.4}", test_accuracy);
    engine.log_message(
        LogLevel::Info,
        format!("train_accuracy={:.4} test_accuracy={:.4}", train_accuracy, test_accuracy),
    );

    engine.log_artifact_bytes(
        format!("{}/{}", MODEL_ARTIFACT_DIR, MODEL_FILE),
        model.to_json_bytes()?,
    );
    engine.flush_blocking()?;

    let candidate_metrics: HashMap<String, f64> = [
        ("train_accuracy".to_string(), train_accuracy),
        ("test_accuracy".to_string(), test_accuracy),
    ]
    .into_iter()
    .collect();
    let (version, decision) =
        register_and_promote(ctx, engine.run_id(), &candidate_metrics, data_version.as_deref())?;

    let metadata = ModelMetadata {
        run_id: engine.run_id().to_string(),
        experiment: ctx.params.tracking.experiment.clone(),
        train_accuracy,
        test_accuracy,
        model_type: RandomForest::MODEL_TYPE.to_string(),
        params: params.clone(),
        data_version,
        model_name: version.name.clone(),
        model_version: version.version,
        stage: version.stage.to_string(),
        promotion: PromotionSummary::from(&decision),
    };

    let metadata_path = ctx.layout.model_metadata();
    storage::save_json(&metadata_path, &metadata)?;
    engine.log_artifact(metadata_path.clone(), "model_metadata.json");
    info!(path = %metadata_path.display(), "Metadata saved");
    Ok(metadata)
}

/// Attach the data fingerprint and provenance of the processed splits to the run.
/// Returns the fingerprint, or `None` when no versioning metadata is available;
/// training proceeds either way.
fn link_data_lineage(layout: &WorkspaceLayout, engine: &LoggingEngine) -> Option<String> {
    let wanted = [WorkspaceLayout::TRAIN_DATA, WorkspaceLayout::TEST_DATA];
    let metadata = match lineage::read_dvc_lock(&layout.dvc_lock(), &wanted) {
        Ok(m) if !m.is_empty() => m,
        Ok(_) => {
            warn!("No versioned data recorded for the processed splits; lineage not linked");
            return None;
        }
        Err(e) => {
            warn!(error = %e, "Data lineage unavailable");
            return None;
        }
    };

    let data_version = match lineage::compute_data_version(&metadata) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "Could not fingerprint data");
            return None;
        }
    };
    let repo = RemoteRepo::from_dvc_config(&layout.dvc_config_candidates());

    engine.log_params([(DATA_VERSION_KEY, data_version.clone())]);
    engine.set_tags(lineage::lineage_tags(&metadata, &data_version, repo.as_ref()));
    let inputs = lineage::dataset_inputs(&metadata, |path| {
        if path == WorkspaceLayout::TEST_DATA {
            "testing"
        } else {
            "training"
        }
    });
    for input in inputs {
        engine.log_input(input);
    }
    engine.log_artifact_bytes(
        "data_lineage.md",
        lineage::format_lineage_info(&data_version, &metadata, repo.as_ref()).into_bytes(),
    );

    info!(data_version = %data_version, files = metadata.len(), "Linked data lineage");
    Some(data_version)
}

fn register_and_promote(
    ctx: &StageContext,
    run_id: &str,
    candidate_metrics: &HashMap<String, f64>,
    data_version: Option<&str>,
) -> Result<(ModelVersion, PromotionDecision)> {
    let registry = ctx.registry();
    let policy = &ctx.params.promotion;
    let model_name = &ctx.params.tracking.model_name;

    // Look up the incumbent before the candidate exists in the registry
    let incumbent = promotion::current_production(&registry, model_name, policy)?;

    let candidate = registry.register_model_version(model_name, run_id, MODEL_ARTIFACT_DIR)?;
    if let Some(dv) = data_version {
        registry.set_version_tag(model_name, candidate.version, DATA_VERSION_KEY, dv)?;
    }
    let mut tagged: Vec<_> = candidate_metrics.iter().collect();
    tagged.sort_by(|a, b| a.0.cmp(b.0));
    for (key, value) in tagged {
        registry.set_version_tag(model_name, candidate.version, key, &value.to_string())?;
    }

    let incumbent_metrics = incumbent
        .as_ref()
        .map(|mv| version_metrics(ctx, mv))
        .unwrap_or_default();
    let decision = promotion::decide(
        policy,
        candidate_metrics,
        incumbent.as_ref().map(|mv| (mv, &incumbent_metrics)),
    );
    info!(
        decision = decision.label(),
        reason = %decision.reason,
        "Promotion decision"
    );

    let updated = promotion::apply(&registry, model_name, candidate.version, &decision, policy)?;
    Ok((updated, decision))
}

/// Metrics of a registered version: its run's metrics, falling back to the
/// numeric tags recorded on the version.
fn version_metrics(ctx: &StageContext, mv: &ModelVersion) -> HashMap<String, f64> {
    let mut metrics: HashMap<String, f64> = mv
        .tags
        .iter()
        .filter_map(|(k, v)| v.parse::<f64>().ok().map(|f| (k.clone(), f)))
        .collect();
    match ctx.tracking_store().find_run(&mv.run_id) {
        Ok(run) => metrics.extend(run.metrics),
        Err(e) => warn!(run_id = %mv.run_id, error = %e, "Run of production model unavailable"),
    }
    metrics
}
