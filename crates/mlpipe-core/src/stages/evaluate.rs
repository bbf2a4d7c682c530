//! Evaluate: score the tracked model on the test split and log the results
//! back into its training run.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::json;
use tracing::info;

use super::train::{ModelMetadata, MODEL_ARTIFACT_DIR, MODEL_FILE};
use super::StageContext;
use crate::classifier::{Classifier, RandomForest};
use crate::dataset::{Dataset, IRIS_TARGET_NAMES};
use crate::engine::LoggingEngine;
use crate::error::{PipelineError, Result};
use crate::metrics::EvaluationReport;
use crate::models::{MetricValue, RunStatus};
use crate::storage;

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationOutcome {
    pub run_id: String,
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub confusion_matrix: Vec<Vec<u64>>,
    pub labels: Vec<String>,
}

pub fn run(ctx: &StageContext) -> Result<EvaluationOutcome> {
    info!("Evaluating model");

    let metadata: ModelMetadata = storage::load_json(&ctx.layout.model_metadata())?;
    info!(run_id = %metadata.run_id, "Loading model from run");

    // The model comes from the tracked run, never from a local copy
    let run_dir = ctx
        .tracking_store()
        .run_dir(&metadata.experiment, &metadata.run_id);
    if !run_dir.join(storage::RUN_FILE).exists() {
        return Err(PipelineError::RunNotFound(metadata.run_id));
    }
    let model_path = run_dir
        .join(storage::ARTIFACTS_DIR)
        .join(MODEL_ARTIFACT_DIR)
        .join(MODEL_FILE);
    let model = RandomForest::load(&model_path)?;

    let test = Dataset::read_csv(&ctx.layout.test_data(), &IRIS_TARGET_NAMES)?;
    let predicted = model.predict(&test.features)?;
    let n_classes = test.n_classes().max(model.target_names.len());
    let report = EvaluationReport::compute(&test.targets, &predicted, n_classes);

    info!("Accuracy:  {:.4}", report.accuracy);
    info!("Precision: {:.4}", report.precision);
    info!("Recall:    {:.4}", report.recall);
    info!("F1 Score:  {:.4}", report.f1_score);

    let labels: Vec<String> = if model.target_names.is_empty() {
        test.target_names.clone()
    } else {
        model.target_names.clone()
    };

    let metrics_path = ctx.layout.metrics_file();
    let cm_path = ctx.layout.confusion_matrix_file();
    storage::save_json(
        &metrics_path,
        &json!({
            "accuracy": report.accuracy,
            "precision": report.precision,
            "recall": report.recall,
            "f1_score": report.f1_score,
        }),
    )?;
    storage::save_json(
        &cm_path,
        &json!({
            "data": report.confusion_matrix,
            "labels": labels,
        }),
    )?;

    let engine = LoggingEngine::resume(&ctx.tracking_dir, &metadata.experiment, &metadata.run_id)?;
    let eval_metrics: HashMap<String, MetricValue> = [
        ("eval_accuracy", report.accuracy),
        ("eval_precision", report.precision),
        ("eval_recall", report.recall),
        ("eval_f1", report.f1_score),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), MetricValue::Float(v)))
    .collect();
    engine.log_metrics(eval_metrics, None);
    engine.close(RunStatus::Finished);

    info!(path = %metrics_path.display(), "Metrics saved");
    info!(path = %cm_path.display(), "Confusion matrix saved");
    info!(run_id = %metadata.run_id, "Logged to tracked run");

    Ok(EvaluationOutcome {
        run_id: metadata.run_id,
        accuracy: report.accuracy,
        precision: report.precision,
        recall: report.recall,
        f1_score: report.f1_score,
        confusion_matrix: report.confusion_matrix,
        labels,
    })
}
