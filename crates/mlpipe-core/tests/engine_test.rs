//! Integration tests for the run logger and tracking store.

use std::collections::{BTreeMap, HashMap};

use mlpipe_core::{
    storage, DatasetInput, FileTrackingStore, LoggingEngine, MetricValue, RunConfig, RunStatus,
    TrackingStore,
};
use tempfile::TempDir;

fn make_engine(tmp: &TempDir, experiment: &str) -> LoggingEngine {
    let mut config = RunConfig::new(experiment, tmp.path()).with_run_name("test_run");
    config.flush_interval_rows = 10;
    config.flush_interval_ms = 100;
    LoggingEngine::start(config).expect("Failed to start run")
}

fn metric(key: &str, value: f64) -> HashMap<String, MetricValue> {
    let mut m = HashMap::new();
    m.insert(key.to_string(), MetricValue::Float(value));
    m
}

#[test]
fn test_engine_creates_run_dir() {
    let tmp = TempDir::new().unwrap();
    let engine = make_engine(&tmp, "test_exp");
    let run_dir = engine.config().run_dir();
    assert!(run_dir.exists(), "Run directory should be created");
    assert!(run_dir.join("run.yaml").exists(), "run.yaml should exist");
    assert!(run_dir.join("artifacts").is_dir());
    assert_eq!(engine.run_id().len(), 32);

    let meta = storage::load_run_metadata(&run_dir).unwrap();
    assert_eq!(meta.status, RunStatus::Running);
    engine.close(RunStatus::Finished);
}

#[test]
fn test_log_metrics_writes_parquet() {
    let tmp = TempDir::new().unwrap();
    let engine = make_engine(&tmp, "metrics_test");

    for i in 0..100u64 {
        let mut m = metric("loss", 1.0 - i as f64 * 0.01);
        m.insert("acc".to_string(), MetricValue::Float(i as f64 * 0.01));
        engine.log_metrics(m, Some(i));
    }
    engine.close(RunStatus::Finished);

    let metrics_path = engine.config().run_dir().join("metrics.parquet");
    assert!(metrics_path.exists(), "metrics.parquet should exist after close");
    let rows = storage::read_metrics(&metrics_path).unwrap();
    assert_eq!(rows.len(), 100);
}

#[test]
fn test_params_and_tags_merge_across_calls() {
    let tmp = TempDir::new().unwrap();
    let engine = make_engine(&tmp, "params_test");

    engine.log_params([("n_estimators", 100), ("max_depth", 5)]);
    engine.log_params([("data_version", "ab12cd34")]);
    engine.set_tags(BTreeMap::from([("stage".to_string(), "train".to_string())]));
    engine.close(RunStatus::Finished);

    let run_dir = engine.config().run_dir();
    let params = storage::load_params(&run_dir).unwrap();
    assert_eq!(params.get("n_estimators").map(String::as_str), Some("100"));
    assert_eq!(params.get("max_depth").map(String::as_str), Some("5"));
    assert_eq!(params.get("data_version").map(String::as_str), Some("ab12cd34"));
    let tags = storage::load_tags(&run_dir).unwrap();
    assert_eq!(tags.get("stage").map(String::as_str), Some("train"));
}

#[test]
fn test_run_status_written_on_close() {
    let tmp = TempDir::new().unwrap();
    let engine = make_engine(&tmp, "status_test");
    engine.log_metrics(metric("test_accuracy", 0.9), None);
    engine.close(RunStatus::Failed);

    let meta = storage::load_run_metadata(&engine.config().run_dir()).unwrap();
    assert_eq!(meta.status, RunStatus::Failed);
    assert!(meta.finished_at.is_some());
    assert!(meta.duration_secs.is_some());
    let metrics = meta.metrics.unwrap();
    assert_eq!(metrics.get("test_accuracy"), Some(&0.9));
}

#[test]
fn test_parquet_schema_merge() {
    let tmp = TempDir::new().unwrap();
    let engine = make_engine(&tmp, "schema_test");

    engine.log_metrics(metric("loss", 0.5), Some(0));
    engine.flush_blocking().unwrap();
    let mut m2 = metric("loss", 0.4);
    m2.insert("acc".to_string(), MetricValue::Float(0.8));
    engine.log_metrics(m2, Some(1));
    engine.close(RunStatus::Finished);

    let rows = storage::read_metrics(&engine.config().run_dir().join("metrics.parquet")).unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows[0].get("acc").map(|v| v.is_null()).unwrap_or(true));
    assert_eq!(rows[1].get("acc").and_then(|v| v.as_f64()), Some(0.8));
}

#[test]
fn test_artifacts_stay_inside_run() {
    let tmp = TempDir::new().unwrap();
    let engine = make_engine(&tmp, "artifact_test");

    let src = tmp.path().join("notes.txt");
    std::fs::write(&src, "artifact content").unwrap();
    engine.log_artifact(src, "docs/notes.txt");
    engine.log_artifact_bytes("../../escape.json", b"{}".to_vec());
    engine.close(RunStatus::Finished);

    let artifacts = engine.config().run_dir().join("artifacts");
    assert_eq!(
        std::fs::read_to_string(artifacts.join("docs/notes.txt")).unwrap(),
        "artifact content"
    );
    assert!(artifacts.join("escape.json").exists());
    assert!(!tmp.path().join("escape.json").exists());

    let listed = storage::list_artifacts(&engine.config().run_dir()).unwrap();
    assert_eq!(listed.len(), 2);
}

#[test]
fn test_inputs_are_deduplicated() {
    let tmp = TempDir::new().unwrap();
    let engine = make_engine(&tmp, "inputs_test");
    let input = |digest: &str| DatasetInput {
        name: "train".to_string(),
        digest: digest.to_string(),
        source: "data/processed/train.csv".to_string(),
        context: "training".to_string(),
    };
    engine.log_input(input("old"));
    engine.log_input(input("new"));
    engine.close(RunStatus::Finished);

    let inputs = storage::load_inputs(&engine.config().run_dir()).unwrap();
    assert_eq!(inputs, vec![input("new")]);
}

#[test]
fn test_resume_keeps_start_and_adds_metrics() {
    let tmp = TempDir::new().unwrap();
    let engine = make_engine(&tmp, "resume_test");
    engine.log_metrics(metric("test_accuracy", 0.9), None);
    engine.close(RunStatus::Finished);
    let run_id = engine.run_id().to_string();
    let started = storage::load_run_metadata(&engine.config().run_dir()).unwrap().started_at;

    let resumed = LoggingEngine::resume(tmp.path(), "resume_test", &run_id).unwrap();
    assert_eq!(resumed.config().run_name, "test_run");
    resumed.log_metrics(metric("eval_accuracy", 0.95), None);
    resumed.close(RunStatus::Finished);

    let store = FileTrackingStore::new(tmp.path());
    let run = store.get_run("resume_test", &run_id).unwrap();
    assert_eq!(run.info.started_at, started);
    assert_eq!(run.info.status, RunStatus::Finished);
    assert_eq!(run.metric("test_accuracy"), Some(0.9));
    assert_eq!(run.metric("eval_accuracy"), Some(0.95));
}

#[test]
fn test_resume_unknown_run_fails() {
    let tmp = TempDir::new().unwrap();
    assert!(LoggingEngine::resume(tmp.path(), "nope", "missing").is_err());
}

#[test]
fn test_search_runs_newest_first() {
    let tmp = TempDir::new().unwrap();
    let mut ids = vec![];
    for _ in 0..3 {
        let engine = make_engine(&tmp, "search_test");
        ids.push(engine.run_id().to_string());
        engine.close(RunStatus::Finished);
        std::thread::sleep(std::time::Duration::from_millis(10));
    }

    let store = FileTrackingStore::new(tmp.path());
    let runs = store.search_runs("search_test", 2).unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].info.run_id, ids[2]);
    assert_eq!(runs[1].info.run_id, ids[1]);

    let found = store.find_run(&ids[0]).unwrap();
    assert_eq!(found.info.experiment, "search_test");
    assert!(store.search_runs("missing", 5).is_err());
    assert!(store.get_experiment("search_test").unwrap().is_some());
    assert!(store.get_experiment("missing").unwrap().is_none());
}

#[test]
fn test_store_set_tag() {
    let tmp = TempDir::new().unwrap();
    let engine = make_engine(&tmp, "tag_test");
    engine.close(RunStatus::Finished);

    let store = FileTrackingStore::new(tmp.path());
    store.set_tag(engine.run_id(), "reviewed", "yes").unwrap();
    let run = store.find_run(engine.run_id()).unwrap();
    assert_eq!(run.tag("reviewed"), Some("yes"));
}
