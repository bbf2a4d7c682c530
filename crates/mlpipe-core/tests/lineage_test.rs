//! Integration tests for data lineage: versioning metadata, fingerprints and
//! run annotations.

use std::collections::{BTreeMap, HashMap};

use mlpipe_core::lineage::{
    self, compare_data_versions, compute_data_version, format_lineage_info, lineage_tags,
    read_dvc_lock, read_dvc_pointer, DataFileMeta, DataMetadata, RemoteRepo, RunLineage,
};
use mlpipe_core::models::RunMetadata;
use mlpipe_core::{DatasetInput, Run};
use tempfile::TempDir;

const LOCK: &str = r#"schema: '2.0'
stages:
  ingest:
    cmd: mlpipe ingest
    outs:
    - path: data/raw/iris.csv
      md5: 0f1e2d3c4b5a69788796a5b4c3d2e1f0
      size: 4551
  preprocess:
    cmd: mlpipe preprocess
    deps:
    - path: data/raw/iris.csv
      md5: 0f1e2d3c4b5a69788796a5b4c3d2e1f0
      size: 4551
    outs:
    - path: data/processed/test.csv
      md5: 22222222222222222222222222222222
      size: 1024
    - path: data/processed/train.csv
      md5: 11111111111111111111111111111111
      size: 3890
"#;

fn meta(md5: &str, size: u64, stage: &str) -> DataFileMeta {
    DataFileMeta {
        md5: md5.to_string(),
        size,
        stage: stage.to_string(),
    }
}

fn splits() -> DataMetadata {
    let mut m = DataMetadata::new();
    m.insert(
        "data/processed/train.csv".to_string(),
        meta("11111111111111111111111111111111", 3890, "preprocess"),
    );
    m.insert(
        "data/processed/test.csv".to_string(),
        meta("22222222222222222222222222222222", 1024, "preprocess"),
    );
    m
}

fn repo() -> RemoteRepo {
    RemoteRepo {
        owner: "alice".to_string(),
        name: "iris-pipeline".to_string(),
    }
}

fn run_with(id: &str, data_version: Option<&str>, accuracy: f64) -> Run {
    let mut params = BTreeMap::new();
    if let Some(dv) = data_version {
        params.insert(lineage::DATA_VERSION_KEY.to_string(), dv.to_string());
    }
    let mut metrics = HashMap::new();
    metrics.insert("test_accuracy".to_string(), accuracy);
    Run {
        info: RunMetadata {
            run_id: id.to_string(),
            run_name: format!("run-{}", id),
            experiment: "exp".to_string(),
            ..Default::default()
        },
        params,
        tags: BTreeMap::new(),
        metrics,
        inputs: vec![],
    }
}

#[test]
fn test_read_dvc_lock_selects_wanted_outputs() {
    let tmp = TempDir::new().unwrap();
    let lock = tmp.path().join("dvc.lock");
    std::fs::write(&lock, LOCK).unwrap();

    let m = read_dvc_lock(&lock, &["data/processed/train.csv", "data/processed/test.csv"]).unwrap();
    assert_eq!(m, splits());

    let all = read_dvc_lock(&lock, &[]).unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(all["data/raw/iris.csv"].stage, "ingest");
    assert_eq!(all["data/raw/iris.csv"].size, 4551);
}

#[test]
fn test_read_dvc_lock_missing_file_is_an_error() {
    let tmp = TempDir::new().unwrap();
    let err = read_dvc_lock(&tmp.path().join("dvc.lock"), &[]).unwrap_err();
    assert!(err.to_string().contains("lock file not found"));
}

#[test]
fn test_read_dvc_lock_unknown_path_is_skipped() {
    let tmp = TempDir::new().unwrap();
    let lock = tmp.path().join("dvc.lock");
    std::fs::write(&lock, LOCK).unwrap();
    let m = read_dvc_lock(&lock, &["data/other.csv"]).unwrap();
    assert!(m.is_empty());
}

#[test]
fn test_read_dvc_pointer() {
    let tmp = TempDir::new().unwrap();
    let pointer = tmp.path().join("iris.csv.dvc");
    std::fs::write(
        &pointer,
        "outs:\n- md5: abcdefabcdefabcdefabcdefabcdefab\n  size: 42\n  path: iris.csv\n",
    )
    .unwrap();
    let (path, m) = read_dvc_pointer(&pointer).unwrap();
    assert_eq!(path, "iris.csv");
    assert_eq!(m, meta("abcdefabcdefabcdefabcdefabcdefab", 42, "manual"));
}

#[test]
fn test_data_version_is_deterministic() {
    let v = compute_data_version(&splits()).unwrap();
    assert_eq!(v.len(), 8);
    assert!(v.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    assert_eq!(v, compute_data_version(&splits()).unwrap());

    // Insertion order does not matter
    let mut reversed = DataMetadata::new();
    for (k, m) in splits().into_iter().rev() {
        reversed.insert(k, m);
    }
    assert_eq!(v, compute_data_version(&reversed).unwrap());
}

#[test]
fn test_data_version_tracks_content_only() {
    let base = compute_data_version(&splits()).unwrap();

    let mut resized = splits();
    for m in resized.values_mut() {
        m.size += 1;
        m.stage = "other".to_string();
    }
    assert_eq!(base, compute_data_version(&resized).unwrap());

    let mut changed = splits();
    if let Some(m) = changed.get_mut("data/processed/train.csv") {
        m.md5 = "33333333333333333333333333333333".to_string();
    }
    assert_ne!(base, compute_data_version(&changed).unwrap());
}

#[test]
fn test_data_version_of_empty_metadata_fails() {
    assert!(compute_data_version(&DataMetadata::new()).is_err());
}

#[test]
fn test_remote_repo_from_url() {
    let r = RemoteRepo::from_url("https://dagshub.com/alice/iris-pipeline.dvc").unwrap();
    assert_eq!(r, repo());
    assert_eq!(r.full_name(), "alice/iris-pipeline");
    assert_eq!(r.repo_url(), "https://dagshub.com/alice/iris-pipeline");
    assert_eq!(
        r.data_url("data/processed/train.csv", "abc"),
        "https://dagshub.com/alice/iris-pipeline/src/abc/data/processed/train.csv"
    );

    assert_eq!(
        RemoteRepo::from_url("https://dagshub.com/alice/iris-pipeline"),
        Some(repo())
    );
    assert!(RemoteRepo::from_url("s3://bucket/data").is_none());
    assert!(RemoteRepo::from_url("https://dagshub.com/alice").is_none());
}

#[test]
fn test_remote_repo_from_dvc_config() {
    let tmp = TempDir::new().unwrap();
    let dvc = tmp.path().join(".dvc");
    std::fs::create_dir_all(&dvc).unwrap();
    std::fs::write(
        dvc.join("config"),
        "[core]\n    remote = origin\n['remote \"origin\"']\n    url = https://dagshub.com/alice/iris-pipeline.dvc\n",
    )
    .unwrap();

    let candidates = vec![dvc.join("config.local"), dvc.join("config")];
    assert_eq!(RemoteRepo::from_dvc_config(&candidates), Some(repo()));
    assert_eq!(RemoteRepo::from_dvc_config(&[tmp.path().join("none")]), None);
}

#[test]
fn test_lineage_tags_with_repo() {
    let tags = lineage_tags(&splits(), "deadbeef", Some(&repo()));
    assert_eq!(tags["data_version"], "deadbeef");
    assert_eq!(
        tags["dvc_data_processed_train_csv_md5"],
        "11111111111111111111111111111111"
    );
    assert_eq!(tags["dvc_data_processed_train_csv_size"], "3890");
    assert_eq!(tags["dvc_data_processed_test_csv_stage"], "preprocess");
    assert_eq!(tags["dagshub_repo"], "alice/iris-pipeline");
    assert_eq!(
        tags["dagshub_url_data_processed_test_csv"],
        "https://dagshub.com/alice/iris-pipeline/src/22222222222222222222222222222222/data/processed/test.csv"
    );
}

#[test]
fn test_lineage_tags_without_repo() {
    let tags = lineage_tags(&splits(), "deadbeef", None);
    assert!(tags.contains_key("dvc_data_processed_test_csv_md5"));
    assert!(!tags.contains_key("dagshub_repo"));
    assert!(!tags.keys().any(|k| k.starts_with(lineage::URL_TAG_PREFIX)));
}

#[test]
fn test_format_lineage_info() {
    let md = format_lineage_info("deadbeef", &splits(), Some(&repo()));
    assert!(md.starts_with("# Data Lineage Information"));
    assert!(md.contains("**Data Version:** `deadbeef`"));
    assert!(md.contains("### data/processed/train.csv"));
    assert!(md.contains("- **Size:** 3,890 bytes"));
    assert!(md.contains(
        "[data/processed/train.csv@11111111](https://dagshub.com/alice/iris-pipeline/src/11111111111111111111111111111111/data/processed/train.csv)"
    ));

    let plain = format_lineage_info("deadbeef", &splits(), None);
    assert!(!plain.contains("DagHub URL"));
}

#[test]
fn test_run_lineage_recovers_paths_from_inputs() {
    let mut run = run_with("r1", Some("deadbeef"), 0.93);
    run.tags = lineage_tags(&splits(), "deadbeef", Some(&repo()));
    for (path, m) in &splits() {
        run.inputs.push(lineage::dataset_input(path, m, "training"));
    }

    let l = RunLineage::from_run(&run);
    assert_eq!(l.data_version, "deadbeef");
    assert_eq!(l.test_accuracy, 0.93);
    assert_eq!(l.datasets.len(), 2);
    assert!(l.data_urls.contains_key("data/processed/train.csv"));
    assert!(l.data_urls.contains_key("data/processed/test.csv"));
    assert_eq!(l.repo.as_deref(), Some("alice/iris-pipeline"));
    assert_eq!(l.dvc_metadata.len(), 6);
}

#[test]
fn test_dataset_input_uses_file_stem() {
    let input: DatasetInput = lineage::dataset_input(
        "data/processed/test.csv",
        &meta("abc", 1, "preprocess"),
        "testing",
    );
    assert_eq!(input.name, "test");
    assert_eq!(input.digest, "abc");
    assert_eq!(input.source, "data/processed/test.csv");
    assert_eq!(input.context, "testing");

    let all = lineage::dataset_inputs(&splits(), |path| {
        if path.ends_with("test.csv") {
            "testing"
        } else {
            "training"
        }
    });
    let named: Vec<(&str, &str)> = all
        .iter()
        .map(|i| (i.name.as_str(), i.context.as_str()))
        .collect();
    assert_eq!(named, vec![("test", "testing"), ("train", "training")]);
}

#[test]
fn test_compare_data_versions() {
    // Newest first
    let runs = vec![
        run_with("c", Some("bbbbbbbb"), 0.96),
        run_with("b", Some("aaaaaaaa"), 0.93),
        run_with("a", Some("aaaaaaaa"), 0.90),
        run_with("z", None, 0.80),
    ];
    let cmp = compare_data_versions(&runs);
    assert_eq!(cmp.len(), 4);
    assert_eq!(cmp[0].changed(), Some(true));
    assert_eq!(cmp[0].previous_data_version.as_deref(), Some("aaaaaaaa"));
    assert_eq!(cmp[1].changed(), Some(false));
    assert_eq!(cmp[2].changed(), Some(true));
    assert_eq!(cmp[3].data_version, "N/A");
    assert_eq!(cmp[3].changed(), None);

    assert!(compare_data_versions(&[]).is_empty());
}
