use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const PARAMS: &str = "\
train:
  n_estimators: 10
  max_depth: 4
tracking:
  experiment: cli-exp
  model_name: cli-model
";

const LOCK: &str = "\
stages:
  preprocess:
    outs:
    - path: data/processed/train.csv
      md5: 11111111111111111111111111111111
      size: 3890
    - path: data/processed/test.csv
      md5: 22222222222222222222222222222222
      size: 990
";

fn workspace() -> TempDir {
    let tmp = TempDir::new().unwrap();
    std::fs::write(tmp.path().join("params.yaml"), PARAMS).unwrap();
    std::fs::write(tmp.path().join("dvc.lock"), LOCK).unwrap();
    tmp
}

fn mlpipe(root: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("mlpipe").unwrap();
    cmd.env_remove("MLPIPE_TRACKING_DIR")
        .env("RUST_LOG", "warn")
        .arg("--root")
        .arg(root.path());
    cmd
}

#[test]
fn test_help_lists_commands() {
    Command::cargo_bin("mlpipe")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("lineage"))
        .stdout(predicate::str::contains("reproduce"))
        .stdout(predicate::str::contains("compare-data"));
}

#[test]
fn test_run_then_inspect() {
    let tmp = workspace();
    mlpipe(&tmp)
        .arg("run")
        .assert()
        .success()
        .stdout(predicate::str::contains("train"))
        .stdout(predicate::str::contains("cli-model v1 -> Production"));

    mlpipe(&tmp)
        .arg("lineage")
        .assert()
        .success()
        .stdout(predicate::str::contains("Data lineage: cli-exp"))
        .stdout(predicate::str::contains("Run Name"));

    mlpipe(&tmp)
        .args(["lineage", "0"])
        .assert()
        .success()
        .stdout(predicate::str::contains("data/processed/train.csv"))
        .stdout(predicate::str::contains("model/model.json"));

    mlpipe(&tmp)
        .args(["lineage", "5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Invalid run index. Please use 0-0"));

    mlpipe(&tmp)
        .args(["models", "cli-model"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Production"))
        .stdout(predicate::str::contains("production"));

    mlpipe(&tmp)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("cli-exp"));
}

#[test]
fn test_stage_by_stage_and_compare() {
    let tmp = workspace();
    for stage in ["ingest", "preprocess", "train", "evaluate"] {
        mlpipe(&tmp).arg(stage).assert().success();
    }
    mlpipe(&tmp).arg("train").assert().success().stdout(predicate::str::contains("Staging"));

    mlpipe(&tmp)
        .arg("compare-data")
        .assert()
        .success()
        .stdout(predicate::str::contains("same data"));
}

#[test]
fn test_reproduce_updates_params() {
    let tmp = workspace();
    mlpipe(&tmp).arg("run").assert().success();
    std::fs::write(
        tmp.path().join("params.yaml"),
        PARAMS.replace("n_estimators: 10", "n_estimators: 30"),
    )
    .unwrap();

    mlpipe(&tmp)
        .args(["reproduce", "cli-model", "production", "--update-params"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Model URI: models:/cli-model@production"))
        .stdout(predicate::str::contains("n_estimators: 10"));

    let params = std::fs::read_to_string(tmp.path().join("params.yaml")).unwrap();
    assert!(params.contains("n_estimators: 10"));
    assert!(params.contains("cli-model"));
}

#[test]
fn test_export_metrics() {
    let tmp = workspace();
    mlpipe(&tmp).arg("run").assert().success();

    let mlruns = tmp.path().join("mlruns/experiments/cli-exp");
    let run_id = std::fs::read_dir(&mlruns)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().join("run.yaml").exists())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .next()
        .unwrap();

    mlpipe(&tmp)
        .args(["export", &run_id])
        .assert()
        .success()
        .stdout(predicate::str::contains("test_accuracy"))
        .stdout(predicate::str::contains("eval_accuracy"));
}

#[test]
fn test_errors_are_reported() {
    let tmp = workspace();
    mlpipe(&tmp)
        .arg("train")
        .assert()
        .failure()
        .stderr(predicate::str::contains("stage 'train' failed"));

    mlpipe(&tmp)
        .arg("lineage")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Experiment 'cli-exp' not found"));

    mlpipe(&tmp)
        .args(["reproduce", "missing-model", "production"])
        .assert()
        .failure();
}
