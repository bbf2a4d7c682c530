//! Preprocess: stratified train/test split of the raw data.

use std::path::PathBuf;

use serde::Serialize;
use tracing::info;

use super::StageContext;
use crate::dataset::{Dataset, IRIS_TARGET_NAMES};
use crate::error::Result;

#[derive(Debug, Clone, Serialize)]
pub struct PreprocessReport {
    pub train_path: PathBuf,
    pub test_path: PathBuf,
    pub train_rows: usize,
    pub test_rows: usize,
}

pub fn run(ctx: &StageContext) -> Result<PreprocessReport> {
    info!("Starting data preprocessing");
    let params = &ctx.params.preprocess;

    let raw = Dataset::read_csv(&ctx.layout.raw_data(), &IRIS_TARGET_NAMES)?;
    info!(rows = raw.len(), features = raw.n_features(), "Loaded raw data");

    let (train, test) = raw.stratified_split(params.test_size, params.random_state)?;

    let train_path = ctx.layout.train_data();
    let test_path = ctx.layout.test_data();
    train.write_csv(&train_path, false)?;
    test.write_csv(&test_path, false)?;

    info!(path = %train_path.display(), rows = train.len(), "Train data saved");
    info!(path = %test_path.display(), rows = test.len(), "Test data saved");

    Ok(PreprocessReport {
        train_path,
        test_path,
        train_rows: train.len(),
        test_rows: test.len(),
    })
}
