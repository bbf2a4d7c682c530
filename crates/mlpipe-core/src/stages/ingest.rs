//! Ingest: materialize the raw dataset under `data/raw/`.

use std::path::PathBuf;

use serde::Serialize;
use tracing::info;

use super::StageContext;
use crate::dataset::{Dataset, IRIS_TARGET_NAMES};
use crate::error::Result;

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub path: PathBuf,
    pub rows: usize,
    pub features: usize,
    pub classes: Vec<String>,
}

pub fn run(ctx: &StageContext) -> Result<IngestReport> {
    info!("Starting data ingestion");

    let data = match &ctx.params.ingest.source {
        Some(source) => {
            let source = if source.is_absolute() {
                source.clone()
            } else {
                ctx.layout.root.join(source)
            };
            info!(source = %source.display(), "Reading configured source");
            Dataset::read_csv(&source, &IRIS_TARGET_NAMES)?
        }
        None => Dataset::iris()?,
    };

    let path = ctx.layout.raw_data();
    data.write_csv(&path, true)?;

    let report = IngestReport {
        path,
        rows: data.len(),
        features: data.n_features(),
        classes: data.present_classes(),
    };
    info!(path = %report.path.display(), "Data saved");
    info!(rows = report.rows, features = report.features, "Shape");
    info!(classes = ?report.classes, "Classes");
    Ok(report)
}
