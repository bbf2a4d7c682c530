//! Error types for mlpipe-core.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Logging engine channel closed")]
    ChannelClosed,

    #[error("Experiment not found: {0}")]
    ExperimentNotFound(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Registered model not found: {0}")]
    ModelNotFound(String),

    #[error("Model version not found: {name} v{version}")]
    VersionNotFound { name: String, version: u32 },

    #[error("Alias '{alias}' not found for model {name}")]
    AliasNotFound { name: String, alias: String },

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    #[error("Lineage metadata error: {0}")]
    Lineage(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
