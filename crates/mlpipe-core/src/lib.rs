//! mlpipe-core: tracked ML pipeline with data lineage and model promotion.
//!
//! Stages run single-process and record everything through the file-backed
//! tracking store and model registry. The training stage fingerprints the
//! versioned data it consumed, links that lineage to its run, registers the
//! model and decides whether it replaces the production version.

pub mod classifier;
pub mod config;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod lineage;
pub mod metrics;
pub mod models;
pub mod promotion;
pub mod registry;
pub mod reproduce;
pub mod stages;
pub mod storage;
pub mod tracking;

pub use config::{PipelineParams, WorkspaceLayout};
pub use engine::{LogLevel, LoggingEngine};
pub use error::PipelineError;
pub use models::{DatasetInput, MetricValue, Run, RunConfig, RunStatus};
pub use promotion::{PromotionDecision, PromotionPolicy};
pub use registry::{FileModelRegistry, ModelRegistry, ModelVersion, Stage};
pub use stages::{PipelineStage, StageContext, StageReport};
pub use tracking::{FileTrackingStore, TrackingStore};
