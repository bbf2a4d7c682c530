//! Async run logging engine.
//!
//! `LoggingEngine::start()` spawns a background tokio task that owns all file handles
//! of the active run. Logging calls are channel sends and never block the stage code.
//! The background task batches metric rows and flushes them to Parquet periodically.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;
use tracing::{error, info};

use crate::error::{PipelineError, Result};
use crate::models::{
    DatasetInput, ExperimentMetadata, MetricRow, MetricValue, RunConfig, RunMetadata, RunStatus,
};
use crate::storage;

/// Commands sent to the background logging task.
enum LogCommand {
    Metric(MetricRow),
    Params(BTreeMap<String, String>),
    Tags(BTreeMap<String, String>),
    Input(DatasetInput),
    /// Copy a file into the run's artifacts directory under `dest`.
    ArtifactFile { src: PathBuf, dest: PathBuf },
    /// Write raw bytes as an artifact under `dest`.
    ArtifactBytes { dest: PathBuf, bytes: Vec<u8> },
    Log { level: LogLevel, message: String },
    Flush(oneshot::Sender<Result<()>>),
    /// Flush everything, write final metadata and stop.
    Shutdown {
        status: RunStatus,
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone, Copy)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

/// The non-blocking logger of the active run.
///
/// Holds a sender to an unbounded channel. All I/O happens in a background
/// task on a dedicated single-worker tokio runtime.
pub struct LoggingEngine {
    sender: mpsc::UnboundedSender<LogCommand>,
    runtime: Arc<Runtime>,
    config: RunConfig,
}

impl LoggingEngine {
    /// Start a new run: create its directory, write `run.yaml` as RUNNING and
    /// spawn the background I/O task.
    pub fn start(config: RunConfig) -> Result<Self> {
        let run_dir = config.run_dir();
        storage::ensure_dir(&run_dir.join(storage::ARTIFACTS_DIR))?;

        let exp_dir = config.experiment_dir();
        if !exp_dir.join("experiment.yaml").exists() {
            storage::save_experiment_metadata(
                &exp_dir,
                &ExperimentMetadata {
                    display_name: Some(config.experiment.clone()),
                    ..Default::default()
                },
            )?;
        }

        let meta = RunMetadata {
            run_id: config.run_id.clone(),
            run_name: config.run_name.clone(),
            experiment: config.experiment.clone(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            ..Default::default()
        };
        storage::save_run_metadata(&run_dir, &meta)?;

        let engine = Self::spawn(config, meta.started_at)?;
        info!(
            experiment = %engine.config.experiment,
            run_id = %engine.config.run_id,
            run_name = %engine.config.run_name,
            "Run started"
        );
        Ok(engine)
    }

    /// Reattach to an existing run, e.g. to log evaluation metrics into the
    /// training run. The original start time is kept.
    pub fn resume(tracking_dir: &Path, experiment: &str, run_id: &str) -> Result<Self> {
        let mut config = RunConfig::new(experiment, tracking_dir);
        config.run_id = run_id.to_string();

        let run_dir = config.run_dir();
        if !run_dir.join(storage::RUN_FILE).exists() {
            return Err(PipelineError::RunNotFound(run_id.to_string()));
        }
        let mut meta = storage::load_run_metadata(&run_dir)?;
        config.run_name = meta.run_name.clone();
        meta.status = RunStatus::Running;
        meta.finished_at = None;
        storage::save_run_metadata(&run_dir, &meta)?;

        let engine = Self::spawn(config, meta.started_at)?;
        info!(experiment = %experiment, run_id = %run_id, "Run resumed");
        Ok(engine)
    }

    fn spawn(config: RunConfig, started_at: DateTime<Utc>) -> Result<Self> {
        let runtime = Arc::new(
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .thread_name("mlpipe-io")
                .enable_all()
                .build()
                .map_err(|e| PipelineError::Other(e.to_string()))?,
        );

        let (sender, receiver) = mpsc::unbounded_channel::<LogCommand>();
        runtime.spawn(background_task(
            receiver,
            config.run_dir(),
            started_at,
            config.flush_interval_rows,
            config.flush_interval_ms,
        ));

        Ok(Self {
            sender,
            runtime,
            config,
        })
    }

    /// Log a row of metrics. Non-blocking.
    pub fn log_metrics(&self, values: HashMap<String, MetricValue>, step: Option<u64>) {
        let row = MetricRow::new(values, step);
        // A closed channel means the run is already shut down
        let _ = self.sender.send(LogCommand::Metric(row));
    }

    /// Log run parameters. Values are stored as strings.
    pub fn log_params<I, K, V>(&self, params: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        let params = params
            .into_iter()
            .map(|(k, v)| (k.into(), v.to_string()))
            .collect();
        let _ = self.sender.send(LogCommand::Params(params));
    }

    pub fn set_tags(&self, tags: BTreeMap<String, String>) {
        let _ = self.sender.send(LogCommand::Tags(tags));
    }

    /// Record a dataset consumed by this run.
    pub fn log_input(&self, input: DatasetInput) {
        let _ = self.sender.send(LogCommand::Input(input));
    }

    /// Copy `src` into the run's artifacts directory at the relative path `dest`.
    pub fn log_artifact(&self, src: PathBuf, dest: impl Into<PathBuf>) {
        let _ = self.sender.send(LogCommand::ArtifactFile {
            src,
            dest: dest.into(),
        });
    }

    /// Write `bytes` as an artifact at the relative path `dest`.
    pub fn log_artifact_bytes(&self, dest: impl Into<PathBuf>, bytes: Vec<u8>) {
        let _ = self.sender.send(LogCommand::ArtifactBytes {
            dest: dest.into(),
            bytes,
        });
    }

    pub fn log_message(&self, level: LogLevel, message: impl Into<String>) {
        let _ = self.sender.send(LogCommand::Log {
            level,
            message: message.into(),
        });
    }

    /// Force a flush of all buffered records. Awaits completion.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(LogCommand::Flush(tx))
            .map_err(|_| PipelineError::ChannelClosed)?;
        rx.await.map_err(|_| PipelineError::ChannelClosed)?
    }

    /// Blocking variant of [`flush`](Self::flush) for synchronous callers.
    pub fn flush_blocking(&self) -> Result<()> {
        self.runtime.block_on(self.flush())
    }

    /// Flush pending records and write the final status. Blocks until done.
    pub fn close(&self, status: RunStatus) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(LogCommand::Shutdown { status, reply: tx })
            .is_ok()
        {
            let _ = self.runtime.block_on(rx);
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn run_id(&self) -> &str {
        &self.config.run_id
    }
}

impl Drop for LoggingEngine {
    fn drop(&mut self) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(LogCommand::Shutdown {
                status: RunStatus::Finished,
                reply: tx,
            })
            .is_ok()
        {
            let _ = self
                .runtime
                .block_on(async { tokio::time::timeout(Duration::from_secs(5), rx).await });
        }
    }
}

// ─── Background I/O task ─────────────────────────────────────────────────────

async fn background_task(
    mut receiver: mpsc::UnboundedReceiver<LogCommand>,
    run_dir: PathBuf,
    started_at: DateTime<Utc>,
    flush_interval_rows: usize,
    flush_interval_ms: u64,
) {
    let metrics_path = run_dir.join(storage::METRICS_FILE);
    let log_path = run_dir.join(storage::LOG_FILE);
    let artifacts_dir = run_dir.join(storage::ARTIFACTS_DIR);

    let mut metric_buffer: Vec<MetricRow> = Vec::with_capacity(flush_interval_rows * 2);
    let mut log_lines: Vec<String> = Vec::new();
    let mut flush_ticker = interval(Duration::from_millis(flush_interval_ms));
    flush_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            cmd = receiver.recv() => {
                match cmd {
                    None => {
                        flush_metrics(&metrics_path, &mut metric_buffer);
                        flush_logs(&log_path, &mut log_lines);
                        break;
                    }
                    Some(LogCommand::Metric(row)) => {
                        metric_buffer.push(row);
                        if metric_buffer.len() >= flush_interval_rows {
                            flush_metrics(&metrics_path, &mut metric_buffer);
                        }
                    }
                    Some(LogCommand::Params(params)) => {
                        merge_map(&run_dir.join(storage::PARAMS_FILE), params, "params");
                    }
                    Some(LogCommand::Tags(tags)) => {
                        merge_map(&run_dir.join(storage::TAGS_FILE), tags, "tags");
                    }
                    Some(LogCommand::Input(input)) => {
                        handle_input(&run_dir, input);
                    }
                    Some(LogCommand::ArtifactFile { src, dest }) => {
                        handle_artifact_file(&artifacts_dir, &src, &dest);
                    }
                    Some(LogCommand::ArtifactBytes { dest, bytes }) => {
                        handle_artifact_bytes(&artifacts_dir, &dest, &bytes);
                    }
                    Some(LogCommand::Log { level, message }) => {
                        let ts = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
                        log_lines.push(format!("[{ts}] [{}] {message}", level.as_str()));
                        if log_lines.len() >= 20 {
                            flush_logs(&log_path, &mut log_lines);
                        }
                    }
                    Some(LogCommand::Flush(reply)) => {
                        let result = storage::append_metrics(&metrics_path, &metric_buffer);
                        metric_buffer.clear();
                        flush_logs(&log_path, &mut log_lines);
                        let _ = reply.send(result);
                    }
                    Some(LogCommand::Shutdown { status, reply }) => {
                        flush_metrics(&metrics_path, &mut metric_buffer);
                        flush_logs(&log_path, &mut log_lines);
                        finalize_run(&run_dir, &metrics_path, status, started_at);
                        let _ = reply.send(());
                        break;
                    }
                }
            }

            _ = flush_ticker.tick() => {
                if !metric_buffer.is_empty() {
                    flush_metrics(&metrics_path, &mut metric_buffer);
                }
                if !log_lines.is_empty() {
                    flush_logs(&log_path, &mut log_lines);
                }
            }
        }
    }
}

fn finalize_run(run_dir: &Path, metrics_path: &Path, status: RunStatus, started_at: DateTime<Utc>) {
    let finished_at = Utc::now();
    let duration = (finished_at - started_at).num_milliseconds() as f64 / 1000.0;

    match storage::load_run_metadata(run_dir) {
        Ok(mut meta) => {
            info!(run_id = %meta.run_id, status = %status, "Run closed");
            meta.status = status;
            meta.finished_at = Some(finished_at);
            meta.duration_secs = Some(duration);
            match storage::read_latest_scalar_metrics(metrics_path) {
                Ok(latest) if !latest.is_empty() => meta.metrics = Some(latest),
                Ok(_) => {}
                Err(e) => error!("Failed to read latest metrics: {}", e),
            }
            if let Err(e) = storage::save_run_metadata(run_dir, &meta) {
                error!("Failed to write final run metadata: {}", e);
            }
        }
        Err(e) => error!("Failed to load run metadata on close: {}", e),
    }
}

fn flush_metrics(path: &Path, buffer: &mut Vec<MetricRow>) {
    if buffer.is_empty() {
        return;
    }
    if let Err(e) = storage::append_metrics(path, buffer) {
        error!("Failed to flush metrics: {}", e);
    }
    buffer.clear();
}

fn flush_logs(path: &Path, lines: &mut Vec<String>) {
    if lines.is_empty() {
        return;
    }
    use std::io::Write;
    match fs::OpenOptions::new().create(true).append(true).open(path) {
        Ok(mut f) => {
            for line in lines.iter() {
                let _ = writeln!(f, "{}", line);
            }
        }
        Err(e) => error!("Failed to write log: {}", e),
    }
    lines.clear();
}

fn merge_map(path: &Path, entries: BTreeMap<String, String>, what: &str) {
    if let Err(e) = storage::merge_string_map(path, entries) {
        error!("Failed to save {}: {}", what, e);
    }
}

fn handle_input(run_dir: &Path, input: DatasetInput) {
    let result = storage::load_inputs(run_dir).and_then(|mut inputs| {
        inputs.retain(|i| !(i.name == input.name && i.context == input.context));
        inputs.push(input);
        storage::save_yaml(&run_dir.join(storage::INPUTS_FILE), &inputs)
    });
    if let Err(e) = result {
        error!("Failed to record dataset input: {}", e);
    }
}

/// Artifact destinations are always relative to the artifacts directory.
fn artifact_dest(artifacts_dir: &Path, dest: &Path) -> Option<PathBuf> {
    let rel: PathBuf = dest
        .components()
        .filter(|c| matches!(c, std::path::Component::Normal(_)))
        .collect();
    if rel.as_os_str().is_empty() {
        error!("Invalid artifact destination: {}", dest.display());
        return None;
    }
    let full = artifacts_dir.join(rel);
    if let Some(parent) = full.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            error!("Failed to create artifact dir: {}", e);
            return None;
        }
    }
    Some(full)
}

fn handle_artifact_file(artifacts_dir: &Path, src: &Path, dest: &Path) {
    let Some(full) = artifact_dest(artifacts_dir, dest) else {
        return;
    };
    if let Err(e) = fs::copy(src, &full) {
        error!(
            "Failed to copy artifact {} -> {}: {}",
            src.display(),
            full.display(),
            e
        );
    }
}

fn handle_artifact_bytes(artifacts_dir: &Path, dest: &Path, bytes: &[u8]) {
    let Some(full) = artifact_dest(artifacts_dir, dest) else {
        return;
    };
    if let Err(e) = fs::write(&full, bytes) {
        error!("Failed to write artifact {}: {}", full.display(), e);
    }
}
