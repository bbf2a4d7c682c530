//! mlpipe CLI: run pipeline stages and inspect lineage and the model registry.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::debug;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mlpipe_core::lineage::{self, RunLineage};
use mlpipe_core::{
    reproduce, storage, ModelRegistry, PipelineStage, StageContext, TrackingStore,
};

#[derive(Parser)]
#[command(
    name = "mlpipe",
    about = "Tracked ML pipeline with data lineage and model promotion",
    version
)]
struct Cli {
    /// Pipeline workspace root
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    /// Tracking directory (default: <root>/mlruns)
    #[arg(long, global = true, env = "MLPIPE_TRACKING_DIR")]
    tracking_dir: Option<PathBuf>,
    /// Also write JSON logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the raw dataset to data/raw
    Ingest,
    /// Split raw data into train and test sets
    Preprocess,
    /// Train, link data lineage, register and promote the model
    Train,
    /// Evaluate the tracked model and log results to its run
    Evaluate,
    /// Run every stage in order
    Run,
    /// Show data lineage of recent runs
    Lineage {
        /// Show details for the run at this index
        index: Option<usize>,
        /// Experiment name (default: tracking.experiment from params)
        #[arg(long, short)]
        experiment: Option<String>,
        /// Number of runs to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Detect data version changes between consecutive runs
    CompareData {
        #[arg(long, short)]
        experiment: Option<String>,
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
    /// Retrieve the parameters behind a registered model version
    Reproduce {
        /// Registered model name (e.g. iris-classifier)
        model: String,
        /// Version number or alias (e.g. 5, production, staging)
        version: String,
        /// Write the hyperparameters into params.yaml
        #[arg(long)]
        update_params: bool,
    },
    /// Show registered models, or the versions of one model
    Models {
        model: Option<String>,
    },
    /// List experiments and their runs
    List {
        #[arg(long, short)]
        experiment: Option<String>,
    },
    /// Export the metric history of a run to CSV or JSON
    Export {
        run_id: String,
        #[arg(long, short, default_value = "csv", value_parser = ["csv", "json"])]
        format: String,
        /// Output file (default: stdout)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = init_tracing(cli.log_file.as_deref())?;

    let ctx = StageContext::load(&cli.root, cli.tracking_dir.clone())
        .with_context(|| format!("loading pipeline params from {}", cli.root.display()))?;
    debug!(
        root = %ctx.layout.root.display(),
        tracking_dir = %ctx.tracking_dir.display(),
        "Loaded pipeline params"
    );

    match cli.command {
        Commands::Ingest => cmd_stage(&ctx, PipelineStage::Ingest)?,
        Commands::Preprocess => cmd_stage(&ctx, PipelineStage::Preprocess)?,
        Commands::Train => cmd_stage(&ctx, PipelineStage::Train)?,
        Commands::Evaluate => cmd_stage(&ctx, PipelineStage::Evaluate)?,
        Commands::Run => cmd_run(&ctx)?,
        Commands::Lineage {
            index,
            experiment,
            limit,
        } => cmd_lineage(&ctx, experiment, limit, index)?,
        Commands::CompareData { experiment, limit } => cmd_compare_data(&ctx, experiment, limit)?,
        Commands::Reproduce {
            model,
            version,
            update_params,
        } => cmd_reproduce(&ctx, &model, &version, update_params)?,
        Commands::Models { model } => cmd_models(&ctx, model)?,
        Commands::List { experiment } => cmd_list(&ctx, experiment)?,
        Commands::Export {
            run_id,
            format,
            output,
        } => cmd_export(&ctx, &run_id, &format, output)?,
    }

    Ok(())
}

fn init_tracing(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact();

    match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            std::fs::create_dir_all(dir)?;
            let file_name = path
                .file_name()
                .with_context(|| format!("invalid log file path: {}", path.display()))?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(fmt::layer().json().with_writer(writer))
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry().with(filter).with(console).init();
            Ok(None)
        }
    }
}

// ─── Pipeline commands ────────────────────────────────────────────────────────

fn cmd_stage(ctx: &StageContext, stage: PipelineStage) -> Result<()> {
    let report = ctx
        .run_stage(stage)
        .with_context(|| format!("stage '{}' failed", stage.name()))?;
    println!("✓ {}: {}", stage.name(), report);
    Ok(())
}

fn cmd_run(ctx: &StageContext) -> Result<()> {
    let pb = ProgressBar::new(PipelineStage::ALL.len() as u64);
    pb.set_style(ProgressStyle::with_template(
        "{spinner} [{bar:20}] {pos}/{len} {msg}",
    )?);

    for stage in PipelineStage::ALL {
        pb.set_message(stage.name());
        let report = ctx
            .run_stage(stage)
            .with_context(|| format!("stage '{}' failed", stage.name()))?;
        pb.suspend(|| println!("✓ {}: {}", stage.name(), report));
        pb.inc(1);
    }
    pb.finish_with_message("pipeline complete");
    Ok(())
}

// ─── Lineage commands ─────────────────────────────────────────────────────────

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn cmd_lineage(
    ctx: &StageContext,
    experiment: Option<String>,
    limit: usize,
    index: Option<usize>,
) -> Result<()> {
    let experiment = experiment.unwrap_or_else(|| ctx.params.tracking.experiment.clone());
    let store = ctx.tracking_store();
    if store.get_experiment(&experiment)?.is_none() {
        anyhow::bail!("Experiment '{}' not found", experiment);
    }

    let runs = store.search_runs(&experiment, limit)?;
    if runs.is_empty() {
        println!("No runs found for experiment '{}'", experiment);
        return Ok(());
    }
    let lineages: Vec<RunLineage> = runs.iter().map(RunLineage::from_run).collect();

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(["#", "Run ID", "Run Name", "Data Version", "Test Acc", "Datasets", "Data URLs"]);
    for (i, l) in lineages.iter().enumerate() {
        table.add_row([
            i.to_string(),
            short_id(&l.run_id).to_string(),
            l.run_name.clone(),
            l.data_version.clone(),
            format!("{:.4}", l.test_accuracy),
            l.datasets.len().to_string(),
            l.data_urls.len().to_string(),
        ]);
    }
    println!("Data lineage: {}", experiment);
    println!("{}", table);

    match index {
        Some(i) if i < lineages.len() => print_lineage_detail(ctx, &lineages[i], &experiment)?,
        Some(_) => println!(
            "Invalid run index. Please use 0-{}",
            lineages.len() - 1
        ),
        None => println!("To view detailed lineage for a run: mlpipe lineage <index>"),
    }
    Ok(())
}

fn print_lineage_detail(ctx: &StageContext, l: &RunLineage, experiment: &str) -> Result<()> {
    println!();
    println!("── Run {} ──────────────────────────────", l.run_id);
    println!("Run Name: {}", l.run_name);
    println!("Started: {}", l.started_at.format("%Y-%m-%d %H:%M:%S"));
    println!("Data Version: {}", l.data_version);
    println!("Test Accuracy: {:.4}", l.test_accuracy);

    println!();
    println!("── Datasets ─────────────────────────────");
    if l.datasets.is_empty() {
        println!("No dataset information logged");
    }
    for d in &l.datasets {
        println!("{} ({})", d.name, d.context);
        println!("  Source: {}", d.source);
        println!("  Digest: {}", d.digest);
    }

    println!();
    println!("── Data URLs ────────────────────────────");
    if let (Some(repo), Some(url)) = (&l.repo, &l.repo_url) {
        println!("Repository: {} ({})", repo, url);
    }
    if l.data_urls.is_empty() {
        println!("No data URLs logged");
    }
    for (path, url) in &l.data_urls {
        println!("{}", path);
        println!("  {}", url);
    }

    let run_dir = ctx.tracking_store().run_dir(experiment, &l.run_id);
    let artifacts = storage::list_artifacts(&run_dir)?;
    if !artifacts.is_empty() {
        println!();
        println!("── Artifacts ({}) ──────────────────────", artifacts.len());
        for a in &artifacts {
            println!("  {} ({} bytes)", a.path, a.size);
        }
    }
    Ok(())
}

fn cmd_compare_data(ctx: &StageContext, experiment: Option<String>, limit: usize) -> Result<()> {
    let experiment = experiment.unwrap_or_else(|| ctx.params.tracking.experiment.clone());
    let runs = ctx.tracking_store().search_runs(&experiment, limit)?;
    let comparisons = lineage::compare_data_versions(&runs);
    if comparisons.is_empty() {
        println!("No runs found for experiment '{}'", experiment);
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(["Run ID", "Run Name", "Data Version", "Test Acc", "Since Previous"]);
    for c in &comparisons {
        let change = match (c.changed(), &c.previous_data_version) {
            (Some(true), Some(prev)) => format!("changed (was {})", prev),
            (Some(false), _) => "same data".to_string(),
            _ => "-".to_string(),
        };
        table.add_row([
            short_id(&c.run_id).to_string(),
            c.run_name.clone(),
            c.data_version.clone(),
            format!("{:.4}", c.test_accuracy),
            change,
        ]);
    }
    println!("Data versions across the last {} runs of {}", comparisons.len(), experiment);
    println!("{}", table);
    Ok(())
}

// ─── Registry commands ────────────────────────────────────────────────────────

fn cmd_reproduce(ctx: &StageContext, model: &str, version: &str, update_params: bool) -> Result<()> {
    println!("Retrieving experiment info for {} @ {}...", model, version);
    let info = reproduce::experiment_info(&ctx.tracking_store(), &ctx.registry(), model, version)?;

    println!();
    println!("Run ID: {}", info.run_id);
    println!("Model Version: {}", info.model_version);
    println!("Model URI: {}", info.model_uri);

    println!();
    println!("Parameters:");
    for (k, v) in &info.params {
        println!("  {}: {}", k, v);
    }
    println!();
    println!("Metrics:");
    let mut metrics: Vec<_> = info.metrics.iter().collect();
    metrics.sort_by(|a, b| a.0.cmp(b.0));
    for (k, v) in metrics {
        println!("  {}: {:.4}", k, v);
    }
    println!();
    println!("Tags:");
    for (k, v) in &info.tags {
        println!("  {}: {}", k, v);
    }

    let path = reproduce::save_experiment_info(&ctx.layout.root, &info)?;
    println!();
    println!("Saved to: {}", path.display());

    if update_params {
        reproduce::update_train_params(&ctx.layout.params_file(), &info.params)?;
        println!("Updated {}", ctx.layout.params_file().display());
        println!("To reproduce: mlpipe run");
    } else {
        println!("To reproduce: update params.yaml with the parameters above, then mlpipe run");
        println!("Or rerun with --update-params to update params.yaml automatically");
    }
    Ok(())
}

fn cmd_models(ctx: &StageContext, model: Option<String>) -> Result<()> {
    let registry = ctx.registry();
    let Some(model) = model else {
        let models = registry.list_models()?;
        if models.is_empty() {
            println!("No registered models in '{}'", ctx.tracking_dir.display());
        }
        for name in models {
            println!("{}", name);
        }
        return Ok(());
    };

    let versions = registry.list_versions(&model)?;
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(["Version", "Stage", "Aliases", "Run", "Data Version", "Decision", "Created"]);
    for v in &versions {
        table.add_row([
            v.version.to_string(),
            v.stage.to_string(),
            if v.aliases.is_empty() { "-".to_string() } else { v.aliases.join(", ") },
            short_id(&v.run_id).to_string(),
            v.tag(lineage::DATA_VERSION_KEY).unwrap_or("-").to_string(),
            v.tag(mlpipe_core::promotion::DECISION_TAG).unwrap_or("-").to_string(),
            v.created_at.format("%Y-%m-%d %H:%M").to_string(),
        ]);
    }
    println!("Model: {}", model);
    println!("{}", table);
    Ok(())
}

// ─── Run inspection ───────────────────────────────────────────────────────────

fn cmd_list(ctx: &StageContext, experiment: Option<String>) -> Result<()> {
    let store = ctx.tracking_store();
    if let Some(exp_name) = experiment {
        let runs = store.search_runs(&exp_name, usize::MAX)?;
        if runs.is_empty() {
            println!("No runs found for experiment '{}'", exp_name);
            return Ok(());
        }

        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(["Run ID", "Name", "Status", "Started", "Duration", "Data Version"]);
        for run in &runs {
            let duration = run
                .info
                .duration_secs
                .map(format_duration)
                .unwrap_or_else(|| "running".to_string());
            table.add_row([
                run.info.run_id.clone(),
                run.info.run_name.clone(),
                run.info.status.to_string(),
                run.info.started_at.format("%Y-%m-%d %H:%M").to_string(),
                duration,
                lineage::data_version_of(run),
            ]);
        }
        println!("Experiment: {}", exp_name);
        println!("{}", table);
    } else {
        let experiments = storage::list_experiments(&ctx.tracking_dir)?;
        if experiments.is_empty() {
            println!("No experiments found in '{}'", ctx.tracking_dir.display());
            return Ok(());
        }

        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(["Experiment", "Runs"]);
        for exp_name in &experiments {
            let exp_dir = mlpipe_core::models::experiment_dir(&ctx.tracking_dir, exp_name);
            let runs = storage::list_runs(&exp_dir).unwrap_or_default();
            table.add_row([exp_name.clone(), runs.len().to_string()]);
        }
        println!("Experiments in: {}", ctx.tracking_dir.display());
        println!("{}", table);
    }
    Ok(())
}

fn cmd_export(ctx: &StageContext, run_id: &str, format: &str, output: Option<PathBuf>) -> Result<()> {
    let store = ctx.tracking_store();
    let run = store.find_run(run_id)?;
    let metrics_path = store
        .run_dir(&run.info.experiment, run_id)
        .join(storage::METRICS_FILE);
    if !metrics_path.exists() {
        anyhow::bail!("No metrics recorded for run {}", run_id);
    }

    let rows = storage::read_metrics(&metrics_path)?;
    let content = match format {
        "json" => serde_json::to_string_pretty(&rows)?,
        "csv" => {
            let mut keys: Vec<String> = rows
                .iter()
                .flat_map(|r| r.keys().cloned())
                .collect();
            keys.sort();
            keys.dedup();
            let mut out = keys.join(",") + "\n";
            for row in &rows {
                let vals: Vec<String> = keys
                    .iter()
                    .map(|k| match row.get(k) {
                        Some(serde_json::Value::Null) | None => String::new(),
                        Some(serde_json::Value::String(s)) => s.clone(),
                        Some(v) => v.to_string(),
                    })
                    .collect();
                out += &(vals.join(",") + "\n");
            }
            out
        }
        other => anyhow::bail!("Unknown format: {}", other),
    };

    match output {
        Some(path) => {
            std::fs::write(&path, &content)?;
            println!("Exported {} rows to {}", rows.len(), path.display());
        }
        None => print!("{}", content),
    }
    Ok(())
}

// ─── Utilities ────────────────────────────────────────────────────────────────

fn format_duration(secs: f64) -> String {
    let secs = secs as u64;
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    if h > 0 {
        format!("{}h {}m", h, m)
    } else if m > 0 {
        format!("{}m {}s", m, s)
    } else {
        format!("{}s", s)
    }
}
