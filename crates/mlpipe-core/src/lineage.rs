//! Data lineage: link data-versioning metadata to tracked runs.
//!
//! The data-versioning tool records an md5 and size for every tracked output in
//! `dvc.lock` (or in per-file `.dvc` pointer files). From these records we derive a
//! short deterministic `data_version` fingerprint, a set of run tags, dataset inputs
//! and browse URLs on the remote data host.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use ring::digest;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::models::{DatasetInput, Run};

pub const DATA_VERSION_KEY: &str = "data_version";
pub const URL_TAG_PREFIX: &str = "dagshub_url_";
const REMOTE_HOST: &str = "https://dagshub.com/";
const NOT_AVAILABLE: &str = "N/A";

/// Versioning record of one tracked data file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataFileMeta {
    pub md5: String,
    pub size: u64,
    /// Pipeline stage that produced the file
    pub stage: String,
}

/// Tracked files keyed by workspace-relative path.
pub type DataMetadata = BTreeMap<String, DataFileMeta>;

// ─── Versioning metadata files ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct DvcLock {
    #[serde(default)]
    stages: BTreeMap<String, DvcStage>,
}

#[derive(Debug, Deserialize)]
struct DvcStage {
    #[serde(default)]
    outs: Vec<DvcOut>,
}

#[derive(Debug, Deserialize)]
struct DvcOut {
    path: String,
    #[serde(default)]
    md5: Option<String>,
    #[serde(default)]
    size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct DvcPointer {
    #[serde(default)]
    outs: Vec<DvcOut>,
}

/// Collect metadata for the `wanted` outputs recorded in a `dvc.lock` file.
/// An empty `wanted` slice selects every output.
pub fn read_dvc_lock(path: &Path, wanted: &[&str]) -> Result<DataMetadata> {
    if !path.exists() {
        return Err(PipelineError::Lineage(format!(
            "lock file not found: {}",
            path.display()
        )));
    }
    let lock: DvcLock = serde_yaml::from_str(&fs::read_to_string(path)?)?;

    let mut metadata = DataMetadata::new();
    for (stage, record) in lock.stages {
        for out in record.outs {
            if !wanted.is_empty() && !wanted.contains(&out.path.as_str()) {
                continue;
            }
            let Some(md5) = out.md5.filter(|m| !m.is_empty()) else {
                warn!(path = %out.path, "Tracked output has no md5, skipping");
                continue;
            };
            metadata.insert(
                out.path,
                DataFileMeta {
                    md5,
                    size: out.size.unwrap_or(0),
                    stage: stage.clone(),
                },
            );
        }
    }

    for w in wanted {
        if !metadata.contains_key(*w) {
            warn!(path = %w, lock = %path.display(), "Output not recorded in lock file");
        }
    }
    debug!(files = metadata.len(), "Read data versioning metadata");
    Ok(metadata)
}

/// Read a single-file `.dvc` pointer. Returns the tracked path and its record.
pub fn read_dvc_pointer(path: &Path) -> Result<(String, DataFileMeta)> {
    let pointer: DvcPointer = serde_yaml::from_str(&fs::read_to_string(path)?)?;
    let out = pointer
        .outs
        .into_iter()
        .next()
        .ok_or_else(|| PipelineError::Lineage(format!("no outs in {}", path.display())))?;
    let md5 = out
        .md5
        .ok_or_else(|| PipelineError::Lineage(format!("no md5 for {}", out.path)))?;
    Ok((
        out.path,
        DataFileMeta {
            md5,
            size: out.size.unwrap_or(0),
            stage: "manual".to_string(),
        },
    ))
}

/// Deterministic fingerprint of a set of versioned files: SHA-256 over
/// `"<path>:<md5>\n"` in path order, truncated to 8 hex characters.
pub fn compute_data_version(metadata: &DataMetadata) -> Result<String> {
    if metadata.is_empty() {
        return Err(PipelineError::Lineage(
            "cannot fingerprint an empty dataset".to_string(),
        ));
    }
    let mut ctx = digest::Context::new(&digest::SHA256);
    for (path, meta) in metadata {
        ctx.update(path.as_bytes());
        ctx.update(b":");
        ctx.update(meta.md5.as_bytes());
        ctx.update(b"\n");
    }
    let hash = ctx.finish();
    let mut hex = String::with_capacity(8);
    for byte in &hash.as_ref()[..4] {
        let _ = write!(hex, "{:02x}", byte);
    }
    Ok(hex)
}

// ─── Remote data host ────────────────────────────────────────────────────────

/// Repository on the remote data host, parsed from the versioning tool's config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRepo {
    pub owner: String,
    pub name: String,
}

impl RemoteRepo {
    /// Parse `https://dagshub.com/<owner>/<repo>[.dvc][/...]`.
    pub fn from_url(url: &str) -> Option<Self> {
        let rest = url.trim().strip_prefix(REMOTE_HOST)?;
        let mut parts = rest.split('/');
        let owner = parts.next().filter(|s| !s.is_empty())?;
        let repo = parts.next().filter(|s| !s.is_empty())?;
        let repo = repo.strip_suffix(".dvc").unwrap_or(repo);
        Some(Self {
            owner: owner.to_string(),
            name: repo.to_string(),
        })
    }

    /// Scan the first existing config among `candidates` for a remote URL.
    pub fn from_dvc_config(candidates: &[PathBuf]) -> Option<Self> {
        let Some(config_path) = candidates.iter().find(|p| p.exists()) else {
            warn!("Data versioning config not found");
            return None;
        };
        let content = match fs::read_to_string(config_path) {
            Ok(c) => c,
            Err(e) => {
                warn!("Could not read {}: {}", config_path.display(), e);
                return None;
            }
        };
        content.lines().find_map(|line| {
            let (key, value) = line.split_once('=')?;
            if key.trim() != "url" {
                return None;
            }
            Self::from_url(value)
        })
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    pub fn repo_url(&self) -> String {
        format!("{}{}/{}", REMOTE_HOST, self.owner, self.name)
    }

    /// Browse URL of `path` at the version identified by `md5`.
    pub fn data_url(&self, path: &str, md5: &str) -> String {
        format!("{}/src/{}/{}", self.repo_url(), md5, path)
    }
}

/// Browse URLs for every file that has an md5.
pub fn all_data_urls(repo: &RemoteRepo, metadata: &DataMetadata) -> BTreeMap<String, String> {
    metadata
        .iter()
        .filter(|(_, meta)| !meta.md5.is_empty())
        .map(|(path, meta)| (path.clone(), repo.data_url(path, &meta.md5)))
        .collect()
}

fn sanitize(path: &str) -> String {
    path.replace(['/', '.'], "_")
}

pub fn url_tag_name(path: &str) -> String {
    format!("{}{}", URL_TAG_PREFIX, sanitize(path))
}

// ─── Run annotations ─────────────────────────────────────────────────────────

/// Tags linking a run to its data: fingerprint, per-file versioning records
/// and, when the remote repository is known, browse URLs.
pub fn lineage_tags(
    metadata: &DataMetadata,
    data_version: &str,
    repo: Option<&RemoteRepo>,
) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    tags.insert(DATA_VERSION_KEY.to_string(), data_version.to_string());

    for (path, meta) in metadata {
        let key = sanitize(path);
        tags.insert(format!("dvc_{}_md5", key), meta.md5.clone());
        tags.insert(format!("dvc_{}_size", key), meta.size.to_string());
        tags.insert(format!("dvc_{}_stage", key), meta.stage.clone());
    }

    match repo {
        Some(repo) => {
            tags.insert("dagshub_repo".to_string(), repo.full_name());
            tags.insert("dagshub_repo_url".to_string(), repo.repo_url());
            for (path, url) in all_data_urls(repo, metadata) {
                info!(path = %path, url = %url, "Linked data URL");
                tags.insert(url_tag_name(&path), url);
            }
        }
        None => warn!("Could not determine remote data repository"),
    }
    tags
}

pub fn dataset_input(path: &str, meta: &DataFileMeta, context: &str) -> DatasetInput {
    let name = Path::new(path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(path)
        .to_string();
    DatasetInput {
        name,
        digest: meta.md5.clone(),
        source: path.to_string(),
        context: context.to_string(),
    }
}

/// One input per tracked file; `context` maps each path to how the run used it.
pub fn dataset_inputs(
    metadata: &DataMetadata,
    context: impl Fn(&str) -> &'static str,
) -> Vec<DatasetInput> {
    metadata
        .iter()
        .map(|(path, meta)| dataset_input(path, meta, context(path)))
        .collect()
}

fn with_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Markdown report of the data a run was trained on.
pub fn format_lineage_info(
    data_version: &str,
    metadata: &DataMetadata,
    repo: Option<&RemoteRepo>,
) -> String {
    let mut lines = vec![
        "# Data Lineage Information\n".to_string(),
        format!("**Data Version:** `{}`\n", data_version),
        "\n## Datasets Used\n".to_string(),
    ];

    for (path, meta) in metadata {
        lines.push(format!("\n### {}", path));
        lines.push(format!("- **Stage:** {}", meta.stage));
        lines.push(format!("- **MD5:** `{}`", meta.md5));
        lines.push(format!("- **Size:** {} bytes", with_thousands(meta.size)));
        if let Some(repo) = repo {
            let short: String = meta.md5.chars().take(8).collect();
            lines.push(format!(
                "- **DagHub URL:** [{}@{}]({})",
                path,
                short,
                repo.data_url(path, &meta.md5)
            ));
        }
    }

    lines.join("\n")
}

// ─── Reading lineage back ────────────────────────────────────────────────────

/// Lineage view of a tracked run.
#[derive(Debug, Clone, Serialize)]
pub struct RunLineage {
    pub run_id: String,
    pub run_name: String,
    pub data_version: String,
    pub test_accuracy: f64,
    /// Dataset path → browse URL
    pub data_urls: BTreeMap<String, String>,
    pub datasets: Vec<DatasetInput>,
    /// Raw `dvc_*` tags
    pub dvc_metadata: BTreeMap<String, String>,
    pub repo: Option<String>,
    pub repo_url: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl RunLineage {
    pub fn from_run(run: &Run) -> Self {
        let mut data_urls = BTreeMap::new();
        for (key, value) in run.tags.iter().filter(|(k, _)| k.starts_with(URL_TAG_PREFIX)) {
            // Recover the real path from the recorded inputs when possible;
            // the tag name alone cannot tell '/' from '.' apart.
            let path = run
                .inputs
                .iter()
                .find(|input| url_tag_name(&input.source) == *key)
                .map(|input| input.source.clone())
                .unwrap_or_else(|| key[URL_TAG_PREFIX.len()..].replace('_', "/"));
            data_urls.insert(path, value.clone());
        }

        Self {
            run_id: run.info.run_id.clone(),
            run_name: run.info.run_name.clone(),
            data_version: data_version_of(run),
            test_accuracy: run.metric("test_accuracy").unwrap_or(0.0),
            data_urls,
            datasets: run.inputs.clone(),
            dvc_metadata: run
                .tags
                .iter()
                .filter(|(k, _)| k.starts_with("dvc_"))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            repo: run.tag("dagshub_repo").map(str::to_string),
            repo_url: run.tag("dagshub_repo_url").map(str::to_string),
            started_at: run.info.started_at,
        }
    }
}

/// `data_version` param of a run, or "N/A".
pub fn data_version_of(run: &Run) -> String {
    run.param(DATA_VERSION_KEY)
        .unwrap_or(NOT_AVAILABLE)
        .to_string()
}

/// Data version of one run compared with the run before it.
#[derive(Debug, Clone, Serialize)]
pub struct DataVersionComparison {
    pub run_id: String,
    pub run_name: String,
    pub data_version: String,
    pub test_accuracy: f64,
    /// Data version of the next older run, if there is one
    pub previous_data_version: Option<String>,
}

impl DataVersionComparison {
    /// Whether the data changed since the previous run. `None` for the oldest run.
    pub fn changed(&self) -> Option<bool> {
        self.previous_data_version
            .as_ref()
            .map(|prev| *prev != self.data_version)
    }
}

/// Compare data versions across `runs`, which must be ordered newest first.
pub fn compare_data_versions(runs: &[Run]) -> Vec<DataVersionComparison> {
    runs.iter()
        .enumerate()
        .map(|(i, run)| DataVersionComparison {
            run_id: run.info.run_id.clone(),
            run_name: run.info.run_name.clone(),
            data_version: data_version_of(run),
            test_accuracy: run.metric("test_accuracy").unwrap_or(0.0),
            previous_data_version: runs.get(i + 1).map(data_version_of),
        })
        .collect()
}
