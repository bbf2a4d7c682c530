//! Model registry: numbered versions, lifecycle stages and aliases.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::storage;

/// Lifecycle stage of a model version.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Stage {
    #[default]
    None,
    Staging,
    Production,
    Archived,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::None => write!(f, "None"),
            Stage::Staging => write!(f, "Staging"),
            Stage::Production => write!(f, "Production"),
            Stage::Archived => write!(f, "Archived"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelVersion {
    pub name: String,
    pub version: u32,
    pub run_id: String,
    /// Artifact location of the model, relative to the run
    pub source: String,
    #[serde(default)]
    pub stage: Stage,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub description: Option<String>,
}

impl ModelVersion {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

/// Registry record of one model, with all its versions.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RegisteredModel {
    pub name: String,
    #[serde(default)]
    pub versions: Vec<ModelVersion>,
}

impl RegisteredModel {
    fn version_mut(&mut self, version: u32) -> Result<&mut ModelVersion> {
        let name = self.name.clone();
        self.versions
            .iter_mut()
            .find(|v| v.version == version)
            .ok_or(PipelineError::VersionNotFound { name, version })
    }
}

pub trait ModelRegistry {
    fn register_model_version(&self, name: &str, run_id: &str, source: &str)
        -> Result<ModelVersion>;

    fn get_model_version(&self, name: &str, version: u32) -> Result<ModelVersion>;

    fn get_version_by_alias(&self, name: &str, alias: &str) -> Result<ModelVersion>;

    /// All versions, ascending.
    fn list_versions(&self, name: &str) -> Result<Vec<ModelVersion>>;

    /// Point `alias` at `version`. An alias names at most one version.
    fn set_alias(&self, name: &str, alias: &str, version: u32) -> Result<()>;

    fn delete_alias(&self, name: &str, alias: &str) -> Result<()>;

    fn set_version_tag(&self, name: &str, version: u32, key: &str, value: &str) -> Result<()>;

    /// Move `version` to `stage`. With `archive_existing`, every other version
    /// currently in `stage` is archived.
    fn transition_stage(
        &self,
        name: &str,
        version: u32,
        stage: Stage,
        archive_existing: bool,
    ) -> Result<ModelVersion>;

    /// Resolve a reference that is either an alias or a version number.
    /// Aliases win.
    fn resolve(&self, name: &str, version_or_alias: &str) -> Result<ModelVersion> {
        match self.get_version_by_alias(name, version_or_alias) {
            Ok(mv) => Ok(mv),
            Err(PipelineError::AliasNotFound { .. }) => {
                let version: u32 = version_or_alias.parse().map_err(|_| {
                    PipelineError::AliasNotFound {
                        name: name.to_string(),
                        alias: version_or_alias.to_string(),
                    }
                })?;
                self.get_model_version(name, version)
            }
            Err(e) => Err(e),
        }
    }

    /// Highest version in `stage`, if any.
    fn latest_version(&self, name: &str, stage: Stage) -> Result<Option<ModelVersion>> {
        Ok(self
            .list_versions(name)?
            .into_iter()
            .filter(|v| v.stage == stage)
            .max_by_key(|v| v.version))
    }
}

/// Registry persisted as one YAML document per model under `registry/`.
#[derive(Debug, Clone)]
pub struct FileModelRegistry {
    root: PathBuf,
}

impl FileModelRegistry {
    pub fn new(tracking_dir: &Path) -> Self {
        Self {
            root: storage::registry_root(tracking_dir),
        }
    }

    fn model_path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(PipelineError::InvalidParam(format!(
                "invalid model name '{}'",
                name
            )));
        }
        Ok(self.root.join(format!("{}.yaml", name)))
    }

    fn load(&self, name: &str) -> Result<RegisteredModel> {
        let path = self.model_path(name)?;
        if !path.exists() {
            return Err(PipelineError::ModelNotFound(name.to_string()));
        }
        storage::load_yaml(&path)
    }

    fn save(&self, model: &RegisteredModel) -> Result<()> {
        storage::ensure_dir(&self.root)?;
        storage::save_yaml(&self.model_path(&model.name)?, model)
    }

    fn update<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut RegisteredModel) -> Result<T>,
    ) -> Result<T> {
        let mut model = self.load(name)?;
        let out = f(&mut model)?;
        self.save(&model)?;
        Ok(out)
    }

    pub fn list_models(&self) -> Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(vec![]);
        }
        let mut names = vec![];
        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("yaml") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

impl ModelRegistry for FileModelRegistry {
    fn register_model_version(
        &self,
        name: &str,
        run_id: &str,
        source: &str,
    ) -> Result<ModelVersion> {
        let path = self.model_path(name)?;
        let mut model = if path.exists() {
            self.load(name)?
        } else {
            info!(model = %name, "Creating registered model");
            RegisteredModel {
                name: name.to_string(),
                versions: vec![],
            }
        };

        let next = model.versions.iter().map(|v| v.version).max().unwrap_or(0) + 1;
        let mv = ModelVersion {
            name: name.to_string(),
            version: next,
            run_id: run_id.to_string(),
            source: source.to_string(),
            stage: Stage::None,
            aliases: vec![],
            tags: BTreeMap::new(),
            created_at: Utc::now(),
            description: None,
        };
        model.versions.push(mv.clone());
        self.save(&model)?;

        info!(model = %name, version = next, run_id = %run_id, "Registered model version");
        Ok(mv)
    }

    fn get_model_version(&self, name: &str, version: u32) -> Result<ModelVersion> {
        self.load(name)?
            .versions
            .into_iter()
            .find(|v| v.version == version)
            .ok_or(PipelineError::VersionNotFound {
                name: name.to_string(),
                version,
            })
    }

    fn get_version_by_alias(&self, name: &str, alias: &str) -> Result<ModelVersion> {
        self.load(name)?
            .versions
            .into_iter()
            .find(|v| v.aliases.iter().any(|a| a == alias))
            .ok_or(PipelineError::AliasNotFound {
                name: name.to_string(),
                alias: alias.to_string(),
            })
    }

    fn list_versions(&self, name: &str) -> Result<Vec<ModelVersion>> {
        let mut versions = self.load(name)?.versions;
        versions.sort_by_key(|v| v.version);
        Ok(versions)
    }

    fn set_alias(&self, name: &str, alias: &str, version: u32) -> Result<()> {
        if alias.is_empty() || alias.parse::<u32>().is_ok() {
            return Err(PipelineError::InvalidParam(format!(
                "alias '{}' must be a non-numeric name",
                alias
            )));
        }
        self.update(name, |model| {
            model.version_mut(version)?;
            for v in model.versions.iter_mut() {
                v.aliases.retain(|a| a != alias);
                if v.version == version {
                    v.aliases.push(alias.to_string());
                }
            }
            Ok(())
        })?;
        info!(model = %name, alias = %alias, version, "Alias set");
        Ok(())
    }

    fn delete_alias(&self, name: &str, alias: &str) -> Result<()> {
        self.update(name, |model| {
            let mut found = false;
            for v in model.versions.iter_mut() {
                let before = v.aliases.len();
                v.aliases.retain(|a| a != alias);
                found |= v.aliases.len() != before;
            }
            if found {
                Ok(())
            } else {
                Err(PipelineError::AliasNotFound {
                    name: model.name.clone(),
                    alias: alias.to_string(),
                })
            }
        })
    }

    fn set_version_tag(&self, name: &str, version: u32, key: &str, value: &str) -> Result<()> {
        self.update(name, |model| {
            model
                .version_mut(version)?
                .tags
                .insert(key.to_string(), value.to_string());
            Ok(())
        })
    }

    fn transition_stage(
        &self,
        name: &str,
        version: u32,
        stage: Stage,
        archive_existing: bool,
    ) -> Result<ModelVersion> {
        let updated = self.update(name, |model| {
            model.version_mut(version)?;
            for v in model.versions.iter_mut() {
                if v.version == version {
                    v.stage = stage;
                } else if archive_existing && stage != Stage::Archived && v.stage == stage {
                    info!(model = %v.name, version = v.version, from = %stage, "Archiving version");
                    v.stage = Stage::Archived;
                }
            }
            model.version_mut(version).map(|v| v.clone())
        })?;
        info!(model = %name, version, stage = %stage, "Stage transition");
        Ok(updated)
    }
}
