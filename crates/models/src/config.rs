use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration file")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration document")]
    Json(#[from] serde_json::Error),
    #[error("project {project:?} declares no file spec for platform {platform:?}")]
    MissingFileSpec { project: String, platform: String },
}

/// The static pipeline configuration document: one entry per project,
/// enumerating its sites and the per-platform file sets that constitute a
/// complete submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub version: String,
    pub configs: BTreeMap<String, ProjectConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub sites: Vec<String>,
    /// Platform name to the file set required of one submission.
    pub file_specs: BTreeMap<String, FilesetSpec>,
    /// Publication bucket suffixes, keyed by artifact kind. The bucket
    /// name is `<project>-published-<kind>`.
    #[serde(default)]
    pub publish: Vec<String>,
}

/// The file-set descriptor for one (project, platform) pairing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesetSpec {
    /// Extension (leading dot) to the expected count of that extension.
    pub files: BTreeMap<String, u32>,
    pub match_size: usize,
}

impl FilesetSpec {
    pub fn required(&self) -> BTreeSet<&str> {
        self.files.keys().map(String::as_str).collect()
    }

    pub fn accepted_extensions(&self) -> Vec<&str> {
        self.files.keys().map(String::as_str).collect()
    }

    /// A submission is complete when its observed extensions exactly cover
    /// the required set.
    pub fn is_complete<'s>(&self, observed: impl Iterator<Item = &'s str>) -> bool {
        let observed: BTreeSet<&str> = observed.collect();
        observed == self.required() && observed.len() == self.match_size
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read(path)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn project(&self, project: &str) -> Option<&ProjectConfig> {
        self.configs.get(project)
    }

    pub fn fileset(&self, project: &str, platform: &str) -> Result<&FilesetSpec, ConfigError> {
        self.configs
            .get(project)
            .and_then(|p| p.file_specs.get(platform))
            .ok_or_else(|| ConfigError::MissingFileSpec {
                project: project.to_string(),
                platform: platform.to_string(),
            })
    }

    /// All extensions accepted for any platform of `project`, used when the
    /// platform is not yet known (object-key parsing).
    pub fn project_extensions(&self, project: &str) -> Vec<&str> {
        let Some(project) = self.configs.get(project) else {
            return Vec::new();
        };
        let mut exts: Vec<&str> = project
            .file_specs
            .values()
            .flat_map(|spec| spec.files.keys().map(String::as_str))
            .collect();
        exts.sort();
        exts.dedup();
        exts
    }
}

/// The fixed publication bucket naming convention.
pub fn publication_bucket(project: &str, kind: &str) -> String {
    format!("{project}-published-{kind}")
}
