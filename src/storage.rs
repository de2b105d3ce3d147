//! Project layout on disk.
//!
//! A biodv project is a directory holding a `.biodv` directory:
//!
//! ```text
//! .biodv/
//!   config.yaml     project settings
//!   taxonomy.stz    the taxonomy tree
//!   datasets.stz    dataset metadata
//! ```

use crate::gbif::GbifConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const BIODV_DIR: &str = ".biodv";
pub const CONFIG_FILE: &str = "config.yaml";
pub const TAXONOMY_FILE: &str = "taxonomy.stz";
pub const DATASETS_FILE: &str = "datasets.stz";

const FORMAT_VERSION: &str = "1.0";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Not in a biodv project (no {} directory found)", BIODV_DIR)]
    NotInProject,
    #[error("{0}")]
    AlreadyExists(String),
}

/// Project configuration read from config.yaml.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BiodvConfig {
    pub version: String,
    pub project: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub gbif: GbifConfig,
}

impl Default for BiodvConfig {
    fn default() -> Self {
        Self {
            version: FORMAT_VERSION.to_string(),
            project: String::new(),
            description: String::new(),
            gbif: GbifConfig::default(),
        }
    }
}

pub fn taxonomy_path(root: &Path) -> PathBuf {
    root.join(BIODV_DIR).join(TAXONOMY_FILE)
}

pub fn datasets_path(root: &Path) -> PathBuf {
    root.join(BIODV_DIR).join(DATASETS_FILE)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(BIODV_DIR).join(CONFIG_FILE)
}

/// Read config.yaml from a project root. A missing or broken file gives the
/// defaults.
pub fn load_config(root: &Path) -> BiodvConfig {
    let path = config_path(root);
    let Ok(content) = fs::read_to_string(&path) else {
        return BiodvConfig::default();
    };
    serde_yaml::from_str(&content).unwrap_or_else(|e| {
        tracing::warn!("ignoring {}: {}", path.display(), e);
        BiodvConfig::default()
    })
}

pub fn save_config(root: &Path, config: &BiodvConfig) -> Result<(), StorageError> {
    let mut content = String::from("# biodv configuration\n");
    content.push_str(&serde_yaml::to_string(config)?);
    fs::write(config_path(root), content)?;
    Ok(())
}

/// Find the project root by searching upward for the .biodv directory.
pub fn find_root(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();
    loop {
        if current.join(BIODV_DIR).is_dir() {
            return Some(current);
        }
        if !current.pop() {
            return None;
        }
    }
}

pub fn require_root(start: &Path) -> Result<PathBuf, StorageError> {
    find_root(start).ok_or(StorageError::NotInProject)
}

/// Initialize a project in `root`. With `force` an existing project gets a
/// fresh config; its taxonomy and datasets are kept.
pub fn init(root: &Path, force: bool) -> Result<Vec<PathBuf>, StorageError> {
    let dir = root.join(BIODV_DIR);
    if dir.exists() && !force {
        return Err(StorageError::AlreadyExists(
            "Project already initialized. Use --force to reset the config.".to_string(),
        ));
    }
    fs::create_dir_all(&dir)?;

    let mut created = Vec::new();
    let project = root
        .canonicalize()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
        .unwrap_or_else(|| "biodv".to_string());
    let config = BiodvConfig {
        project,
        ..Default::default()
    };
    save_config(root, &config)?;
    created.push(config_path(root));

    for path in [taxonomy_path(root), datasets_path(root)] {
        if !path.exists() {
            fs::write(&path, "")?;
            created.push(path);
        }
    }
    Ok(created)
}
