//! Daemon configuration file.
//!
//! Stored as JSON (default `<data-dir>/daemon.json`). Every field is
//! optional in the file; command-line flags override what is loaded.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use taskflow_sync_core::SyncConfig;

pub const CONFIG_FILE: &str = "daemon.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DaemonConfig {
    /// Where the local store keeps its JSON files.
    pub data_dir: PathBuf,
    /// Shared directory acting as the remote repository.
    pub remote_dir: PathBuf,
    pub user_id: Option<String>,
    /// Project to treat as active on startup.
    pub active_project: Option<String>,
    /// Debounce for remote directory events, in milliseconds.
    pub watch_debounce_ms: u64,
    pub sync: SyncConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".taskflow"),
            remote_dir: PathBuf::from(".taskflow-remote"),
            user_id: None,
            active_project: None,
            watch_debounce_ms: 300,
            sync: SyncConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load from `path`, or defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: DaemonConfig = serde_json::from_str(&contents)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }
}
