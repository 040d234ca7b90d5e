use crate::error::{KbError, Result};
use crate::validation::ValidationMode;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Name of the optional per-store configuration file in the data directory
pub const CONFIG_FILE: &str = "charvault.yaml";

/// Store-wide settings, read from `charvault.yaml` when present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// How undeclared fields are treated by authoritative validation
    pub validation_mode: ValidationMode,
    /// Maximum number of backups kept per filename. `None` keeps everything.
    pub backup_retention: Option<usize>,
    /// Upper bound on concurrent per-document work in batches and imports
    pub max_concurrency: usize,
    /// Edits newer than this many seconds are flagged by conflict checks
    pub recent_edit_window_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            validation_mode: ValidationMode::Permissive,
            backup_retention: None,
            max_concurrency: 7,
            recent_edit_window_secs: 300,
        }
    }
}

impl StoreConfig {
    /// Load `charvault.yaml` from the data directory, falling back to
    /// defaults when the file does not exist.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(StoreConfig::default());
        }
        let content = std::fs::read_to_string(&path)?;
        Self::parse_str(&content)
    }

    pub fn parse_str(content: &str) -> Result<Self> {
        // An empty file deserializes to null, which means "all defaults"
        if content.trim().is_empty() {
            return Ok(StoreConfig::default());
        }
        let config: StoreConfig = serde_yaml::from_str(content)?;
        config.check()?;
        Ok(config)
    }

    pub fn check(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(KbError::Config("max_concurrency must be at least 1".into()));
        }
        if self.backup_retention == Some(0) {
            return Err(KbError::Config(
                "backup_retention must be at least 1 (omit it to keep every backup)".into(),
            ));
        }
        Ok(())
    }
}
