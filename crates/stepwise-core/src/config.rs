//! Engine configuration
//!
//! Paths are resolved from an explicit data directory (or the platform default),
//! then individually overridable through `STEPWISE_*` environment variables.

use directories::ProjectDirs;
use std::path::{Path, PathBuf};

/// Environment variable overriding the persisted state file
pub const ENV_STATE_PATH: &str = "STEPWISE_STATE_PATH";
/// Environment variable overriding the manifest discovery directory
pub const ENV_MIGRATIONS_DIR: &str = "STEPWISE_MIGRATIONS_DIR";
/// Environment variable overriding where pre-migration backups are written
pub const ENV_BACKUP_ROOT: &str = "STEPWISE_BACKUP_ROOT";
/// Environment variable overriding the operation journal database
pub const ENV_AUDIT_DB: &str = "STEPWISE_AUDIT_DB";
/// Environment variable overriding the tool-wide lock file
pub const ENV_LOCK_PATH: &str = "STEPWISE_LOCK_PATH";

/// Configuration error
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not determine project directories")]
    NoProjectDirs,
}

/// Resolved filesystem layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    /// `{ "migrations": { id: state } }`
    pub state_path: PathBuf,
    /// Directory scanned for `<digits>_<name>.json` manifests
    pub migrations_dir: PathBuf,
    pub backup_root: PathBuf,
    pub audit_db_path: PathBuf,
    /// Held by whoever invokes the tool; self-upgrade waits for its release
    pub lock_path: PathBuf,
    /// Self-upgrade log and completion marker
    pub self_upgrade_dir: PathBuf,
}

impl Config {
    /// Layout rooted at `data_dir`, or at the platform data directory
    pub fn new(data_dir: Option<PathBuf>) -> Result<Self, ConfigError> {
        let data_dir = match data_dir {
            Some(dir) => dir,
            None => ProjectDirs::from("org", "stepwise", "stepwise")
                .ok_or(ConfigError::NoProjectDirs)?
                .data_dir()
                .to_path_buf(),
        };
        Ok(Self::rooted_at(&data_dir))
    }

    /// Layout with every path under `data_dir`
    pub fn rooted_at(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            state_path: data_dir.join("migrations.json"),
            migrations_dir: data_dir.join("migrations.d"),
            backup_root: data_dir.join("backups"),
            audit_db_path: data_dir.join("audit.db"),
            lock_path: data_dir.join("stepwise.lock"),
            self_upgrade_dir: data_dir.join("self-upgrade"),
        }
    }

    /// Apply `STEPWISE_*` overrides from the process environment
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup (empty values are ignored)
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty()).map(PathBuf::from);

        if let Some(path) = get(ENV_STATE_PATH) {
            self.state_path = path;
        }
        if let Some(path) = get(ENV_MIGRATIONS_DIR) {
            self.migrations_dir = path;
        }
        if let Some(path) = get(ENV_BACKUP_ROOT) {
            self.backup_root = path;
        }
        if let Some(path) = get(ENV_AUDIT_DB) {
            self.audit_db_path = path;
        }
        if let Some(path) = get(ENV_LOCK_PATH) {
            self.lock_path = path;
        }
        self
    }
}
