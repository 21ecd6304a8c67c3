//! Manifest-defined migrations
//!
//! A manifest is a JSON file named after the migration id (`0021_ldap_refresh.json`)
//! declaring metadata plus the shell steps to run. When a `backup` section is
//! present the steps run inside a [`BackupTransaction`](crate::backup::BackupTransaction).
//!
//! ```json
//! {
//!   "description": "Rebuild the LDAP permission tree",
//!   "mode": "manual",
//!   "dependencies": ["0020"],
//!   "disclaimer": "Directory service is unavailable for a few minutes.",
//!   "introduced_in_version": "4.2.0",
//!   "steps": ["slapadd -n0 -F /etc/ldap/slapd.d -l {backup_dir}/ldap_config/new.ldif"],
//!   "backup": {
//!     "service": "slapd",
//!     "targets": [
//!       { "label": "ldap_config", "path": "/etc/ldap" },
//!       { "label": "ldap_db", "path": "/var/lib/ldap" }
//!     ]
//!   },
//!   "before_app_restore": ["/usr/share/stepwise/fix-perms {app_id}"]
//! }
//! ```
//!
//! `introduced_in_version` may also be a short release such as `"4.2"`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use super::{HookKind, Migration, MigrationContext, MigrationError, MigrationId, Mode, RestoreHook};
use crate::backup::BackupTransaction;

/// Placeholder replaced by the backup location inside backed-up steps
pub const BACKUP_DIR_PLACEHOLDER: &str = "{backup_dir}";
/// Placeholder replaced by the application id inside `before_app_restore` steps
pub const APP_ID_PLACEHOLDER: &str = "{app_id}";

/// Manifest loading error
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Id(#[from] MigrationError),
    #[error("Invalid introduced_in_version '{version}': {source}")]
    Version {
        version: String,
        #[source]
        source: semver::Error,
    },
    #[error("{0}")]
    Invalid(String),
}

/// On-disk manifest document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MigrationManifest {
    pub description: String,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub disclaimer: Option<String>,
    #[serde(default)]
    pub introduced_in_version: Option<String>,
    pub steps: Vec<String>,
    #[serde(default)]
    pub backup: Option<ManifestBackup>,
    #[serde(default)]
    pub after_system_restore: Vec<String>,
    #[serde(default)]
    pub before_app_restore: Vec<String>,
}

/// Trees to snapshot around the steps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestBackup {
    #[serde(default)]
    pub service: Option<String>,
    pub targets: Vec<ManifestTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestTarget {
    pub label: String,
    pub path: PathBuf,
}

/// Migration backed by a manifest file
#[derive(Debug, Clone)]
pub struct ManifestMigration {
    id: MigrationId,
    manifest: MigrationManifest,
    version: Option<semver::Version>,
}

impl ManifestMigration {
    /// Load `<dir>/<id>.json`; the id is the file stem
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| ManifestError::Invalid("file name is not valid UTF-8".to_string()))?;
        let id = MigrationId::parse(stem)?;
        let manifest: MigrationManifest = serde_json::from_str(&fs::read_to_string(path)?)?;
        Self::from_manifest(id, manifest)
    }

    /// Validate a parsed manifest
    pub fn from_manifest(id: MigrationId, manifest: MigrationManifest) -> Result<Self, ManifestError> {
        if manifest.description.trim().is_empty() {
            return Err(ManifestError::Invalid("description must not be empty".to_string()));
        }
        if manifest.steps.is_empty() {
            return Err(ManifestError::Invalid("at least one step is required".to_string()));
        }
        if manifest.steps.iter().any(|s| s.trim().is_empty()) {
            return Err(ManifestError::Invalid("steps must not be blank".to_string()));
        }
        if let Some(backup) = &manifest.backup {
            if backup.targets.is_empty() {
                return Err(ManifestError::Invalid("backup needs at least one target".to_string()));
            }
            for target in &backup.targets {
                let label_ok = !target.label.is_empty()
                    && target
                        .label
                        .bytes()
                        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
                if !label_ok {
                    return Err(ManifestError::Invalid(format!(
                        "backup label '{}' must use [A-Za-z0-9_-]",
                        target.label
                    )));
                }
                if !target.path.is_absolute() {
                    return Err(ManifestError::Invalid(format!(
                        "backup target {} must be an absolute path",
                        target.path.display()
                    )));
                }
            }
        }

        let version = manifest
            .introduced_in_version
            .as_deref()
            .map(|v| {
                super::parse_release(v).map_err(|source| ManifestError::Version {
                    version: v.to_string(),
                    source,
                })
            })
            .transpose()?;

        Ok(Self {
            id,
            manifest,
            version,
        })
    }

    pub fn manifest(&self) -> &MigrationManifest {
        &self.manifest
    }

    fn run_steps<I>(&self, ctx: &MigrationContext<'_>, steps: I) -> Result<(), MigrationError>
    where
        I: IntoIterator<Item = String>,
    {
        for (i, step) in steps.into_iter().enumerate() {
            tracing::debug!(migration = %self.id, step = i + 1, "Running step");
            ctx.runner.check(&step)?;
        }
        Ok(())
    }
}

impl Migration for ManifestMigration {
    fn id(&self) -> &MigrationId {
        &self.id
    }

    fn description(&self) -> String {
        self.manifest.description.clone()
    }

    fn mode(&self) -> Mode {
        self.manifest.mode
    }

    fn dependencies(&self) -> &[String] {
        &self.manifest.dependencies
    }

    fn disclaimer(&self) -> Option<String> {
        self.manifest
            .disclaimer
            .clone()
            .filter(|d| !d.trim().is_empty())
    }

    fn introduced_in_version(&self) -> Option<&semver::Version> {
        self.version.as_ref()
    }

    fn run(&self, ctx: &MigrationContext<'_>) -> Result<(), MigrationError> {
        let Some(backup) = &self.manifest.backup else {
            return self.run_steps(ctx, self.manifest.steps.iter().cloned());
        };

        let mut txn = BackupTransaction::new(&ctx.config.backup_root);
        if let Some(service) = &backup.service {
            txn = txn.service(service);
        }
        for target in &backup.targets {
            txn = txn.target(&target.label, &target.path);
        }

        txn.run(ctx.services, |location| {
            let location = shell_quote(&location.to_string_lossy());
            self.run_steps(
                ctx,
                self.manifest
                    .steps
                    .iter()
                    .map(|s| s.replace(BACKUP_DIR_PLACEHOLDER, &location)),
            )
        })
    }

    fn supports_hook(&self, kind: HookKind) -> bool {
        match kind {
            HookKind::AfterSystemRestore => !self.manifest.after_system_restore.is_empty(),
            HookKind::BeforeAppRestore => !self.manifest.before_app_restore.is_empty(),
        }
    }

    fn run_hook(&self, hook: &RestoreHook<'_>, ctx: &MigrationContext<'_>) -> Result<(), MigrationError> {
        if !self.supports_hook(hook.kind()) {
            return Err(MigrationError::UnsupportedHook {
                id: self.id.to_string(),
                hook: hook.kind(),
            });
        }
        match hook {
            RestoreHook::AfterSystemRestore => {
                self.run_steps(ctx, self.manifest.after_system_restore.iter().cloned())
            }
            RestoreHook::BeforeAppRestore { app_id } => {
                let app_id = shell_quote(app_id);
                self.run_steps(
                    ctx,
                    self.manifest
                        .before_app_restore
                        .iter()
                        .map(|s| s.replace(APP_ID_PLACEHOLDER, &app_id)),
                )
            }
        }
    }
}

/// Single-quote a value for interpolation into a `bash -c` line
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
