//! Migration module - descriptor contract and core types
//!
//! A migration is a one-shot, identified system-state transition:
//! - Stable `<ordinal>_<slug>` identifier
//! - Auto/manual execution mode
//! - Dependencies on other migrations
//! - Optional operator disclaimer
//! - Optional restore-time hooks gated by the version that introduced it

mod id;
pub mod manifest;

pub use id::MigrationId;
pub use manifest::{ManifestBackup, ManifestMigration, MigrationManifest};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::config::Config;
use crate::system::{CommandRunner, ServiceManager};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Error raised by a migration body or by descriptor validation
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// Identifier does not follow `<digits>_<name>`
    #[error("Invalid migration id '{id}': {reason}")]
    InvalidId { id: String, reason: String },
    /// Shell command exited non-zero
    #[error("Command '{command}' failed with exit code {exit_code}\nstdout:\n{stdout}\nstderr:\n{stderr}")]
    Command {
        command: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    /// A precondition of the migration body is not met
    #[error("Precondition failed: {0}")]
    Precondition(String),
    /// The pre-migration backup could not be taken; nothing was mutated
    #[error("Could not back up before migration: {0}")]
    BackupFailed(String),
    /// Restoring the pre-migration backup failed; live state is unknown
    #[error("Rollback failed after migration error ({original}): {rollback}")]
    RollbackFailed { original: String, rollback: String },
    /// Restore-time hook requested on a migration that does not provide it
    #[error("Migration {id} has no {hook} hook")]
    UnsupportedHook { id: String, hook: HookKind },
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// MODE & STATE
// ============================================================================

/// Whether a migration may run under unattended invocation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Runs during automatic invocations (e.g. package upgrade)
    #[default]
    Auto,
    /// Requires explicit operator action
    Manual,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Auto => write!(f, "auto"),
            Mode::Manual => write!(f, "manual"),
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Mode::Auto),
            "manual" => Ok(Mode::Manual),
            _ => Err(format!("Unknown migration mode: {}", s)),
        }
    }
}

/// Lifecycle marker of a migration
///
/// Only `Done` and `Skipped` are ever persisted; absence means `Pending`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum MigrationState {
    #[default]
    Pending,
    Done,
    Skipped,
}

impl MigrationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationState::Pending => "pending",
            MigrationState::Done => "done",
            MigrationState::Skipped => "skipped",
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, MigrationState::Pending)
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// RESTORE HOOKS
// ============================================================================

/// Kind of restore-time hook, without its arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    AfterSystemRestore,
    BeforeAppRestore,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookKind::AfterSystemRestore => write!(f, "after_system_restore"),
            HookKind::BeforeAppRestore => write!(f, "before_app_restore"),
        }
    }
}

/// Restore-time hook invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreHook<'a> {
    /// Runs once the system part of a backup has been restored
    AfterSystemRestore,
    /// Runs before restoring one application from a backup
    BeforeAppRestore { app_id: &'a str },
}

impl RestoreHook<'_> {
    pub fn kind(&self) -> HookKind {
        match self {
            RestoreHook::AfterSystemRestore => HookKind::AfterSystemRestore,
            RestoreHook::BeforeAppRestore { .. } => HookKind::BeforeAppRestore,
        }
    }
}

// ============================================================================
// DESCRIPTOR CONTRACT
// ============================================================================

/// Collaborators handed to every migration body
pub struct MigrationContext<'a> {
    pub runner: &'a dyn CommandRunner,
    pub services: &'a dyn ServiceManager,
    pub config: &'a Config,
    /// Audit operation wrapping this run, when one could be opened
    pub operation_id: Option<Uuid>,
}

/// The contract every migration implements
///
/// Descriptors are stateless; the engine joins them with persisted state.
pub trait Migration: Send + Sync {
    fn id(&self) -> &MigrationId;

    /// One-line human description shown by `list`
    fn description(&self) -> String;

    fn mode(&self) -> Mode {
        Mode::Auto
    }

    /// References (id, slug or ordinal) of migrations that must be decided first
    fn dependencies(&self) -> &[String] {
        &[]
    }

    /// Warning that the operator must explicitly accept before running
    fn disclaimer(&self) -> Option<String> {
        None
    }

    /// Release that introduced this migration, used by restore hooks only
    fn introduced_in_version(&self) -> Option<&semver::Version> {
        None
    }

    /// Primary effect
    fn run(&self, ctx: &MigrationContext<'_>) -> Result<(), MigrationError>;

    fn supports_hook(&self, _kind: HookKind) -> bool {
        false
    }

    fn run_hook(
        &self,
        hook: &RestoreHook<'_>,
        _ctx: &MigrationContext<'_>,
    ) -> Result<(), MigrationError> {
        Err(MigrationError::UnsupportedHook {
            id: self.id().to_string(),
            hook: hook.kind(),
        })
    }
}

/// Parse a release version, also accepting the short `4.2` and `4` forms
pub fn parse_release(raw: &str) -> Result<semver::Version, semver::Error> {
    let raw = raw.trim();
    let (core, suffix) = raw.split_at(raw.find(['-', '+']).unwrap_or(raw.len()));
    let padded = match core.matches('.').count() {
        0 => format!("{core}.0.0{suffix}"),
        1 => format!("{core}.0{suffix}"),
        _ => return semver::Version::parse(raw),
    };
    semver::Version::parse(&padded)
}
