//! # Stepwise Core
//!
//! Engine for ordered, one-shot system migrations on a long-lived machine.
//!
//! - **Migrations**: `<ordinal>_<slug>` identified steps, compiled in or
//!   declared as JSON manifests
//! - **State**: persisted `done`/`skipped` record, pending is implicit
//! - **Engine**: request validation, dependency and disclaimer gating,
//!   continue-on-failure run loop, restore-time hooks
//! - **Backup/rollback**: snapshot trees around a risky mutation and restore
//!   them verbatim on failure
//! - **Self-upgrade**: deferred upgrade job that waits for the tool lock
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stepwise_core::{builtin, Config, Engine, Registry, RunRequest, StateStore};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::new(None)?.with_env_overrides();
//! let store = StateStore::new(&config.state_path);
//! let registry = Registry::load(builtin::migrations()?, &config, &store)?;
//!
//! let mut engine = Engine::new(registry, config);
//! let report = engine.run(&RunRequest::pending())?;
//! println!("{} migration(s) processed", report.outcomes.len());
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod audit;
pub mod backup;
pub mod builtin;
pub mod config;
pub mod engine;
pub mod migration;
pub mod registry;
pub mod selfupgrade;
pub mod state;
pub mod system;

pub use audit::{AuditError, AuditLog, OperationKind, OperationRecord};
pub use backup::{BackupTarget, BackupTransaction};
pub use config::{Config, ConfigError};
pub use engine::{
    DisclaimerToken, Engine, EngineError, ListFilter, MigrationSummary, Outcome, RunReport,
    RunRequest, TargetOutcome, ValidationError,
};
pub use migration::{
    HookKind, ManifestMigration, Migration, MigrationContext, MigrationError, MigrationId,
    MigrationState, Mode, RestoreHook, parse_release,
};
pub use registry::{RegisteredMigration, Registry, RegistryError};
pub use selfupgrade::{SelfUpgrade, SelfUpgradeError, SelfUpgradeHandle, SelfUpgradeMarker};
pub use state::{StateDocument, StateError, StateStore};
pub use system::{CommandOutput, CommandRunner, ServiceManager, ShellRunner, Systemctl};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
