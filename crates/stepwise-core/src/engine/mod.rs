//! Execution engine
//!
//! Validates run requests against the registry, then processes the selected
//! migrations one at a time:
//! - `auto` invocations defer manual migrations
//! - unmet dependencies block a migration without touching its state
//! - a disclaimer needs the single-use acceptance token
//! - a failing migration is reported and the loop moves on
//!
//! Every outcome is flushed to the state store before the next migration.

mod request;
mod restore;

pub use request::{RunMode, RunPlan, RunRequest, ValidationError};

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::audit::{AuditLog, Operation, OperationKind};
use crate::config::Config;
use crate::migration::{Migration, MigrationContext, MigrationError, MigrationId, MigrationState, Mode};
use crate::registry::Registry;
use crate::state::{StateDocument, StateError};
use crate::system::{CommandRunner, ServiceManager, ShellRunner, Systemctl};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Engine error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Request rejected before anything ran
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// The state store could not be read or written
    #[error("State store error: {0}")]
    State(#[from] StateError),
    /// Version string given to a restore hook entry point is not semver
    #[error("Invalid version '{version}': {source}")]
    Version {
        version: String,
        #[source]
        source: semver::Error,
    },
    /// A restore hook failed; the remaining hooks were not run
    #[error("Migration {id} failed during {hook}: {source}")]
    Hook {
        id: String,
        hook: crate::migration::HookKind,
        #[source]
        source: MigrationError,
    },
}

pub type Result<T> = std::result::Result<T, EngineError>;

// ============================================================================
// RUN REPORT
// ============================================================================

/// What happened to one target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Done,
    Skipped,
    Failed { error: String },
    /// Manual migration left pending by an `auto` run
    DeferredManual,
    BlockedByDependencies { unmet: Vec<String> },
    DisclaimerRequired { disclaimer: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetOutcome {
    pub id: String,
    #[serde(flatten)]
    pub outcome: Outcome,
}

/// Result of one `run` call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub outcomes: Vec<TargetOutcome>,
    /// No migration was selected
    pub nothing_to_do: bool,
}

impl RunReport {
    pub fn outcome(&self, id: &str) -> Option<&Outcome> {
        self.outcomes.iter().find(|o| o.id == id).map(|o| &o.outcome)
    }

    /// True when every target ended done or skipped
    pub fn all_succeeded(&self) -> bool {
        self.outcomes
            .iter()
            .all(|o| matches!(o.outcome, Outcome::Done | Outcome::Skipped))
    }
}

/// Disclaimer acceptance, usable once per run
#[derive(Debug)]
pub struct DisclaimerToken {
    accepted: bool,
}

impl DisclaimerToken {
    pub fn new(accepted: bool) -> Self {
        Self { accepted }
    }

    /// Take the acceptance; later calls return false
    pub fn consume(&mut self) -> bool {
        std::mem::take(&mut self.accepted)
    }
}

// ============================================================================
// LISTING
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListFilter {
    pub pending: bool,
    /// Anything not pending, skipped included
    pub done: bool,
}

/// One row of `list`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationSummary {
    pub id: String,
    pub ordinal: u32,
    pub name: String,
    pub mode: Mode,
    pub state: MigrationState,
    pub description: String,
    pub disclaimer: Option<String>,
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct Engine {
    registry: Registry,
    config: Config,
    runner: Arc<dyn CommandRunner>,
    services: Arc<dyn ServiceManager>,
    audit: Option<AuditLog>,
}

impl Engine {
    /// Engine running commands through bash and services through systemctl
    pub fn new(registry: Registry, config: Config) -> Self {
        Self {
            registry,
            config,
            runner: Arc::new(ShellRunner),
            services: Arc::new(Systemctl::new(ShellRunner)),
            audit: None,
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_services(mut self, services: Arc<dyn ServiceManager>) -> Self {
        self.services = services;
        self
    }

    /// Record one journal entry per unit of work
    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn audit(&self) -> Option<&AuditLog> {
        self.audit.as_ref()
    }

    pub fn list(&self, filter: ListFilter) -> Result<Vec<MigrationSummary>> {
        if filter.pending && filter.done {
            return Err(ValidationError::ListConflict.into());
        }

        Ok(self
            .registry
            .all()
            .iter()
            .filter(|m| {
                if filter.pending {
                    m.state() == MigrationState::Pending
                } else if filter.done {
                    !m.state().is_pending()
                } else {
                    true
                }
            })
            .map(|m| {
                let migration = m.migration();
                MigrationSummary {
                    id: m.id().to_string(),
                    ordinal: m.id().ordinal(),
                    name: m.id().slug().to_string(),
                    mode: migration.mode(),
                    state: m.state(),
                    description: migration.description(),
                    disclaimer: disclaimer_of(migration),
                }
            })
            .collect())
    }

    /// Persisted state document, as stored
    pub fn state(&self) -> Result<StateDocument> {
        Ok(self.registry.store().document()?)
    }

    /// Mark every known migration skipped (fresh install)
    pub fn skip_all(&mut self) -> Result<usize> {
        let operation = self.begin(OperationKind::SkipAll, None);
        match self.registry.skip_all() {
            Ok(count) => {
                self.succeed(operation);
                Ok(count)
            }
            Err(e) => {
                self.fail(operation, &e.to_string());
                Err(e.into())
            }
        }
    }

    pub fn run(&mut self, request: &RunRequest) -> Result<RunReport> {
        let plan = RunPlan::validate(&self.registry, request)?;

        if plan.indices.is_empty() {
            tracing::info!("No migrations to run");
            return Ok(RunReport {
                outcomes: Vec::new(),
                nothing_to_do: true,
            });
        }

        let mut token = DisclaimerToken::new(plan.accept_disclaimer);
        let mut report = RunReport::default();

        for &index in &plan.indices {
            let Some(entry) = self.registry.get(index) else {
                continue;
            };
            let id = entry.id().clone();
            let outcome = self.process(index, plan.mode, &mut token)?;
            report.outcomes.push(TargetOutcome {
                id: id.to_string(),
                outcome,
            });
        }

        Ok(report)
    }

    fn process(&mut self, index: usize, mode: RunMode, token: &mut DisclaimerToken) -> Result<Outcome> {
        let Some(entry) = self.registry.get(index) else {
            return Err(ValidationError::NoSuchMigration(index.to_string()).into());
        };
        let migration = entry.migration();
        let id = entry.id().clone();

        if mode == RunMode::Auto && migration.mode() == Mode::Manual {
            tracing::warn!(
                migration = %id,
                "Manual migration not run automatically; run it explicitly once you are ready"
            );
            return Ok(Outcome::DeferredManual);
        }

        if mode != RunMode::Skip {
            let unmet = self.registry.unmet_dependencies(index);
            if !unmet.is_empty() {
                tracing::error!(
                    migration = %id,
                    unmet = %unmet.join(", "),
                    "Cannot run migration, dependencies are not done"
                );
                return Ok(Outcome::BlockedByDependencies { unmet });
            }

            if let Some(disclaimer) = disclaimer_of(migration)
                && !token.consume()
            {
                tracing::warn!(
                    migration = %id,
                    "Migration has a disclaimer that must be accepted explicitly:\n{}",
                    disclaimer
                );
                return Ok(Outcome::DisclaimerRequired { disclaimer });
            }
        }

        let operation = self.begin(OperationKind::MigrateForward, Some(&id));

        if mode == RunMode::Skip {
            tracing::warn!(migration = %id, "Skipping migration");
            return match self.registry.set_state(index, MigrationState::Skipped) {
                Ok(()) => {
                    self.succeed(operation);
                    Ok(Outcome::Skipped)
                }
                Err(e) => {
                    self.fail(operation, &e.to_string());
                    Err(e.into())
                }
            };
        }

        tracing::info!(migration = %id, "Running migration");
        let ctx = MigrationContext {
            runner: self.runner.as_ref(),
            services: self.services.as_ref(),
            config: &self.config,
            operation_id: operation.as_ref().map(Operation::id),
        };

        match migration.run(&ctx) {
            Ok(()) => {
                tracing::info!(migration = %id, "Migration completed");
                match self.registry.set_state(index, MigrationState::Done) {
                    Ok(()) => {
                        self.succeed(operation);
                        Ok(Outcome::Done)
                    }
                    Err(e) => {
                        self.fail(operation, &e.to_string());
                        Err(e.into())
                    }
                }
            }
            Err(e) => {
                let error = e.to_string();
                tracing::error!(migration = %id, "Migration failed: {}", error);
                self.fail(operation, &error);
                Ok(Outcome::Failed { error })
            }
        }
    }

    // Journal failures are reported but never abort a migration

    fn begin(&self, kind: OperationKind, id: Option<&MigrationId>) -> Option<Operation> {
        let audit = self.audit.as_ref()?;
        match audit.begin(kind, id) {
            Ok(operation) => Some(operation),
            Err(e) => {
                tracing::warn!("Could not open journal entry: {}", e);
                None
            }
        }
    }

    fn succeed(&self, operation: Option<Operation>) {
        if let (Some(audit), Some(operation)) = (self.audit.as_ref(), operation)
            && let Err(e) = audit.succeed(operation)
        {
            tracing::warn!("Could not close journal entry: {}", e);
        }
    }

    fn fail(&self, operation: Option<Operation>, message: &str) {
        if let (Some(audit), Some(operation)) = (self.audit.as_ref(), operation)
            && let Err(e) = audit.fail(operation, message)
        {
            tracing::warn!("Could not close journal entry: {}", e);
        }
    }
}

/// Disclaimer text that actually needs acceptance; blank text counts as none
fn disclaimer_of(migration: &dyn Migration) -> Option<String> {
    migration.disclaimer().filter(|d| !d.trim().is_empty())
}
