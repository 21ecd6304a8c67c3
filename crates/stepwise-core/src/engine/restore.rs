//! Restore-time hooks
//!
//! When a backup taken on an older release is restored, migrations introduced
//! after that release get a chance to adapt the restored data. Unlike the run
//! loop these are all-or-nothing: the first failure aborts the sequence.

use semver::Version;

use super::{Engine, EngineError, Result};
use crate::audit::OperationKind;
use crate::migration::{HookKind, MigrationContext, RestoreHook, parse_release};

fn parse_version(raw: &str) -> Result<Version> {
    parse_release(raw).map_err(|source| EngineError::Version {
        version: raw.to_string(),
        source,
    })
}

impl Engine {
    /// Hooks to run once the system part of a backup has been restored
    ///
    /// Returns the ids of the migrations whose hook ran, in order.
    pub fn run_after_system_restore(&self, backup_version: &str, current_version: &str) -> Result<Vec<String>> {
        self.run_restore_hooks(backup_version, current_version, RestoreHook::AfterSystemRestore)
    }

    /// Hooks to run before one application is restored from a backup
    pub fn run_before_app_restore(
        &self,
        backup_version: &str,
        current_version: &str,
        app_id: &str,
    ) -> Result<Vec<String>> {
        self.run_restore_hooks(
            backup_version,
            current_version,
            RestoreHook::BeforeAppRestore { app_id },
        )
    }

    fn run_restore_hooks(
        &self,
        backup_version: &str,
        current_version: &str,
        hook: RestoreHook<'_>,
    ) -> Result<Vec<String>> {
        let backup = parse_version(backup_version)?;
        let current = parse_version(current_version)?;
        let kind: HookKind = hook.kind();

        if backup == current {
            tracing::debug!(version = %backup, hook = %kind, "Backup made by this release, no hooks to run");
            return Ok(Vec::new());
        }

        let mut ran = Vec::new();
        for entry in self.registry.all() {
            let migration = entry.migration();
            let introduced_later = migration
                .introduced_in_version()
                .is_some_and(|introduced| *introduced > backup);
            if !introduced_later || !migration.supports_hook(kind) {
                continue;
            }

            let id = entry.id();
            tracing::info!(migration = %id, hook = %kind, "Running restore hook");
            let operation = self.begin(OperationKind::RestoreHook, Some(id));
            let ctx = MigrationContext {
                runner: self.runner.as_ref(),
                services: self.services.as_ref(),
                config: &self.config,
                operation_id: operation.as_ref().map(|op| op.id()),
            };

            if let Err(source) = migration.run_hook(&hook, &ctx) {
                tracing::error!(migration = %id, hook = %kind, "Restore hook failed: {}", source);
                self.fail(operation, &source.to_string());
                return Err(EngineError::Hook {
                    id: id.to_string(),
                    hook: kind,
                    source,
                });
            }
            self.succeed(operation);
            ran.push(id.to_string());
        }

        Ok(ran)
    }
}
