//! Run request validation
//!
//! Everything here happens before the first migration runs: a request that
//! fails validation never touches state.

use serde::{Deserialize, Serialize};

use crate::registry::Registry;

/// Caller misuse, detected before anything executes
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("The skip, auto and force-rerun options are mutually exclusive")]
    ExclusiveOptions,
    #[error("The {0} option requires an explicit list of migrations")]
    ExplicitTargetsRequired(&'static str),
    #[error("No such migration: {0}")]
    NoSuchMigration(String),
    #[error("Cannot skip migrations that already ran or were skipped: {}", .0.join(", "))]
    NotPendingCantSkip(Vec<String>),
    #[error("Cannot re-run migrations that never ran: {}", .0.join(", "))]
    PendingCantRerun(Vec<String>),
    #[error("Migrations already ran or were skipped (use force-rerun to run them again): {}", .0.join(", "))]
    AlreadyRan(Vec<String>),
    #[error("Cannot filter on both pending and done migrations")]
    ListConflict,
}

/// Arguments of one `run` invocation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    /// References (id, slug or ordinal); empty means every pending migration
    pub targets: Vec<String>,
    /// Mark as skipped instead of running
    pub skip: bool,
    /// Unattended invocation: manual migrations are deferred
    pub auto: bool,
    /// Run again migrations that are done or skipped
    pub force_rerun: bool,
    /// Operator accepted the disclaimer of the first migration that has one
    pub accept_disclaimer: bool,
}

impl RunRequest {
    /// Every pending migration
    pub fn pending() -> Self {
        Self::default()
    }

    /// Explicit targets, run in the given order
    pub fn targets<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            targets: targets.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

/// How the selected migrations are processed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Normal,
    Skip,
    Auto,
    ForceRerun,
}

/// Validated request: registry indices in execution order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPlan {
    pub mode: RunMode,
    pub indices: Vec<usize>,
    pub accept_disclaimer: bool,
}

impl RunPlan {
    pub fn validate(registry: &Registry, request: &RunRequest) -> Result<Self, ValidationError> {
        let mode = match (request.skip, request.auto, request.force_rerun) {
            (false, false, false) => RunMode::Normal,
            (true, false, false) => RunMode::Skip,
            (false, true, false) => RunMode::Auto,
            (false, false, true) => RunMode::ForceRerun,
            _ => return Err(ValidationError::ExclusiveOptions),
        };

        let indices = if request.targets.is_empty() {
            match mode {
                RunMode::Skip => return Err(ValidationError::ExplicitTargetsRequired("skip")),
                RunMode::ForceRerun => {
                    return Err(ValidationError::ExplicitTargetsRequired("force-rerun"));
                }
                RunMode::Normal | RunMode::Auto => registry
                    .all()
                    .iter()
                    .enumerate()
                    .filter(|(_, m)| m.state().is_pending())
                    .map(|(i, _)| i)
                    .collect(),
            }
        } else {
            let mut indices: Vec<usize> = Vec::new();
            for target in &request.targets {
                let index = registry
                    .position(target)
                    .ok_or_else(|| ValidationError::NoSuchMigration(target.clone()))?;
                if !indices.contains(&index) {
                    indices.push(index);
                }
            }

            let ids_where = |pending: bool| -> Vec<String> {
                indices
                    .iter()
                    .filter_map(|&i| registry.get(i))
                    .filter(|m| m.state().is_pending() == pending)
                    .map(|m| m.id().to_string())
                    .collect()
            };

            match mode {
                RunMode::Skip => {
                    let decided = ids_where(false);
                    if !decided.is_empty() {
                        return Err(ValidationError::NotPendingCantSkip(decided));
                    }
                }
                RunMode::ForceRerun => {
                    let pending = ids_where(true);
                    if !pending.is_empty() {
                        return Err(ValidationError::PendingCantRerun(pending));
                    }
                }
                RunMode::Normal | RunMode::Auto => {
                    let decided = ids_where(false);
                    if !decided.is_empty() {
                        return Err(ValidationError::AlreadyRan(decided));
                    }
                }
            }
            indices
        };

        Ok(Self {
            mode,
            indices,
            accept_disclaimer: request.accept_disclaimer,
        })
    }
}
