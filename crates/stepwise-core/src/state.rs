//! Persisted migration state
//!
//! The state file is the single source of truth for "has this run". Every
//! write re-reads the file and merges, so concurrent edits to other entries
//! are never clobbered by a stale in-memory copy.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::migration::{MigrationId, MigrationState};

/// State store error
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("State file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, StateError>;

/// The persisted document, `{ "migrations": { id: state } }`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDocument {
    #[serde(default)]
    pub migrations: BTreeMap<String, MigrationState>,
}

/// JSON-backed store of `id -> done | skipped`
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The whole persisted document
    pub fn document(&self) -> Result<StateDocument> {
        Ok(StateDocument {
            migrations: self.read()?,
        })
    }

    /// Current persisted mapping; a missing file is an empty mapping
    pub fn read(&self) -> Result<BTreeMap<String, MigrationState>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(source) => {
                return Err(StateError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        let file: StateDocument =
            serde_json::from_str(&content).map_err(|source| StateError::Corrupt {
                path: self.path.clone(),
                source,
            })?;

        // Pending is implicit; tolerate hand-edited files that spell it out
        Ok(file
            .migrations
            .into_iter()
            .filter(|(_, state)| !state.is_pending())
            .collect())
    }

    /// State of one migration
    pub fn get(&self, id: &str) -> Result<MigrationState> {
        Ok(self.read()?.get(id).copied().unwrap_or_default())
    }

    /// Record one outcome, preserving every other entry
    ///
    /// Writing `Pending` forgets the entry.
    pub fn write(&self, id: &MigrationId, state: MigrationState) -> Result<()> {
        let mut migrations = self.read()?;
        if state.is_pending() {
            migrations.remove(id.as_str());
        } else {
            migrations.insert(id.to_string(), state);
        }
        self.persist(migrations)?;
        tracing::debug!(migration = %id, state = %state, "Migration state recorded");
        Ok(())
    }

    /// Mark every given migration as skipped, replacing the whole mapping
    ///
    /// Only meant for first-time initialization of a fresh system.
    pub fn skip_all<'a, I>(&self, ids: I) -> Result<usize>
    where
        I: IntoIterator<Item = &'a MigrationId>,
    {
        let migrations: BTreeMap<String, MigrationState> = ids
            .into_iter()
            .map(|id| (id.to_string(), MigrationState::Skipped))
            .collect();
        let count = migrations.len();
        self.persist(migrations)?;
        tracing::info!(count, "All known migrations marked as skipped");
        Ok(count)
    }

    /// Write atomically: temp file in the same directory, fsync, rename
    fn persist(&self, migrations: BTreeMap<String, MigrationState>) -> Result<()> {
        let io_err = |source| StateError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let body = serde_json::to_string_pretty(&StateDocument { migrations })
            .map_err(|source| StateError::Corrupt {
                path: self.path.clone(),
                source,
            })?;

        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp).map_err(io_err)?;
            file.write_all(body.as_bytes()).map_err(io_err)?;
            file.write_all(b"\n").map_err(io_err)?;
            file.sync_all().map_err(io_err)?;
        }
        fs::rename(&tmp, &self.path).map_err(io_err)?;
        Ok(())
    }
}
