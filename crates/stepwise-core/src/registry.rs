//! Migration registry
//!
//! Joins the built-in table and the manifests found in the discovery
//! directory with the persisted state, ordered by ordinal.

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

use crate::config::Config;
use crate::migration::manifest::ManifestError;
use crate::migration::{ManifestMigration, Migration, MigrationId, MigrationState};
use crate::state::{StateError, StateStore};

/// Registry error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A file named like a migration could not be loaded
    #[error("Could not load migration {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: ManifestError,
    },
    /// Two sources define the same id
    #[error("Migration {0} is defined more than once")]
    Duplicate(String),
    #[error("Could not scan {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    State(#[from] StateError),
    /// Reference resolved to zero or several migrations
    #[error("No such migration: {0}")]
    NoSuchMigration(String),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// A descriptor joined with its state for this invocation
pub struct RegisteredMigration {
    migration: Box<dyn Migration>,
    state: MigrationState,
}

impl RegisteredMigration {
    pub fn id(&self) -> &MigrationId {
        self.migration.id()
    }

    pub fn migration(&self) -> &dyn Migration {
        self.migration.as_ref()
    }

    pub fn state(&self) -> MigrationState {
        self.state
    }
}

impl std::fmt::Debug for RegisteredMigration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredMigration")
            .field("id", self.id())
            .field("state", &self.state)
            .finish()
    }
}

/// Ordered set of known migrations
#[derive(Debug)]
pub struct Registry {
    migrations: Vec<RegisteredMigration>,
    store: StateStore,
}

impl Registry {
    /// Discover manifests, merge with `builtins`, join persisted state
    pub fn load(builtins: Vec<Box<dyn Migration>>, config: &Config, store: &StateStore) -> Result<Self> {
        let mut all = builtins;
        all.extend(discover(config)?);
        Self::from_migrations(all, store)
    }

    /// Registry over an explicit set of descriptors (no discovery)
    pub fn from_migrations(all: Vec<Box<dyn Migration>>, store: &StateStore) -> Result<Self> {
        let mut seen = HashSet::new();
        for migration in &all {
            if !seen.insert(migration.id().to_string()) {
                return Err(RegistryError::Duplicate(migration.id().to_string()));
            }
        }

        let states = store.read()?;
        let mut migrations: Vec<RegisteredMigration> = all
            .into_iter()
            .map(|migration| {
                let state = states
                    .get(migration.id().as_str())
                    .copied()
                    .unwrap_or_default();
                RegisteredMigration { migration, state }
            })
            .collect();
        migrations.sort_by(|a, b| {
            (a.id().ordinal(), a.id().as_str()).cmp(&(b.id().ordinal(), b.id().as_str()))
        });

        for stale in states.keys().filter(|id| !seen.contains(id.as_str())) {
            tracing::debug!(migration = %stale, "Ignoring state of unknown migration");
        }

        let registry = Self {
            migrations,
            store: store.clone(),
        };
        registry.warn_unresolved_dependencies();
        Ok(registry)
    }

    fn warn_unresolved_dependencies(&self) {
        for entry in &self.migrations {
            for dep in entry.migration.dependencies() {
                if self.position(dep).is_none() {
                    tracing::warn!(
                        migration = %entry.id(),
                        dependency = %dep,
                        "Dependency does not resolve to exactly one migration; it can never be met"
                    );
                }
            }
        }
    }

    /// All migrations, ascending by ordinal
    pub fn all(&self) -> &[RegisteredMigration] {
        &self.migrations
    }

    pub fn get(&self, index: usize) -> Option<&RegisteredMigration> {
        self.migrations.get(index)
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Resolve a reference by id, slug or ordinal
    pub fn find(&self, target: &str) -> Result<&RegisteredMigration> {
        self.position(target)
            .map(|i| &self.migrations[i])
            .ok_or_else(|| RegistryError::NoSuchMigration(target.to_string()))
    }

    /// Index of the single migration matching `target`
    pub fn position(&self, target: &str) -> Option<usize> {
        let mut matches = self
            .migrations
            .iter()
            .enumerate()
            .filter(|(_, m)| m.id().matches(target))
            .map(|(i, _)| i);
        match (matches.next(), matches.next()) {
            (Some(i), None) => Some(i),
            _ => None,
        }
    }

    /// Dependencies of the migration at `index` that are neither done nor skipped
    pub fn unmet_dependencies(&self, index: usize) -> Vec<String> {
        let Some(entry) = self.migrations.get(index) else {
            return Vec::new();
        };
        entry
            .migration
            .dependencies()
            .iter()
            .filter(|dep| match self.position(dep) {
                Some(i) => self.migrations[i].state.is_pending(),
                None => true,
            })
            .cloned()
            .collect()
    }

    /// Persist a new state and reflect it in this view
    pub fn set_state(&mut self, index: usize, state: MigrationState) -> std::result::Result<(), StateError> {
        let Some(entry) = self.migrations.get_mut(index) else {
            return Ok(());
        };
        self.store.write(entry.migration.id(), state)?;
        entry.state = state;
        Ok(())
    }

    /// Mark every known migration skipped
    pub fn skip_all(&mut self) -> std::result::Result<usize, StateError> {
        let count = self
            .store
            .skip_all(self.migrations.iter().map(|m| m.migration.id()))?;
        for entry in &mut self.migrations {
            entry.state = MigrationState::Skipped;
        }
        Ok(count)
    }
}

/// Load every `<digits>_<name>.json` in the discovery directory
fn discover(config: &Config) -> Result<Vec<Box<dyn Migration>>> {
    let dir = &config.migrations_dir;
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(dir = %dir.display(), "No migrations directory");
            return Ok(Vec::new());
        }
        Err(source) => {
            return Err(RegistryError::Io {
                path: dir.clone(),
                source,
            });
        }
    };

    let mut found: Vec<Box<dyn Migration>> = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|source| RegistryError::Io {
                path: dir.clone(),
                source,
            })?
            .path();

        let named_like_migration = path.extension().is_some_and(|ext| ext == "json")
            && path
                .file_stem()
                .and_then(|s| s.to_str())
                .is_some_and(|stem| MigrationId::parse(stem).is_ok());
        if !named_like_migration || !path.is_file() {
            tracing::debug!(path = %path.display(), "Ignoring non-migration entry");
            continue;
        }

        let migration = ManifestMigration::load(&path)
            .map_err(|source| RegistryError::Load { path: path.clone(), source })?;
        tracing::debug!(migration = %migration.id(), "Discovered manifest migration");
        found.push(Box::new(migration));
    }
    Ok(found)
}
