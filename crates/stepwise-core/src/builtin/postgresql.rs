//! PostgreSQL 9.6 → 11 cluster upgrade
//!
//! Runs after the distribution upgrade installed PostgreSQL 11 next to 9.6.
//! The 9.6 cluster is upgraded in place with `pg_upgradecluster` and dropped
//! once the new cluster is up.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::migration::{Migration, MigrationContext, MigrationError, MigrationId};

const ID: &str = "0017_postgresql_9p6_to_11";
const SERVICE: &str = "postgresql";
const DEFAULT_DATA_ROOT: &str = "/var/lib/postgresql";

pub struct PostgresqlUpgrade {
    id: MigrationId,
    data_root: PathBuf,
}

impl PostgresqlUpgrade {
    pub fn new() -> Result<Self, MigrationError> {
        Ok(Self {
            id: MigrationId::parse(ID)?,
            data_root: PathBuf::from(DEFAULT_DATA_ROOT),
        })
    }

    /// Look for clusters under another root (`<root>/9.6` holds the old one)
    pub fn with_data_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.data_root = root.into();
        self
    }

    fn package_is_installed(ctx: &MigrationContext<'_>, package: &str) -> Result<bool, MigrationError> {
        let output = ctx.runner.run(&format!(
            "dpkg --list | grep '^ii ' | grep -q -w {}",
            package
        ))?;
        Ok(output.success())
    }

    fn free_space(&self, ctx: &MigrationContext<'_>) -> Result<u64, MigrationError> {
        let output = ctx.runner.check(&format!(
            "df --output=avail -B1 {} | tail -n 1",
            self.data_root.display()
        ))?;
        output.stdout.trim().parse().map_err(|_| {
            MigrationError::Precondition(format!(
                "could not read free space of {}: '{}'",
                self.data_root.display(),
                output.stdout
            ))
        })
    }

    fn upgrade_cluster(ctx: &MigrationContext<'_>) -> Result<(), MigrationError> {
        // Cluster 11 usually does not exist yet; pg_upgradecluster creates it
        ctx.runner.check("LC_ALL=C pg_dropcluster --stop 11 main || true")?;
        ctx.runner.check("LC_ALL=C pg_upgradecluster -m upgrade 9.6 main")?;
        ctx.runner.check("LC_ALL=C pg_dropcluster --stop 9.6 main")?;
        Ok(())
    }
}

impl Migration for PostgresqlUpgrade {
    fn id(&self) -> &MigrationId {
        &self.id
    }

    fn description(&self) -> String {
        "Migrate databases from PostgreSQL 9.6 to 11".to_string()
    }

    fn run(&self, ctx: &MigrationContext<'_>) -> Result<(), MigrationError> {
        if !Self::package_is_installed(ctx, "postgresql-9.6")? {
            tracing::warn!(migration = %self.id, "postgresql-9.6 is not installed, nothing to migrate");
            return Ok(());
        }

        if !Self::package_is_installed(ctx, "postgresql-11")? {
            return Err(MigrationError::Precondition(
                "postgresql-11 is not installed; finish the distribution upgrade first".to_string(),
            ));
        }

        if !ctx.runner.run("pg_lsclusters | grep -q '^9.6 '")?.success() {
            tracing::warn!(migration = %self.id, "No active 9.6 cluster, nothing to migrate");
            return Ok(());
        }

        let used = space_used_by_directory(&self.data_root.join("9.6"))?;
        let free = self.free_space(ctx)?;
        if used > free {
            return Err(MigrationError::Precondition(format!(
                "not enough space in {} ({} bytes needed, {} available)",
                self.data_root.display(),
                used,
                free
            )));
        }

        ctx.services.stop(SERVICE)?;
        let upgraded = Self::upgrade_cluster(ctx);
        let started = ctx.services.start(SERVICE);
        upgraded?;
        started
    }
}

/// Apparent size of every file below `path`, symlinks not followed
fn space_used_by_directory(path: &Path) -> io::Result<u64> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    if !meta.is_dir() {
        return Ok(meta.len());
    }

    let mut total = 0;
    for entry in fs::read_dir(path)? {
        total += space_used_by_directory(&entry?.path())?;
    }
    Ok(total)
}
