//! Backup/rollback envelope for risky migrations
//!
//! Snapshot one or more directory trees while their service is stopped, run the
//! mutation, and on failure put the trees back exactly as they were before
//! propagating the original error.
//!
//! ```rust,ignore
//! let txn = BackupTransaction::new(&ctx.config.backup_root)
//!     .service("slapd")
//!     .target("ldap_config", "/etc/ldap")
//!     .target("ldap_db", "/var/lib/ldap");
//!
//! txn.run(ctx.services, |backup| {
//!     // read the old tree from `backup`, rewrite the live one
//!     Ok(())
//! })?;
//! ```

use chrono::Utc;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::migration::MigrationError;
use crate::system::ServiceManager;

/// Directory (or file) captured by a [`BackupTransaction`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupTarget {
    /// Name of the copy inside the backup location
    pub label: String,
    /// Live path
    pub path: PathBuf,
}

/// Stops a service and starts it again when dropped, whatever happened in between
struct ServiceGuard<'a> {
    services: &'a dyn ServiceManager,
    name: &'a str,
}

impl<'a> ServiceGuard<'a> {
    /// The guard exists before the stop attempt, so even a failed stop is followed by a start
    fn stop(services: &'a dyn ServiceManager, name: &'a str) -> Result<Self, MigrationError> {
        let guard = Self { services, name };
        services.stop(name)?;
        Ok(guard)
    }
}

impl Drop for ServiceGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.services.start(self.name) {
            tracing::error!(service = self.name, "Failed to restart service: {}", e);
        }
    }
}

/// Snapshot-and-restore envelope around a sensitive mutation
#[derive(Debug, Clone)]
pub struct BackupTransaction {
    backup_root: PathBuf,
    service: Option<String>,
    targets: Vec<BackupTarget>,
}

impl BackupTransaction {
    /// Backups go to `<backup_root>/premigration/<timestamp>`
    pub fn new(backup_root: impl Into<PathBuf>) -> Self {
        Self {
            backup_root: backup_root.into(),
            service: None,
            targets: Vec::new(),
        }
    }

    /// Service to stop while trees are copied
    pub fn service(mut self, name: impl Into<String>) -> Self {
        self.service = Some(name.into());
        self
    }

    /// Add a tree to capture
    pub fn target(mut self, label: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.targets.push(BackupTarget {
            label: label.into(),
            path: path.into(),
        });
        self
    }

    pub fn targets(&self) -> &[BackupTarget] {
        &self.targets
    }

    /// Back up, run `body` with the backup location, roll back if it fails
    ///
    /// The body's own error is returned unchanged after a successful rollback.
    pub fn run<T, F>(&self, services: &dyn ServiceManager, body: F) -> Result<T, MigrationError>
    where
        F: FnOnce(&Path) -> Result<T, MigrationError>,
    {
        tracing::info!("Backing up before migration");
        let location = self.take_backup(services)?;
        tracing::debug!(location = %location.display(), "Backup taken");

        match body(&location) {
            Ok(value) => {
                if let Err(e) = fs::remove_dir_all(&location) {
                    tracing::warn!(
                        location = %location.display(),
                        "Could not remove pre-migration backup: {}",
                        e
                    );
                }
                Ok(value)
            }
            Err(original) => {
                tracing::warn!("Migration failed, trying to roll back: {}", original);
                match self.restore(services, &location) {
                    Ok(()) => {
                        if let Err(e) = fs::remove_dir_all(&location) {
                            tracing::warn!(
                                location = %location.display(),
                                "Could not remove pre-migration backup after rollback: {}",
                                e
                            );
                        }
                        tracing::info!("Rollback succeeded, system is back to its previous state");
                        Err(original)
                    }
                    Err(rollback) => {
                        tracing::error!(
                            location = %location.display(),
                            "Rollback failed, manual intervention required (backup kept): {}",
                            rollback
                        );
                        Err(MigrationError::RollbackFailed {
                            original: original.to_string(),
                            rollback: rollback.to_string(),
                        })
                    }
                }
            }
        }
    }

    /// Create the backup location and copy every target into it
    fn take_backup(&self, services: &dyn ServiceManager) -> Result<PathBuf, MigrationError> {
        let location = self
            .create_location()
            .map_err(|e| MigrationError::BackupFailed(format!("cannot create backup directory: {}", e)))?;

        if let Err(e) = self.copy_with_service_stopped(services, &location) {
            let _ = fs::remove_dir_all(&location);
            return Err(e);
        }
        Ok(location)
    }

    fn copy_with_service_stopped(
        &self,
        services: &dyn ServiceManager,
        location: &Path,
    ) -> Result<(), MigrationError> {
        let _guard = match &self.service {
            Some(name) => Some(ServiceGuard::stop(services, name).map_err(|e| {
                MigrationError::BackupFailed(format!("cannot stop {}: {}", name, e))
            })?),
            None => None,
        };
        self.copy_targets_into(location)
    }

    fn copy_targets_into(&self, location: &Path) -> Result<(), MigrationError> {
        for target in &self.targets {
            if !exists(&target.path) {
                tracing::debug!(path = %target.path.display(), "Backup target absent, nothing to copy");
                continue;
            }
            copy_tree(&target.path, &location.join(&target.label)).map_err(|e| {
                MigrationError::BackupFailed(format!(
                    "cannot copy {} to backup: {}",
                    target.path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Erase live trees and copy the backup back over them
    fn restore(&self, services: &dyn ServiceManager, location: &Path) -> Result<(), MigrationError> {
        let _guard = match &self.service {
            Some(name) => Some(ServiceGuard::stop(services, name)?),
            None => None,
        };

        for target in &self.targets {
            remove_path(&target.path)?;
            let saved = location.join(&target.label);
            if exists(&saved) {
                copy_tree(&saved, &target.path)?;
            }
        }
        Ok(())
    }

    fn create_location(&self) -> io::Result<PathBuf> {
        let parent = self.backup_root.join("premigration");
        fs::create_dir_all(&parent)?;

        let stamp = Utc::now().format("%Y%m%d-%H%M%S").to_string();
        let mut attempt = 0u32;
        loop {
            let name = if attempt == 0 {
                stamp.clone()
            } else {
                format!("{}-{}", stamp, attempt)
            };
            let candidate = parent.join(name);
            match create_private_dir(&candidate) {
                Ok(()) => return Ok(candidate),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(unix)]
fn create_private_dir(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().mode(0o750).create(path)
}

#[cfg(not(unix))]
fn create_private_dir(path: &Path) -> io::Result<()> {
    fs::create_dir(path)
}

/// True for anything present at `path`, dangling symlinks included
fn exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// Remove whatever is at `path`; absence is fine
fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Recursive copy keeping contents, permissions, symlinks and (when allowed) ownership
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(src)?;
    let file_type = meta.file_type();

    if file_type.is_symlink() {
        copy_symlink(src, dst)?;
    } else if file_type.is_dir() {
        fs::create_dir_all(dst)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            copy_tree(&entry.path(), &dst.join(entry.file_name()))?;
        }
        // Last, so a read-only directory can still be filled
        fs::set_permissions(dst, meta.permissions())?;
    } else if file_type.is_file() {
        fs::copy(src, dst)?;
    } else {
        // Opening a FIFO for reading would block until a writer shows up
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a regular file, directory or symlink", src.display()),
        ));
    }

    preserve_owner(&meta, dst);
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(fs::read_link(src)?, dst)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    fs::copy(src, dst).map(|_| ())
}

#[cfg(unix)]
fn preserve_owner(meta: &fs::Metadata, dst: &Path) {
    use std::os::unix::fs::MetadataExt;
    // Only root can give files away; unprivileged copies keep the caller as owner
    let _ = std::os::unix::fs::lchown(dst, Some(meta.uid()), Some(meta.gid()));
}

#[cfg(not(unix))]
fn preserve_owner(_meta: &fs::Metadata, _dst: &Path) {}
