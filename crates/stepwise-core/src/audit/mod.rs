//! Operation Journal
//!
//! One record per unit of work (a migration run, a skip, a restore hook),
//! opened before the work starts and closed with its outcome. The engine
//! never reads the journal back; it exists for operators and external tooling.

mod schema;

pub use schema::SCHEMA_MIGRATIONS;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

use crate::migration::MigrationId;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Journal error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Row that cannot be decoded
    #[error("Corrupt journal entry: {0}")]
    Corrupt(String),
    /// Lock poisoned by a panicking writer
    #[error("Journal lock poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, AuditError>;

// ============================================================================
// RECORDS
// ============================================================================

/// What a journal entry is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Running (or skipping) one migration
    MigrateForward,
    /// Marking every migration skipped on a fresh install
    SkipAll,
    /// Restore-time hook of one migration
    RestoreHook,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::MigrateForward => "migrate_forward",
            OperationKind::SkipAll => "skip_all",
            OperationKind::RestoreHook => "restore_hook",
        }
    }

    fn parse_name(s: &str) -> Option<Self> {
        match s {
            "migrate_forward" => Some(OperationKind::MigrateForward),
            "skip_all" => Some(OperationKind::SkipAll),
            "restore_hook" => Some(OperationKind::RestoreHook),
            _ => None,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A journal entry as stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: Uuid,
    pub kind: OperationKind,
    pub migration_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// `None` while the operation is open (or was interrupted)
    pub success: Option<bool>,
    pub error: Option<String>,
    pub tool_version: Option<String>,
}

/// Handle of an open operation; close it with [`AuditLog::succeed`] or [`AuditLog::fail`]
#[derive(Debug)]
#[must_use = "an operation must be closed with succeed() or fail()"]
pub struct Operation {
    id: Uuid,
    started_at: DateTime<Utc>,
}

impl Operation {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

// ============================================================================
// JOURNAL
// ============================================================================

/// SQLite-backed operation journal
pub struct AuditLog {
    conn: Mutex<Connection>,
}

impl AuditLog {
    /// Open (and create or upgrade) the journal at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // Restrict journal file permissions to owner-only on Unix
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            let _ = std::fs::set_permissions(path, perms);
        }

        Self::from_connection(conn)
    }

    /// Journal that lives only as long as the process
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA busy_timeout = 5000;")?;
        schema::apply_schema_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open a new operation
    pub fn begin(&self, kind: OperationKind, migration: Option<&MigrationId>) -> Result<Operation> {
        let operation = Operation {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
        };

        let conn = self.conn.lock().map_err(|_| AuditError::Poisoned)?;
        conn.execute(
            "INSERT INTO operations (id, kind, migration_id, started_at, tool_version)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                operation.id.to_string(),
                kind.as_str(),
                migration.map(|m| m.to_string()),
                operation.started_at,
                env!("CARGO_PKG_VERSION"),
            ],
        )?;

        tracing::debug!(operation = %operation.id, kind = %kind, "Operation started");
        Ok(operation)
    }

    /// Close an operation as successful
    pub fn succeed(&self, operation: Operation) -> Result<()> {
        self.close(operation, true, None)
    }

    /// Close an operation as failed
    pub fn fail(&self, operation: Operation, message: &str) -> Result<()> {
        self.close(operation, false, Some(message))
    }

    fn close(&self, operation: Operation, success: bool, error: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| AuditError::Poisoned)?;
        let updated = conn.execute(
            "UPDATE operations SET ended_at = ?1, success = ?2, error = ?3 WHERE id = ?4",
            params![Utc::now(), success, error, operation.id.to_string()],
        )?;
        if updated == 0 {
            return Err(AuditError::Corrupt(format!(
                "operation {} vanished before it was closed",
                operation.id
            )));
        }
        tracing::debug!(operation = %operation.id, success, "Operation closed");
        Ok(())
    }

    /// Fetch one record
    pub fn get(&self, id: Uuid) -> Result<Option<OperationRecord>> {
        let conn = self.conn.lock().map_err(|_| AuditError::Poisoned)?;
        let row = conn
            .query_row(
                "SELECT id, kind, migration_id, started_at, ended_at, success, error, tool_version
                 FROM operations WHERE id = ?1",
                params![id.to_string()],
                RawRecord::from_row,
            )
            .optional()?;
        row.map(RawRecord::into_record).transpose()
    }

    /// Most recent records, newest first
    pub fn recent(&self, limit: usize) -> Result<Vec<OperationRecord>> {
        let conn = self.conn.lock().map_err(|_| AuditError::Poisoned)?;
        let mut stmt = conn.prepare(
            "SELECT id, kind, migration_id, started_at, ended_at, success, error, tool_version
             FROM operations ORDER BY started_at DESC, rowid DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], RawRecord::from_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }
}

/// Row before the text columns are validated
struct RawRecord {
    id: String,
    kind: String,
    migration_id: Option<String>,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    success: Option<bool>,
    error: Option<String>,
    tool_version: Option<String>,
}

impl RawRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            migration_id: row.get(2)?,
            started_at: row.get(3)?,
            ended_at: row.get(4)?,
            success: row.get(5)?,
            error: row.get(6)?,
            tool_version: row.get(7)?,
        })
    }

    fn into_record(self) -> Result<OperationRecord> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| AuditError::Corrupt(format!("bad operation id '{}': {}", self.id, e)))?;
        let kind = OperationKind::parse_name(&self.kind)
            .ok_or_else(|| AuditError::Corrupt(format!("unknown operation kind '{}'", self.kind)))?;
        Ok(OperationRecord {
            id,
            kind,
            migration_id: self.migration_id,
            started_at: self.started_at,
            ended_at: self.ended_at,
            success: self.success,
            error: self.error,
            tool_version: self.tool_version,
        })
    }
}
