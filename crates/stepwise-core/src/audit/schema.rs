//! Journal Schema
//!
//! Schema migration definitions for the operation journal database.

/// Schema migration definitions
pub const SCHEMA_MIGRATIONS: &[SchemaMigration] = &[
    SchemaMigration {
        version: 1,
        description: "Initial operations journal",
        up: SCHEMA_V1_UP,
    },
    SchemaMigration {
        version: 2,
        description: "Record which operation kind and host version produced each entry",
        up: SCHEMA_V2_UP,
    },
];

/// A journal schema migration
#[derive(Debug, Clone)]
pub struct SchemaMigration {
    /// Version number
    pub version: u32,
    /// Description
    pub description: &'static str,
    /// SQL to apply
    pub up: &'static str,
}

/// V1: Initial schema
const SCHEMA_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS operations (
    id TEXT PRIMARY KEY,
    migration_id TEXT,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    -- NULL while the operation is still open
    success INTEGER,
    error TEXT
);

CREATE INDEX IF NOT EXISTS idx_operations_started ON operations(started_at);
CREATE INDEX IF NOT EXISTS idx_operations_migration ON operations(migration_id);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);

INSERT OR REPLACE INTO schema_version (version, applied_at) VALUES (1, datetime('now'));
"#;

/// V2: operation kind + tool version
const SCHEMA_V2_UP: &str = r#"
ALTER TABLE operations ADD COLUMN kind TEXT NOT NULL DEFAULT 'migrate_forward';
ALTER TABLE operations ADD COLUMN tool_version TEXT;

CREATE INDEX IF NOT EXISTS idx_operations_kind ON operations(kind);

INSERT OR REPLACE INTO schema_version (version, applied_at) VALUES (2, datetime('now'));
"#;

/// Get current schema version from database
pub fn get_current_version(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .or(Ok(0))
}

/// Apply pending schema migrations
pub fn apply_schema_migrations(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    let current_version = get_current_version(conn)?;
    let mut applied = 0;

    for migration in SCHEMA_MIGRATIONS {
        if migration.version > current_version {
            tracing::debug!(
                "Applying journal schema v{}: {}",
                migration.version,
                migration.description
            );

            conn.execute_batch(migration.up)?;
            applied += 1;
        }
    }

    Ok(applied)
}
