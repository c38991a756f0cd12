use rusqlite::Connection;

use crate::error::StorageError;

pub const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
    ",
    )?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);
INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, unixepoch());

CREATE TABLE IF NOT EXISTS applications (
    application_id BLOB PRIMARY KEY CHECK (length(application_id) = 16),
    owner_id TEXT NOT NULL,
    broker_id TEXT NOT NULL,
    assigned_workforce_id TEXT,
    loan_program TEXT NOT NULL,
    loan_category TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'draft',
    deleted INTEGER NOT NULL DEFAULT 0 CHECK (deleted IN (0, 1)),
    sections BLOB NOT NULL,
    progress BLOB NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_applications_owner ON applications (owner_id, created_at) WHERE deleted = 0;
CREATE INDEX IF NOT EXISTS idx_applications_broker ON applications (broker_id, created_at) WHERE deleted = 0;
CREATE INDEX IF NOT EXISTS idx_applications_assignee ON applications (assigned_workforce_id, created_at) WHERE deleted = 0;

CREATE TABLE IF NOT EXISTS history (
    rowid INTEGER PRIMARY KEY,
    application_id BLOB NOT NULL REFERENCES applications(application_id),
    recorded_at TEXT NOT NULL,
    action TEXT NOT NULL,
    description TEXT NOT NULL,
    performed_by TEXT NOT NULL,
    details BLOB
);
CREATE INDEX IF NOT EXISTS idx_history_application ON history (application_id, rowid);

CREATE TRIGGER IF NOT EXISTS history_no_update BEFORE UPDATE ON history
BEGIN
    SELECT RAISE(ABORT, 'history is append-only');
END;
CREATE TRIGGER IF NOT EXISTS history_no_delete BEFORE DELETE ON history
BEGIN
    SELECT RAISE(ABORT, 'history is append-only');
END;
";
