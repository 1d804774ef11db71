//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: per-session client state
    r#"
    CREATE TABLE IF NOT EXISTS sessions (
        id               TEXT PRIMARY KEY,
        cursor           INTEGER NOT NULL DEFAULT 0,
        status           TEXT,
        updated_at       DATETIME NOT NULL
    );

    CREATE TABLE IF NOT EXISTS session_agents (
        session_id       TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        name             TEXT NOT NULL,
        status           TEXT NOT NULL,
        last_seen_at     DATETIME NOT NULL,
        PRIMARY KEY (session_id, name)
    );

    CREATE TABLE IF NOT EXISTS message_marks (
        session_id       TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        message_id       TEXT NOT NULL,
        mark             TEXT NOT NULL CHECK (mark IN ('starred', 'pinned')),
        created_at       DATETIME NOT NULL,
        PRIMARY KEY (session_id, message_id, mark)
    );
    "#,
    // Version 2: lookups for the status listing
    r#"
    CREATE INDEX IF NOT EXISTS idx_sessions_updated ON sessions(updated_at);
    CREATE INDEX IF NOT EXISTS idx_message_marks_mark ON message_marks(session_id, mark);
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::info!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute_batch(&format!("PRAGMA user_version = {}", version))?;
        }
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}
