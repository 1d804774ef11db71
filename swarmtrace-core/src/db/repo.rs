//! Database repository layer
//!
//! Stores per-session client state: the resume cursor, the agent roster and
//! starred/pinned message marks.

use crate::error::{Error, Result};
use crate::store::StateStore;
use crate::types::{AgentStatus, MarkKind, RunStatus, SessionState};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// One row of the session listing
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub id: String,
    pub cursor: u64,
    pub status: Option<RunStatus>,
    pub updated_at: DateTime<Utc>,
    pub agent_count: i64,
}

/// Database handle (single connection)
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        super::schema::run_migrations(&self.conn())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ============================================
    // Session state
    // ============================================

    /// Load the stored state for a session, if any.
    pub fn session_state(&self, session_id: &str) -> Result<Option<SessionState>> {
        let conn = self.conn();
        let Some((cursor, status, updated_at)) = conn
            .query_row(
                "SELECT cursor, status, updated_at FROM sessions WHERE id = ?",
                [session_id],
                |row| {
                    Ok((
                        row.get::<_, i64>("cursor")?,
                        row.get::<_, Option<String>>("status")?,
                        row.get::<_, String>("updated_at")?,
                    ))
                },
            )
            .optional()?
        else {
            return Ok(None);
        };

        let mut state = SessionState::new(session_id);
        state.cursor = cursor.max(0) as u64;
        state.status = status.as_deref().map(RunStatus::from);
        state.updated_at = Some(parse_datetime(&updated_at));

        let mut stmt =
            conn.prepare("SELECT name, status FROM session_agents WHERE session_id = ?")?;
        let agents = stmt.query_map([session_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for agent in agents {
            let (name, status) = agent?;
            match status.parse::<AgentStatus>() {
                Ok(status) => {
                    state.agents.insert(name, status);
                }
                Err(e) => tracing::warn!(session_id, agent = %name, error = %e, "skipping agent"),
            }
        }

        let mut stmt =
            conn.prepare("SELECT message_id, mark FROM message_marks WHERE session_id = ?")?;
        let marks = stmt.query_map([session_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for mark in marks {
            let (message_id, mark) = mark?;
            match mark.parse::<MarkKind>() {
                Ok(MarkKind::Starred) => {
                    state.starred.insert(message_id);
                }
                Ok(MarkKind::Pinned) => {
                    state.pinned.insert(message_id);
                }
                Err(e) => tracing::warn!(session_id, error = %e, "skipping mark"),
            }
        }

        Ok(Some(state))
    }

    /// Store the state for a session.
    ///
    /// Cursor, status and agent roster are replaced; marks are merged.
    pub fn save_session_state(&self, state: &SessionState) -> Result<()> {
        let cursor = i64::try_from(state.cursor)
            .map_err(|_| Error::Config(format!("cursor out of range: {}", state.cursor)))?;
        let now = Utc::now().to_rfc3339();

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO sessions (id, cursor, status, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO UPDATE SET
                cursor = excluded.cursor,
                status = excluded.status,
                updated_at = excluded.updated_at
            "#,
            params![
                state.session_id,
                cursor,
                state.status.map(|s| s.as_str()),
                state
                    .updated_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| now.clone()),
            ],
        )?;

        tx.execute(
            "DELETE FROM session_agents WHERE session_id = ?",
            [&state.session_id],
        )?;
        for (name, status) in &state.agents {
            tx.execute(
                "INSERT INTO session_agents (session_id, name, status, last_seen_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![state.session_id, name, status.as_str(), now],
            )?;
        }

        // Marks merge: `set_mark` may have written rows since this state
        // was loaded, so only explicit removals delete anything
        for (message_id, mark) in &state.cleared_marks {
            tx.execute(
                "DELETE FROM message_marks
                 WHERE session_id = ?1 AND message_id = ?2 AND mark = ?3",
                params![state.session_id, message_id, mark.as_str()],
            )?;
        }
        let marks = state
            .starred
            .iter()
            .map(|id| (id, MarkKind::Starred))
            .chain(state.pinned.iter().map(|id| (id, MarkKind::Pinned)));
        for (message_id, mark) in marks {
            tx.execute(
                "INSERT OR IGNORE INTO message_marks (session_id, message_id, mark, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![state.session_id, message_id, mark.as_str(), now],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Delete everything stored for a session. Returns whether it existed.
    pub fn delete_session(&self, session_id: &str) -> Result<bool> {
        let conn = self.conn();
        let deleted = conn.execute("DELETE FROM sessions WHERE id = ?", [session_id])?;
        Ok(deleted > 0)
    }

    /// List stored sessions, most recently updated first.
    pub fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT s.id, s.cursor, s.status, s.updated_at,
                   (SELECT COUNT(*) FROM session_agents a WHERE a.session_id = s.id) AS agent_count
            FROM sessions s
            ORDER BY s.updated_at DESC
            "#,
        )?;
        let rows = stmt.query_map([], Self::row_to_record)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }

    fn row_to_record(row: &Row) -> rusqlite::Result<SessionRecord> {
        let status: Option<String> = row.get("status")?;
        let updated_at: String = row.get("updated_at")?;
        Ok(SessionRecord {
            id: row.get("id")?,
            cursor: row.get::<_, i64>("cursor")?.max(0) as u64,
            status: status.as_deref().map(RunStatus::from),
            updated_at: parse_datetime(&updated_at),
            agent_count: row.get("agent_count")?,
        })
    }

    // ============================================
    // Message marks
    // ============================================

    /// Set or clear a mark on a message.
    pub fn set_mark(
        &self,
        session_id: &str,
        message_id: &str,
        mark: MarkKind,
        enabled: bool,
    ) -> Result<()> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();
        if enabled {
            conn.execute(
                "INSERT OR IGNORE INTO sessions (id, cursor, updated_at) VALUES (?1, 0, ?2)",
                params![session_id, now],
            )?;
            conn.execute(
                "INSERT OR IGNORE INTO message_marks (session_id, message_id, mark, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![session_id, message_id, mark.as_str(), now],
            )?;
        } else {
            conn.execute(
                "DELETE FROM message_marks WHERE session_id = ?1 AND message_id = ?2 AND mark = ?3",
                params![session_id, message_id, mark.as_str()],
            )?;
        }
        Ok(())
    }

    /// Message ids carrying `mark`, oldest mark first.
    pub fn marks(&self, session_id: &str, mark: MarkKind) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT message_id FROM message_marks
             WHERE session_id = ?1 AND mark = ?2
             ORDER BY created_at, message_id",
        )?;
        let rows = stmt.query_map(params![session_id, mark.as_str()], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<String>>>()
            .map_err(Error::from)
    }
}

impl StateStore for Database {
    fn load_state(&self, session_id: &str) -> Result<SessionState> {
        Ok(self
            .session_state(session_id)?
            .unwrap_or_else(|| SessionState::new(session_id)))
    }

    fn save_state(&self, state: &SessionState) -> Result<()> {
        self.save_session_state(state)
    }

    fn clear_state(&self, session_id: &str) -> Result<()> {
        self.delete_session(session_id)?;
        Ok(())
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SessionStore;

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        db
    }

    fn sample_state() -> SessionState {
        let mut state = SessionState::new("run-42");
        state.cursor = 17;
        state.status = Some(RunStatus::Running);
        state
            .agents
            .insert("Researcher".to_string(), AgentStatus::Completed);
        state.agents.insert("Writer".to_string(), AgentStatus::Running);
        state.starred.insert("m1".to_string());
        state.pinned.insert("m2".to_string());
        state
    }

    #[test]
    fn test_unknown_session_loads_empty_state() {
        let db = test_db();
        assert!(db.session_state("nope").unwrap().is_none());

        let state = db.load_state("nope").unwrap();
        assert_eq!(state.session_id, "nope");
        assert_eq!(state.cursor, 0);
        assert!(state.agents.is_empty());
    }

    #[test]
    fn test_save_and_load_state() {
        let db = test_db();
        db.save_state(&sample_state()).unwrap();

        let loaded = db.load_state("run-42").unwrap();
        assert_eq!(loaded.cursor, 17);
        assert_eq!(loaded.status, Some(RunStatus::Running));
        assert_eq!(loaded.agents.len(), 2);
        assert_eq!(loaded.agents["Writer"], AgentStatus::Running);
        assert!(loaded.starred.contains("m1"));
        assert!(loaded.pinned.contains("m2"));
        assert!(loaded.updated_at.is_some());
    }

    #[test]
    fn test_save_replaces_previous_state() {
        let db = test_db();
        db.save_state(&sample_state()).unwrap();

        let mut next = SessionState::new("run-42");
        next.cursor = 30;
        next.agents.insert("Writer".to_string(), AgentStatus::Completed);
        db.save_state(&next).unwrap();

        let loaded = db.load_state("run-42").unwrap();
        assert_eq!(loaded.cursor, 30);
        assert_eq!(loaded.agents.len(), 1);
        // Marks are not part of the replace
        assert!(loaded.starred.contains("m1"));
    }

    #[test]
    fn test_save_keeps_marks_set_while_following() {
        let db = test_db();
        db.save_state(&sample_state()).unwrap();

        let mut store = SessionStore::from_state(&db.load_state("run-42").unwrap(), 500);
        db.set_mark("run-42", "m7", MarkKind::Starred, true).unwrap();
        assert!(!store.toggle_mark("m2", MarkKind::Pinned));
        db.save_state(&store.to_state(20, Some(RunStatus::Done)))
            .unwrap();

        let loaded = db.load_state("run-42").unwrap();
        assert_eq!(loaded.cursor, 20);
        assert_eq!(
            loaded.starred.iter().collect::<Vec<_>>(),
            vec!["m1", "m7"]
        );
        assert!(loaded.pinned.is_empty());
        assert!(loaded.cleared_marks.is_empty());
    }

    #[test]
    fn test_clear_state_cascades() {
        let db = test_db();
        db.save_state(&sample_state()).unwrap();

        db.clear_state("run-42").unwrap();
        assert!(db.session_state("run-42").unwrap().is_none());
        assert!(db.marks("run-42", MarkKind::Starred).unwrap().is_empty());
        assert!(!db.delete_session("run-42").unwrap());
    }

    #[test]
    fn test_set_mark_creates_session_row() {
        let db = test_db();
        db.set_mark("fresh", "m9", MarkKind::Pinned, true).unwrap();
        db.set_mark("fresh", "m9", MarkKind::Pinned, true).unwrap();
        assert_eq!(db.marks("fresh", MarkKind::Pinned).unwrap(), vec!["m9"]);
        assert!(db.marks("fresh", MarkKind::Starred).unwrap().is_empty());

        db.set_mark("fresh", "m9", MarkKind::Pinned, false).unwrap();
        assert!(db.marks("fresh", MarkKind::Pinned).unwrap().is_empty());
        assert!(db.session_state("fresh").unwrap().is_some());
    }

    #[test]
    fn test_list_sessions() {
        let db = test_db();
        db.save_state(&sample_state()).unwrap();
        db.save_state(&SessionState::new("other")).unwrap();

        let sessions = db.list_sessions().unwrap();
        assert_eq!(sessions.len(), 2);
        let run = sessions.iter().find(|s| s.id == "run-42").unwrap();
        assert_eq!(run.agent_count, 2);
        assert_eq!(run.cursor, 17);
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state.db");
        let db = Database::open(&path).unwrap();
        db.migrate().unwrap();
        assert!(path.exists());
    }
}
