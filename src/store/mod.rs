//! Shared `SQLite` persistence for runs, run events, and hierarchies.
//!
//! A single WAL-mode database backs all repositories. Access goes through
//! `Db::with_conn`, which serializes connection use behind a mutex; callers
//! never hold the connection across an await point.

pub mod events;
pub mod hierarchies;
pub mod runs;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Thread-safe database handle. Cheap to clone; all clones share one
/// connection.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Open or create the database at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("Failed to set database pragmas")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Open an in-memory database for testing.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to set database pragmas")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Execute a closure with the database connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {e}"))?;
        f(&conn)
    }

    fn init_schema(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS hierarchies (
                    id          TEXT PRIMARY KEY,
                    name        TEXT NOT NULL,
                    definition  TEXT NOT NULL,
                    created_at  TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS runs (
                    id            TEXT PRIMARY KEY,
                    hierarchy_id  TEXT NOT NULL,
                    task          TEXT NOT NULL,
                    status        TEXT NOT NULL DEFAULT 'pending',
                    result        TEXT,
                    error         TEXT,
                    statistics    TEXT,
                    topology      TEXT,
                    created_at    TEXT NOT NULL,
                    started_at    TEXT,
                    completed_at  TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_runs_hierarchy ON runs(hierarchy_id);
                CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);

                CREATE TABLE IF NOT EXISTS run_events (
                    id          TEXT PRIMARY KEY,
                    run_id      TEXT NOT NULL,
                    sequence    INTEGER NOT NULL,
                    timestamp   TEXT NOT NULL,
                    agent_id    TEXT,
                    agent_type  TEXT,
                    agent_name  TEXT,
                    team_name   TEXT,
                    category    TEXT NOT NULL,
                    action      TEXT NOT NULL,
                    data        TEXT NOT NULL DEFAULT '{}',
                    UNIQUE(run_id, sequence)
                );
                CREATE INDEX IF NOT EXISTS idx_run_events_run
                    ON run_events(run_id, sequence);
                ",
            )
            .context("Failed to initialize schema")?;
            Ok(())
        })
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory_creates_tables() {
        let db = Db::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table'
                 AND name IN ('hierarchies', 'runs', 'run_events')",
                [],
                |row| row.get(0),
            )?;
            assert_eq!(count, 3);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn schema_is_idempotent() {
        let db = Db::open_in_memory().unwrap();
        db.init_schema().unwrap();
        db.init_schema().unwrap();
    }

    #[test]
    fn open_file_based() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("data").join("conductor.db");
        let db = Db::open(&path).unwrap();
        assert!(path.exists());
        db.with_conn(|conn| {
            let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
            assert_eq!(mode, "wal");
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn duplicate_sequence_rejected() {
        let db = Db::open_in_memory().unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO run_events (id, run_id, sequence, timestamp, category, action)
                 VALUES ('e1', 'r1', 1, 't', 'lifecycle', 'started')",
                [],
            )?;
            let dup = conn.execute(
                "INSERT INTO run_events (id, run_id, sequence, timestamp, category, action)
                 VALUES ('e2', 'r1', 1, 't', 'llm', 'stream')",
                [],
            );
            assert!(dup.is_err());
            Ok(())
        })
        .unwrap();
    }
}
