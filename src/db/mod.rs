//! SQLite-backed job store.
//!
//! `OrchestratorDb` owns one connection. Every multi-row mutation runs in a
//! single `BEGIN IMMEDIATE` transaction, and every job status write is a
//! compare-and-swap (`UPDATE … WHERE status IN (…)`), so a writer that loses
//! a race changes zero rows and moves on.
//!
//! Table operations live in submodules as free functions over
//! `&Connection`, which lets the reconciler compose them inside one
//! transaction. The `impl OrchestratorDb` blocks in those submodules are the
//! self-contained entry points.

pub mod events;
pub mod jobs;
pub mod recipes;
pub mod sessions;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};

use crate::errors::{OrchestratorError, Result};

/// Async-safe handle to the orchestrator database.
///
/// Wraps `OrchestratorDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, keeping synchronous SQLite
/// I/O off the async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<OrchestratorDb>>,
}

impl DbHandle {
    pub fn new(db: OrchestratorDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&OrchestratorDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| OrchestratorError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. For startup, the CLI and
    /// tests; never from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, OrchestratorDb>> {
        self.inner.lock().map_err(|_| OrchestratorError::LockPoisoned)
    }
}

pub struct OrchestratorDb {
    conn: Connection,
}

impl OrchestratorDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .context("Failed to enable WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS sessions (
                    id TEXT PRIMARY KEY,
                    status TEXT NOT NULL,
                    current_stage_id TEXT NOT NULL,
                    iteration_count INTEGER NOT NULL DEFAULT 1,
                    selected_model_ids TEXT NOT NULL DEFAULT '[]',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS session_status_history (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                    from_status TEXT NOT NULL,
                    to_status TEXT NOT NULL,
                    stage_slug TEXT NOT NULL,
                    changed_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS jobs (
                    id TEXT PRIMARY KEY,
                    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                    stage_slug TEXT NOT NULL,
                    iteration_number INTEGER NOT NULL,
                    step_key TEXT,
                    job_type TEXT NOT NULL,
                    status TEXT NOT NULL,
                    parent_job_id TEXT REFERENCES jobs(id),
                    prerequisite_job_id TEXT REFERENCES jobs(id),
                    attempt_count INTEGER NOT NULL DEFAULT 0,
                    max_retries INTEGER NOT NULL DEFAULT 3,
                    payload TEXT NOT NULL DEFAULT '{}',
                    results TEXT,
                    error_details TEXT,
                    created_at TEXT NOT NULL,
                    started_at TEXT,
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS session_recipe_steps (
                    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                    stage_slug TEXT NOT NULL,
                    position INTEGER NOT NULL,
                    step_key TEXT NOT NULL,
                    job_type TEXT NOT NULL,
                    cardinality TEXT NOT NULL DEFAULT 'single',
                    document_key TEXT,
                    PRIMARY KEY (session_id, stage_slug, step_key)
                );

                CREATE TABLE IF NOT EXISTS job_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_id TEXT NOT NULL REFERENCES jobs(id),
                    session_id TEXT NOT NULL,
                    stage_slug TEXT NOT NULL,
                    iteration_number INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    processed_at TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_jobs_scope ON jobs(session_id, iteration_number, stage_slug);
                CREATE INDEX IF NOT EXISTS idx_jobs_prerequisite ON jobs(prerequisite_job_id, status);
                CREATE INDEX IF NOT EXISTS idx_session_history ON session_status_history(session_id);
                CREATE INDEX IF NOT EXISTS idx_job_events_unprocessed ON job_events(processed_at, id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    /// Raw connection for composing table functions outside a transaction.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Start a write transaction. `IMMEDIATE` takes the write lock up front
    /// so read-then-CAS sequences cannot interleave with another process.
    pub fn write_tx(&self) -> Result<Transaction<'_>> {
        Ok(Transaction::new_unchecked(
            &self.conn,
            TransactionBehavior::Immediate,
        )?)
    }

    /// Start a read transaction; all reads inside see one snapshot.
    pub fn read_tx(&self) -> Result<Transaction<'_>> {
        Ok(Transaction::new_unchecked(
            &self.conn,
            TransactionBehavior::Deferred,
        )?)
    }
}

pub(crate) fn now() -> DateTime<Utc> {
    Utc::now()
}

pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("invalid timestamp in database: '{}'", raw))?;
    Ok(parsed.with_timezone(&Utc))
}

pub(crate) fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_database_and_run_migrations() -> anyhow::Result<()> {
        let db = OrchestratorDb::new_in_memory()?;

        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN \
             ('sessions', 'session_status_history', 'jobs', 'session_recipe_steps', 'job_events')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 5, "Expected 5 tables to exist");

        let index_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='index' AND name IN \
             ('idx_jobs_scope', 'idx_jobs_prerequisite')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(index_count, 2);
        Ok(())
    }

    #[test]
    fn test_migrations_are_idempotent() -> anyhow::Result<()> {
        let db = OrchestratorDb::new_in_memory()?;
        db.run_migrations()?;
        db.run_migrations()?;
        Ok(())
    }

    #[test]
    fn test_file_database_reopens() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("jobs.db");
        {
            let db = OrchestratorDb::new(&path)?;
            db.create_session(&crate::recipe::Pipeline::default(), &[])?;
        }
        let db = OrchestratorDb::new(&path)?;
        let count: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
        assert_eq!(count, 1);
        Ok(())
    }

    #[test]
    fn test_timestamp_roundtrip() -> anyhow::Result<()> {
        let ts = now();
        let parsed = parse_ts(&format_ts(&ts))?;
        assert_eq!(parsed.timestamp_micros(), ts.timestamp_micros());
        assert!(parse_ts("yesterday").is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_handle_runs_on_blocking_pool() -> anyhow::Result<()> {
        let handle = DbHandle::new(OrchestratorDb::new_in_memory()?);
        let session = handle
            .call(|db| db.create_session(&crate::recipe::Pipeline::default(), &[]))
            .await?;
        let fetched = handle
            .call(move |db| db.get_session(&session.id))
            .await?;
        assert_eq!(fetched.current_stage_id, "thesis");
        Ok(())
    }
}
