//! Database handle and schema.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;

use leon_domain::{Error, Result};

/// Schema version (increment when changing table definitions).
pub const SCHEMA_VERSION: i32 = 1;

/// Shared handle to the embedded database.
///
/// rusqlite connections are not `Sync`, so the single connection lives
/// behind a mutex; WAL mode plus the 30 s busy timeout keep concurrent
/// store types from tripping over each other.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database file and initialize the schema.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(dir) = db_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Fatal(format!("opening {}: {e}", db_path.display())))?;
        Self::from_connection(conn)
    }

    /// An in-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Fatal(format!("opening in-memory db: {e}")))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").map_err(map_err)?;
        conn.pragma_update(None, "foreign_keys", "ON").map_err(map_err)?;
        conn.busy_timeout(std::time::Duration::from_secs(30))
            .map_err(map_err)?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Run a closure with the locked connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn).map_err(map_err)
    }

    /// Run a closure inside a transaction; rolls back on error.
    pub fn with_tx<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(map_err)?;
        let out = f(&tx).map_err(map_err)?;
        tx.commit().map_err(map_err)?;
        Ok(out)
    }

    fn init_schema(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS threads (
                    thread_id TEXT PRIMARY KEY,
                    title TEXT,
                    agent TEXT,
                    sandbox_provider TEXT NOT NULL,
                    cwd TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS runs (
                    run_id TEXT PRIMARY KEY,
                    thread_id TEXT NOT NULL,
                    input_message TEXT NOT NULL,
                    status TEXT NOT NULL,
                    error_text TEXT,
                    started_at TEXT NOT NULL,
                    finished_at TEXT
                );

                CREATE TABLE IF NOT EXISTS run_events (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    thread_id TEXT NOT NULL,
                    run_id TEXT NOT NULL,
                    run_seq INTEGER NOT NULL,
                    event_type TEXT NOT NULL,
                    data TEXT NOT NULL,
                    message_id TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS checkpoints (
                    checkpoint_id TEXT PRIMARY KEY,
                    thread_id TEXT NOT NULL,
                    parent_id TEXT,
                    messages TEXT NOT NULL,
                    graph_state TEXT NOT NULL,
                    metadata TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS summaries (
                    summary_id TEXT PRIMARY KEY,
                    thread_id TEXT NOT NULL,
                    summary_text TEXT NOT NULL,
                    compact_up_to_index INTEGER NOT NULL,
                    compacted_at TEXT NOT NULL,
                    is_split_turn INTEGER NOT NULL DEFAULT 0,
                    split_turn_prefix INTEGER,
                    is_active INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS queued_messages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    thread_id TEXT NOT NULL,
                    content TEXT NOT NULL,
                    mode TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS chat_sessions (
                    session_id TEXT PRIMARY KEY,
                    thread_id TEXT NOT NULL,
                    active INTEGER NOT NULL DEFAULT 1,
                    idle_ttl_secs INTEGER NOT NULL,
                    max_wall_secs INTEGER NOT NULL,
                    max_cost_usd REAL NOT NULL,
                    default_cwd TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    ended_at TEXT
                );

                CREATE TABLE IF NOT EXISTS terminals (
                    terminal_id TEXT PRIMARY KEY,
                    session_id TEXT NOT NULL,
                    cwd TEXT NOT NULL,
                    env_delta TEXT NOT NULL,
                    version INTEGER NOT NULL DEFAULT 0,
                    history TEXT NOT NULL,
                    hydration TEXT,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS leases (
                    lease_id TEXT PRIMARY KEY,
                    session_id TEXT NOT NULL,
                    provider TEXT NOT NULL,
                    instance_id TEXT,
                    desired_state TEXT NOT NULL,
                    observed_state TEXT NOT NULL,
                    last_error TEXT,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS lease_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    lease_id TEXT NOT NULL,
                    provider TEXT NOT NULL,
                    event_type TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE UNIQUE INDEX IF NOT EXISTS idx_events_thread_run_seq
                    ON run_events(thread_id, run_id, run_seq);
                CREATE INDEX IF NOT EXISTS idx_runs_thread ON runs(thread_id, started_at DESC);
                CREATE INDEX IF NOT EXISTS idx_checkpoints_thread
                    ON checkpoints(thread_id, created_at DESC);
                CREATE INDEX IF NOT EXISTS idx_summaries_thread ON summaries(thread_id, is_active);
                CREATE INDEX IF NOT EXISTS idx_queue_thread ON queued_messages(thread_id, id);
                CREATE INDEX IF NOT EXISTS idx_sessions_thread ON chat_sessions(thread_id, active);
                CREATE INDEX IF NOT EXISTS idx_terminals_session ON terminals(session_id);
                CREATE INDEX IF NOT EXISTS idx_leases_session ON leases(session_id);
                CREATE INDEX IF NOT EXISTS idx_lease_events_lease
                    ON lease_events(lease_id, id DESC);
                "#,
            )?;
            conn.execute(&format!("PRAGMA user_version = {SCHEMA_VERSION}"), [])?;
            Ok(())
        })
    }

    /// Drop every row owned by a thread, in dependency order. The only
    /// destructive cascade in the system.
    pub fn delete_thread(&self, thread_id: &str) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute("DELETE FROM runs WHERE thread_id = ?1", [thread_id])?;
            tx.execute("DELETE FROM run_events WHERE thread_id = ?1", [thread_id])?;
            tx.execute("DELETE FROM queued_messages WHERE thread_id = ?1", [thread_id])?;
            tx.execute("DELETE FROM summaries WHERE thread_id = ?1", [thread_id])?;
            tx.execute("DELETE FROM checkpoints WHERE thread_id = ?1", [thread_id])?;
            tx.execute(
                "DELETE FROM terminals WHERE session_id IN
                     (SELECT session_id FROM chat_sessions WHERE thread_id = ?1)",
                [thread_id],
            )?;
            tx.execute(
                "DELETE FROM lease_events WHERE lease_id IN
                     (SELECT lease_id FROM leases WHERE session_id IN
                         (SELECT session_id FROM chat_sessions WHERE thread_id = ?1))",
                [thread_id],
            )?;
            tx.execute(
                "DELETE FROM leases WHERE session_id IN
                     (SELECT session_id FROM chat_sessions WHERE thread_id = ?1)",
                [thread_id],
            )?;
            tx.execute("DELETE FROM chat_sessions WHERE thread_id = ?1", [thread_id])?;
            tx.execute("DELETE FROM threads WHERE thread_id = ?1", [thread_id])?;
            Ok(())
        })
    }
}

/// Map sqlite errors onto the runtime taxonomy: busy/locked are transient
/// (retryable with backoff), everything else is fatal to the operation.
pub(crate) fn map_err(e: rusqlite::Error) -> Error {
    match &e {
        rusqlite::Error::SqliteFailure(code, _)
            if matches!(
                code.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ) =>
        {
            Error::TransientUpstream(format!("database busy: {e}"))
        }
        _ => Error::Fatal(format!("database: {e}")),
    }
}
