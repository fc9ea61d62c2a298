//! Thread records — the durable conversation identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use leon_domain::Result;

use crate::db::Database;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub thread_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Sandbox provider name this thread's sessions lease from.
    pub sandbox_provider: String,
    /// Working directory for the thread's sessions; `None` falls back to
    /// the configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ThreadRecord {
    pub fn new(sandbox_provider: impl Into<String>) -> Self {
        Self {
            thread_id: format!("th_{}", uuid::Uuid::new_v4().simple()),
            title: None,
            agent: None,
            sandbox_provider: sandbox_provider.into(),
            cwd: None,
            created_at: Utc::now(),
        }
    }
}

pub struct ThreadStore {
    db: Database,
}

impl ThreadStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn create(&self, thread: &ThreadRecord) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO threads (thread_id, title, agent, sandbox_provider, cwd, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    thread.thread_id,
                    thread.title,
                    thread.agent,
                    thread.sandbox_provider,
                    thread.cwd,
                    thread.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get(&self, thread_id: &str) -> Result<Option<ThreadRecord>> {
        use rusqlite::OptionalExtension;
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT thread_id, title, agent, sandbox_provider, cwd, created_at
                 FROM threads WHERE thread_id = ?1",
                [thread_id],
                row_to_thread,
            )
            .optional()
        })
    }

    pub fn list(&self) -> Result<Vec<ThreadRecord>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT thread_id, title, agent, sandbox_provider, cwd, created_at
                 FROM threads ORDER BY created_at DESC",
            )?;
            let rows = stmt.query_map([], row_to_thread)?;
            rows.collect()
        })
    }

    pub fn exists(&self, thread_id: &str) -> Result<bool> {
        Ok(self.get(thread_id)?.is_some())
    }
}

fn row_to_thread(row: &rusqlite::Row<'_>) -> rusqlite::Result<ThreadRecord> {
    Ok(ThreadRecord {
        thread_id: row.get(0)?,
        title: row.get(1)?,
        agent: row.get(2)?,
        sandbox_provider: row.get(3)?,
        cwd: row.get(4)?,
        created_at: crate::runs::parse_ts(row.get::<_, String>(5)?),
    })
}
