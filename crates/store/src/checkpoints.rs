//! Checkpoint store — snapshots of a thread's message history and agent
//! graph state, with parent links for time-travel reads.
//!
//! The runtime consumes only the [`CheckpointStore`] trait; this crate
//! ships the sqlite implementation the binary wires in. Checkpoints are
//! the source of truth for messages (run events are a projection).

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};

use leon_domain::message::Message;
use leon_domain::{Error, Result};

use crate::db::Database;
use crate::runs::parse_ts;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lookup key: a thread, optionally pinned to one checkpoint for
/// time-travel reads. With no `checkpoint_id`, `get` returns the latest.
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    pub thread_id: String,
    pub checkpoint_id: Option<String>,
}

impl CheckpointConfig {
    pub fn latest(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            checkpoint_id: None,
        }
    }

    pub fn at(thread_id: impl Into<String>, checkpoint_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            checkpoint_id: Some(checkpoint_id.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub messages: Vec<Message>,
    pub graph_state: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// A new checkpoint chained onto `parent_id`.
    pub fn next(parent_id: Option<String>, messages: Vec<Message>, graph_state: serde_json::Value) -> Self {
        Self {
            checkpoint_id: format!("ck_{}", uuid::Uuid::new_v4().simple()),
            parent_id,
            messages,
            graph_state,
            created_at: Utc::now(),
        }
    }
}

pub trait CheckpointStore: Send + Sync {
    fn get(&self, config: &CheckpointConfig) -> Result<Option<Checkpoint>>;
    fn put(&self, config: &CheckpointConfig, checkpoint: Checkpoint, metadata: serde_json::Value)
        -> Result<()>;
    fn list(&self, config: &CheckpointConfig) -> Result<Vec<Checkpoint>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sqlite implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SqliteCheckpointStore {
    db: Database,
}

impl SqliteCheckpointStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn get(&self, config: &CheckpointConfig) -> Result<Option<Checkpoint>> {
        let row = match &config.checkpoint_id {
            Some(id) => self.db.with_conn(|conn| {
                conn.query_row(
                    "SELECT checkpoint_id, parent_id, messages, graph_state, created_at
                     FROM checkpoints WHERE thread_id = ?1 AND checkpoint_id = ?2",
                    rusqlite::params![config.thread_id, id],
                    row_to_raw,
                )
                .optional()
            })?,
            None => self.db.with_conn(|conn| {
                conn.query_row(
                    "SELECT checkpoint_id, parent_id, messages, graph_state, created_at
                     FROM checkpoints WHERE thread_id = ?1
                     ORDER BY created_at DESC, checkpoint_id DESC LIMIT 1",
                    [&config.thread_id],
                    row_to_raw,
                )
                .optional()
            })?,
        };
        row.map(decode).transpose()
    }

    fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: serde_json::Value,
    ) -> Result<()> {
        let messages = serde_json::to_string(&checkpoint.messages)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO checkpoints
                     (checkpoint_id, thread_id, parent_id, messages, graph_state, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    checkpoint.checkpoint_id,
                    config.thread_id,
                    checkpoint.parent_id,
                    messages,
                    checkpoint.graph_state.to_string(),
                    metadata.to_string(),
                    checkpoint.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    fn list(&self, config: &CheckpointConfig) -> Result<Vec<Checkpoint>> {
        let raws = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT checkpoint_id, parent_id, messages, graph_state, created_at
                 FROM checkpoints WHERE thread_id = ?1 ORDER BY created_at DESC, checkpoint_id DESC",
            )?;
            let rows = stmt.query_map([&config.thread_id], row_to_raw)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        raws.into_iter().map(decode).collect()
    }
}

struct RawCheckpoint {
    checkpoint_id: String,
    parent_id: Option<String>,
    messages: String,
    graph_state: String,
    created_at: String,
}

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawCheckpoint> {
    Ok(RawCheckpoint {
        checkpoint_id: row.get(0)?,
        parent_id: row.get(1)?,
        messages: row.get(2)?,
        graph_state: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn decode(raw: RawCheckpoint) -> Result<Checkpoint> {
    let messages: Vec<Message> = serde_json::from_str(&raw.messages)
        .map_err(|e| Error::Corruption(format!("checkpoint {}: {e}", raw.checkpoint_id)))?;
    let graph_state = serde_json::from_str(&raw.graph_state)
        .map_err(|e| Error::Corruption(format!("checkpoint {}: {e}", raw.checkpoint_id)))?;
    Ok(Checkpoint {
        checkpoint_id: raw.checkpoint_id,
        parent_id: raw.parent_id,
        messages,
        graph_state,
        created_at: parse_ts(raw.created_at),
    })
}
