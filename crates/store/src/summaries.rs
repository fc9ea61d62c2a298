//! Summary store — compaction artifacts produced by the memory manager.
//!
//! At most one summary per thread is active; older rows are retained
//! inactive for audit. Reads and writes go through bounded retries with
//! jittered backoff because the summary store sits on the model-call hot
//! path and must ride out transient database contention.

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};

use leon_domain::Result;

use crate::db::Database;
use crate::retry::with_retries;
use crate::runs::parse_ts;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub summary_id: uuid::Uuid,
    pub thread_id: String,
    pub summary_text: String,
    /// Number of original messages the summary replaces.
    pub compact_up_to_index: usize,
    pub compacted_at: DateTime<Utc>,
    pub is_split_turn: bool,
    /// Token estimate of the summarized turn prefix, for split turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_turn_prefix: Option<u64>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Summary {
    pub fn new(thread_id: impl Into<String>, summary_text: impl Into<String>, compact_up_to_index: usize) -> Self {
        let now = Utc::now();
        Self {
            summary_id: uuid::Uuid::new_v4(),
            thread_id: thread_id.into(),
            summary_text: summary_text.into(),
            compact_up_to_index,
            compacted_at: now,
            is_split_turn: false,
            split_turn_prefix: None,
            is_active: true,
            created_at: now,
        }
    }

    /// A summary row is usable when its text is non-empty and its boundary
    /// index is sane; anything else is treated as corruption and rebuilt.
    pub fn is_valid(&self, history_len: usize) -> bool {
        !self.summary_text.trim().is_empty() && self.compact_up_to_index <= history_len
    }
}

pub struct SummaryStore {
    db: Database,
    retries: u32,
}

impl SummaryStore {
    pub fn new(db: Database, retries: u32) -> Self {
        Self { db, retries }
    }

    /// Persist a new active summary, deactivating any prior active row for
    /// the thread in the same transaction.
    pub async fn save(&self, summary: &Summary) -> Result<()> {
        let db = self.db.clone();
        let summary = summary.clone();
        with_retries("summary.save", self.retries, move || {
            db.with_tx(|tx| {
                tx.execute(
                    "UPDATE summaries SET is_active = 0
                     WHERE thread_id = ?1 AND is_active = 1",
                    [&summary.thread_id],
                )?;
                tx.execute(
                    "INSERT INTO summaries
                         (summary_id, thread_id, summary_text, compact_up_to_index, compacted_at,
                          is_split_turn, split_turn_prefix, is_active, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    rusqlite::params![
                        summary.summary_id.to_string(),
                        summary.thread_id,
                        summary.summary_text,
                        summary.compact_up_to_index as i64,
                        summary.compacted_at.to_rfc3339(),
                        summary.is_split_turn,
                        summary.split_turn_prefix.map(|t| t as i64),
                        summary.is_active,
                        summary.created_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
        })
        .await
    }

    /// The thread's active summary, if any.
    pub async fn load_active(&self, thread_id: &str) -> Result<Option<Summary>> {
        let db = self.db.clone();
        let thread_id = thread_id.to_owned();
        with_retries("summary.load", self.retries, move || {
            db.with_conn(|conn| {
                conn.query_row(
                    "SELECT summary_id, thread_id, summary_text, compact_up_to_index, compacted_at,
                            is_split_turn, split_turn_prefix, is_active, created_at
                     FROM summaries WHERE thread_id = ?1 AND is_active = 1
                     ORDER BY created_at DESC LIMIT 1",
                    [&thread_id],
                    row_to_summary,
                )
                .optional()
            })
        })
        .await
    }

    /// All summaries for a thread, newest first (audit view).
    pub fn list(&self, thread_id: &str) -> Result<Vec<Summary>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT summary_id, thread_id, summary_text, compact_up_to_index, compacted_at,
                        is_split_turn, split_turn_prefix, is_active, created_at
                 FROM summaries WHERE thread_id = ?1 ORDER BY created_at DESC",
            )?;
            let rows = stmt.query_map([thread_id], row_to_summary)?;
            rows.collect()
        })
    }
}

fn row_to_summary(row: &rusqlite::Row<'_>) -> rusqlite::Result<Summary> {
    let summary_id: String = row.get(0)?;
    Ok(Summary {
        summary_id: uuid::Uuid::parse_str(&summary_id).unwrap_or_default(),
        thread_id: row.get(1)?,
        summary_text: row.get(2)?,
        compact_up_to_index: row.get::<_, i64>(3)?.max(0) as usize,
        compacted_at: parse_ts(row.get::<_, String>(4)?),
        is_split_turn: row.get(5)?,
        split_turn_prefix: row.get::<_, Option<i64>>(6)?.map(|t| t.max(0) as u64),
        is_active: row.get(7)?,
        created_at: parse_ts(row.get::<_, String>(8)?),
    })
}
