//! The durable run-event log.
//!
//! Every event is appended here before it is published to the in-memory
//! ring, so the log is the sole source of truth after a restart or a
//! lagged subscriber. Append failure is fatal to the run.

use std::str::FromStr;

use leon_domain::event::{EventType, RunEvent};
use leon_domain::Result;

use crate::db::Database;
use crate::runs::parse_ts;

pub struct EventLog {
    db: Database,
}

impl EventLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append one event. The caller (the run's event buffer) has already
    /// assigned `evt.seq`; the unique `(thread_id, run_id, run_seq)` index
    /// rejects duplicates.
    pub fn append(&self, thread_id: &str, run_id: uuid::Uuid, evt: &RunEvent) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO run_events
                     (thread_id, run_id, run_seq, event_type, data, message_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    thread_id,
                    run_id.to_string(),
                    evt.seq as i64,
                    evt.event_type.as_str(),
                    evt.data.to_string(),
                    evt.message_id,
                    evt.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    /// Events with `seq > after_seq`, in order.
    pub fn replay(
        &self,
        thread_id: &str,
        run_id: uuid::Uuid,
        after_seq: u64,
    ) -> Result<Vec<RunEvent>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT run_seq, event_type, data, message_id, created_at
                 FROM run_events
                 WHERE thread_id = ?1 AND run_id = ?2 AND run_seq > ?3
                 ORDER BY run_seq",
            )?;
            let rows = stmt.query_map(
                rusqlite::params![thread_id, run_id.to_string(), after_seq as i64],
                row_to_event,
            )?;
            rows.collect()
        })
    }

    /// The highest seq appended for a run (0 when none).
    pub fn last_seq(&self, thread_id: &str, run_id: uuid::Uuid) -> Result<u64> {
        self.db.with_conn(|conn| {
            let seq: Option<i64> = conn.query_row(
                "SELECT MAX(run_seq) FROM run_events WHERE thread_id = ?1 AND run_id = ?2",
                rusqlite::params![thread_id, run_id.to_string()],
                |row| row.get(0),
            )?;
            Ok(seq.unwrap_or(0) as u64)
        })
    }

    /// Post-run retention: keep only the latest run's events for a thread.
    pub fn retain_only(&self, thread_id: &str, keep_run_id: uuid::Uuid) -> Result<usize> {
        let dropped = self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM run_events WHERE thread_id = ?1 AND run_id != ?2",
                rusqlite::params![thread_id, keep_run_id.to_string()],
            )
        })?;
        if dropped > 0 {
            tracing::debug!(thread_id, dropped, "dropped events of older runs");
        }
        Ok(dropped)
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunEvent> {
    let event_type: String = row.get(1)?;
    let data: String = row.get(2)?;
    Ok(RunEvent {
        seq: row.get::<_, i64>(0)? as u64,
        event_type: EventType::from_str(&event_type).unwrap_or(EventType::Status),
        data: serde_json::from_str(&data).unwrap_or(serde_json::Value::Null),
        message_id: row.get(3)?,
        created_at: parse_ts(row.get::<_, String>(4)?),
    })
}
