//! Per-thread message queue — the mailbox behind the queue router.
//!
//! Messages are strictly FIFO within a thread. The routing mode chosen at
//! enqueue time is recorded on the row so the operator view (and the
//! idle-drain hook) can see why a message waited.

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use leon_domain::Result;

use crate::db::Database;
use crate::runs::parse_ts;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Routing mode
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How the router decided to handle an inbound message, chosen from the
/// supervisor's state machine at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    /// Dispatched as a new run immediately.
    Immediate,
    /// Queued; drained when the supervisor next enters idle.
    Followup,
    /// Queued while a run was in flight with steering disabled.
    Collect,
    /// Injected into the live run's next model call.
    Steer,
    /// Cancelled the running run, then dispatched immediately.
    Interrupt,
    /// Stored while the thread was suspended; surfaced to the operator.
    SteerBacklog,
    /// Injected by a sub-agent; drained as a notice, not a run.
    TaskNotification,
}

impl RoutingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::Followup => "followup",
            Self::Collect => "collect",
            Self::Steer => "steer",
            Self::Interrupt => "interrupt",
            Self::SteerBacklog => "steer_backlog",
            Self::TaskNotification => "task_notification",
        }
    }
}

impl FromStr for RoutingMode {
    type Err = leon_domain::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "immediate" => Ok(Self::Immediate),
            "followup" => Ok(Self::Followup),
            "collect" => Ok(Self::Collect),
            "steer" => Ok(Self::Steer),
            "interrupt" => Ok(Self::Interrupt),
            "steer_backlog" => Ok(Self::SteerBacklog),
            "task_notification" => Ok(Self::TaskNotification),
            other => Err(leon_domain::Error::Corruption(format!(
                "unknown routing mode: {other}"
            ))),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Queue store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: i64,
    pub thread_id: String,
    pub content: String,
    pub mode: RoutingMode,
    pub created_at: DateTime<Utc>,
}

pub struct QueueStore {
    db: Database,
}

impl QueueStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn enqueue(&self, thread_id: &str, content: &str, mode: RoutingMode) -> Result<QueuedMessage> {
        let created_at = Utc::now();
        let id = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO queued_messages (thread_id, content, mode, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![thread_id, content, mode.as_str(), created_at.to_rfc3339()],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        Ok(QueuedMessage {
            id,
            thread_id: thread_id.to_owned(),
            content: content.to_owned(),
            mode,
            created_at,
        })
    }

    /// Remove and return the FIFO head of the thread's queue.
    pub fn pop_head(&self, thread_id: &str) -> Result<Option<QueuedMessage>> {
        self.db.with_tx(|tx| {
            let head = tx
                .query_row(
                    "SELECT id, thread_id, content, mode, created_at
                     FROM queued_messages WHERE thread_id = ?1
                     ORDER BY id LIMIT 1",
                    [thread_id],
                    row_to_message,
                )
                .optional()?;
            if let Some(msg) = &head {
                tx.execute("DELETE FROM queued_messages WHERE id = ?1", [msg.id])?;
            }
            Ok(head)
        })
    }

    pub fn list(&self, thread_id: &str) -> Result<Vec<QueuedMessage>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, thread_id, content, mode, created_at
                 FROM queued_messages WHERE thread_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map([thread_id], row_to_message)?;
            rows.collect()
        })
    }

    /// Threads that still have queued messages (startup drain).
    pub fn threads_with_pending(&self) -> Result<Vec<String>> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT DISTINCT thread_id FROM queued_messages ORDER BY thread_id")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect()
        })
    }

    pub fn depth(&self, thread_id: &str) -> Result<usize> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM queued_messages WHERE thread_id = ?1",
                [thread_id],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        })
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueuedMessage> {
    let mode: String = row.get(3)?;
    Ok(QueuedMessage {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        content: row.get(2)?,
        mode: RoutingMode::from_str(&mode).unwrap_or(RoutingMode::Followup),
        created_at: parse_ts(row.get::<_, String>(4)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> QueueStore {
        QueueStore::new(Database::open_in_memory().unwrap())
    }

    #[test]
    fn fifo_within_thread() {
        let store = store();
        store.enqueue("t1", "first", RoutingMode::Followup).unwrap();
        store.enqueue("t1", "second", RoutingMode::Collect).unwrap();
        store.enqueue("t2", "other thread", RoutingMode::Followup).unwrap();

        assert_eq!(store.depth("t1").unwrap(), 2);

        let head = store.pop_head("t1").unwrap().unwrap();
        assert_eq!(head.content, "first");
        assert_eq!(head.mode, RoutingMode::Followup);

        let head = store.pop_head("t1").unwrap().unwrap();
        assert_eq!(head.content, "second");
        assert_eq!(head.mode, RoutingMode::Collect);

        assert!(store.pop_head("t1").unwrap().is_none());
        // Other thread untouched.
        assert_eq!(store.depth("t2").unwrap(), 1);
    }

    #[test]
    fn list_preserves_order_and_modes() {
        let store = store();
        store.enqueue("t1", "a", RoutingMode::Followup).unwrap();
        store.enqueue("t1", "b", RoutingMode::SteerBacklog).unwrap();

        let all = store.list("t1").unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].content, "a");
        assert_eq!(all[1].mode, RoutingMode::SteerBacklog);
    }

    #[test]
    fn pending_threads_are_distinct() {
        let store = store();
        store.enqueue("t1", "a", RoutingMode::Followup).unwrap();
        store.enqueue("t1", "b", RoutingMode::Followup).unwrap();
        store.enqueue("t2", "c", RoutingMode::Collect).unwrap();

        assert_eq!(
            store.threads_with_pending().unwrap(),
            vec!["t1".to_string(), "t2".to_string()]
        );
    }

    #[test]
    fn mode_strings_roundtrip() {
        for mode in [
            RoutingMode::Immediate,
            RoutingMode::Followup,
            RoutingMode::Collect,
            RoutingMode::Steer,
            RoutingMode::Interrupt,
            RoutingMode::SteerBacklog,
            RoutingMode::TaskNotification,
        ] {
            assert_eq!(RoutingMode::from_str(mode.as_str()).unwrap(), mode);
        }
    }
}
