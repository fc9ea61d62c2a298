//! Run records — one row per agent-loop execution.

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use std::str::FromStr;

use leon_domain::event::{Run, RunStatus};
use leon_domain::Result;

use crate::db::Database;

pub struct RunStore {
    db: Database,
}

impl RunStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn insert(&self, run: &Run) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO runs
                     (run_id, thread_id, input_message, status, error_text, started_at, finished_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    run.run_id.to_string(),
                    run.thread_id,
                    run.input_message,
                    run.status.as_str(),
                    run.error_text,
                    run.started_at.to_rfc3339(),
                    run.finished_at.map(|t| t.to_rfc3339()),
                ],
            )?;
            Ok(())
        })
    }

    /// Finish a run, but never overwrite a status that is already terminal
    /// (the cancel watchdog and the producer may race here).
    pub fn finish(&self, run_id: uuid::Uuid, status: RunStatus, error_text: Option<&str>) -> Result<bool> {
        let updated = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE runs SET status = ?2, error_text = ?3, finished_at = ?4
                 WHERE run_id = ?1 AND status = 'running'",
                rusqlite::params![
                    run_id.to_string(),
                    status.as_str(),
                    error_text,
                    Utc::now().to_rfc3339(),
                ],
            )
        })?;
        Ok(updated > 0)
    }

    pub fn get(&self, run_id: uuid::Uuid) -> Result<Option<Run>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT run_id, thread_id, input_message, status, error_text, started_at, finished_at
                 FROM runs WHERE run_id = ?1",
                [run_id.to_string()],
                row_to_run,
            )
            .optional()
        })
    }

    pub fn latest_for_thread(&self, thread_id: &str) -> Result<Option<Run>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT run_id, thread_id, input_message, status, error_text, started_at, finished_at
                 FROM runs WHERE thread_id = ?1
                 ORDER BY started_at DESC, run_id DESC LIMIT 1",
                [thread_id],
                row_to_run,
            )
            .optional()
        })
    }

    pub fn active_for_thread(&self, thread_id: &str) -> Result<Option<Run>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT run_id, thread_id, input_message, status, error_text, started_at, finished_at
                 FROM runs WHERE thread_id = ?1 AND status = 'running'
                 ORDER BY started_at DESC LIMIT 1",
                [thread_id],
                row_to_run,
            )
            .optional()
        })
    }

    pub fn list_for_thread(&self, thread_id: &str) -> Result<Vec<Run>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT run_id, thread_id, input_message, status, error_text, started_at, finished_at
                 FROM runs WHERE thread_id = ?1 ORDER BY started_at DESC",
            )?;
            let rows = stmt.query_map([thread_id], row_to_run)?;
            rows.collect()
        })
    }

    /// Runs still marked running after a process restart can never finish;
    /// fail them so threads are not wedged in `AlreadyRunning`.
    pub fn fail_stale_running(&self) -> Result<usize> {
        let updated = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE runs SET status = 'error', error_text = 'interrupted by restart',
                     finished_at = ?1
                 WHERE status = 'running'",
                [Utc::now().to_rfc3339()],
            )
        })?;
        if updated > 0 {
            tracing::warn!(runs = updated, "failed stale running runs from previous process");
        }
        Ok(updated)
    }
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    let run_id: String = row.get(0)?;
    let status: String = row.get(3)?;
    Ok(Run {
        run_id: uuid::Uuid::parse_str(&run_id).unwrap_or_default(),
        thread_id: row.get(1)?,
        input_message: row.get(2)?,
        status: RunStatus::from_str(&status).unwrap_or(RunStatus::Error),
        error_text: row.get(4)?,
        started_at: parse_ts(row.get::<_, String>(5)?),
        finished_at: row.get::<_, Option<String>>(6)?.map(parse_ts),
    })
}

/// Parse an RFC 3339 timestamp column; rows we wrote always parse, so a
/// malformed value degrades to the epoch rather than failing the query.
pub(crate) fn parse_ts(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> RunStore {
        RunStore::new(Database::open_in_memory().unwrap())
    }

    #[test]
    fn insert_and_get_roundtrip() {
        let store = store();
        let run = Run::new("t1", "hello");
        store.insert(&run).unwrap();

        let got = store.get(run.run_id).unwrap().unwrap();
        assert_eq!(got.thread_id, "t1");
        assert_eq!(got.input_message, "hello");
        assert_eq!(got.status, RunStatus::Running);
        assert!(got.finished_at.is_none());
    }

    #[test]
    fn finish_sets_terminal_once() {
        let store = store();
        let run = Run::new("t1", "hello");
        store.insert(&run).unwrap();

        assert!(store.finish(run.run_id, RunStatus::Done, None).unwrap());
        // Second finish (e.g. cancel racing done) is a no-op.
        assert!(!store
            .finish(run.run_id, RunStatus::Cancelled, None)
            .unwrap());

        let got = store.get(run.run_id).unwrap().unwrap();
        assert_eq!(got.status, RunStatus::Done);
        assert!(got.finished_at.is_some());
    }

    #[test]
    fn active_and_latest_for_thread() {
        let store = store();
        let first = Run::new("t1", "one");
        store.insert(&first).unwrap();
        store.finish(first.run_id, RunStatus::Done, None).unwrap();

        let second = Run::new("t1", "two");
        store.insert(&second).unwrap();

        let active = store.active_for_thread("t1").unwrap().unwrap();
        assert_eq!(active.run_id, second.run_id);

        let latest = store.latest_for_thread("t1").unwrap().unwrap();
        assert_eq!(latest.run_id, second.run_id);

        assert!(store.active_for_thread("t2").unwrap().is_none());
    }

    #[test]
    fn fail_stale_running_clears_active() {
        let store = store();
        let run = Run::new("t1", "interrupted");
        store.insert(&run).unwrap();

        assert_eq!(store.fail_stale_running().unwrap(), 1);
        let got = store.get(run.run_id).unwrap().unwrap();
        assert_eq!(got.status, RunStatus::Error);
        assert_eq!(got.error_text.as_deref(), Some("interrupted by restart"));
    }

    #[test]
    fn list_orders_newest_first() {
        let store = store();
        for msg in ["a", "b"] {
            let mut run = Run::new("t1", msg);
            // Force distinct started_at ordering.
            run.started_at = Utc::now()
                + chrono::Duration::milliseconds(if msg == "b" { 10 } else { 0 });
            store.insert(&run).unwrap();
        }
        let runs = store.list_for_thread("t1").unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].input_message, "b");
    }
}
