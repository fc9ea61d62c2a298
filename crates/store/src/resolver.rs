//! Persistence for the resolver's session / terminal / lease layers.
//!
//! Every layer is its own table keyed by its own id with references
//! downward only; the reconciler and the resolution chain read these rows
//! rather than holding in-memory object graphs.

use chrono::Utc;
use rusqlite::OptionalExtension;
use std::str::FromStr;

use leon_domain::resolver::{
    AbstractTerminal, ChatSession, DesiredState, LeaseEvent, ObservedState, SandboxLease,
};
use leon_domain::Result;

use crate::db::Database;
use crate::runs::parse_ts;

pub struct ResolverStore {
    db: Database,
}

impl ResolverStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    // ── Sessions ───────────────────────────────────────────────────

    pub fn create_session(&self, session: &ChatSession) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chat_sessions
                     (session_id, thread_id, active, idle_ttl_secs, max_wall_secs, max_cost_usd,
                      default_cwd, created_at, ended_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    session.session_id.to_string(),
                    session.thread_id,
                    session.active,
                    session.idle_ttl_secs as i64,
                    session.max_wall_secs as i64,
                    session.max_cost_usd,
                    session.default_cwd.to_string_lossy(),
                    session.created_at.to_rfc3339(),
                    session.ended_at.map(|t| t.to_rfc3339()),
                ],
            )?;
            Ok(())
        })
    }

    pub fn active_session(&self, thread_id: &str) -> Result<Option<ChatSession>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT session_id, thread_id, active, idle_ttl_secs, max_wall_secs, max_cost_usd,
                        default_cwd, created_at, ended_at
                 FROM chat_sessions WHERE thread_id = ?1 AND active = 1
                 ORDER BY created_at DESC LIMIT 1",
                [thread_id],
                row_to_session,
            )
            .optional()
        })
    }

    /// Every session ever linked to the thread (active or not); thread
    /// delete walks this to destroy instances the in-memory manager may
    /// have lost track of.
    pub fn sessions_for_thread(&self, thread_id: &str) -> Result<Vec<ChatSession>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, thread_id, active, idle_ttl_secs, max_wall_secs, max_cost_usd,
                        default_cwd, created_at, ended_at
                 FROM chat_sessions WHERE thread_id = ?1 ORDER BY created_at",
            )?;
            let rows = stmt.query_map([thread_id], row_to_session)?;
            rows.collect()
        })
    }

    pub fn end_session(&self, session_id: uuid::Uuid) -> Result<bool> {
        let updated = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE chat_sessions SET active = 0, ended_at = ?2
                 WHERE session_id = ?1 AND active = 1",
                rusqlite::params![session_id.to_string(), Utc::now().to_rfc3339()],
            )
        })?;
        Ok(updated > 0)
    }

    // ── Terminals ──────────────────────────────────────────────────

    pub fn create_terminal(&self, terminal: &AbstractTerminal) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO terminals
                     (terminal_id, session_id, cwd, env_delta, version, history, hydration, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    terminal.terminal_id.to_string(),
                    terminal.session_id.to_string(),
                    terminal.cwd.to_string_lossy(),
                    serde_json::to_string(&terminal.env_delta).unwrap_or_else(|_| "{}".into()),
                    terminal.version as i64,
                    serde_json::to_string(&terminal.history).unwrap_or_else(|_| "[]".into()),
                    terminal.hydration.as_ref().map(|h| h.to_string()),
                    terminal.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn terminal_for_session(&self, session_id: uuid::Uuid) -> Result<Option<AbstractTerminal>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT terminal_id, session_id, cwd, env_delta, version, history, hydration, updated_at
                 FROM terminals WHERE session_id = ?1 LIMIT 1",
                [session_id.to_string()],
                row_to_terminal,
            )
            .optional()
        })
    }

    /// Persist a detached physical runtime's state back onto the abstract
    /// terminal row.
    pub fn persist_terminal(&self, terminal: &AbstractTerminal) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE terminals SET cwd = ?2, env_delta = ?3, version = ?4, history = ?5,
                     hydration = ?6, updated_at = ?7
                 WHERE terminal_id = ?1",
                rusqlite::params![
                    terminal.terminal_id.to_string(),
                    terminal.cwd.to_string_lossy(),
                    serde_json::to_string(&terminal.env_delta).unwrap_or_else(|_| "{}".into()),
                    terminal.version as i64,
                    serde_json::to_string(&terminal.history).unwrap_or_else(|_| "[]".into()),
                    terminal.hydration.as_ref().map(|h| h.to_string()),
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    // ── Leases ─────────────────────────────────────────────────────

    pub fn create_lease(&self, lease: &SandboxLease) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO leases
                     (lease_id, session_id, provider, instance_id, desired_state, observed_state,
                      last_error, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    lease.lease_id.to_string(),
                    lease.session_id.to_string(),
                    lease.provider,
                    lease.instance_id,
                    lease.desired_state.as_str(),
                    lease.observed_state.as_str(),
                    lease.last_error,
                    lease.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_lease(&self, lease_id: uuid::Uuid) -> Result<Option<SandboxLease>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT lease_id, session_id, provider, instance_id, desired_state, observed_state,
                        last_error, updated_at
                 FROM leases WHERE lease_id = ?1",
                [lease_id.to_string()],
                row_to_lease,
            )
            .optional()
        })
    }

    pub fn lease_for_session(&self, session_id: uuid::Uuid) -> Result<Option<SandboxLease>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT lease_id, session_id, provider, instance_id, desired_state, observed_state,
                        last_error, updated_at
                 FROM leases WHERE session_id = ?1 LIMIT 1",
                [session_id.to_string()],
                row_to_lease,
            )
            .optional()
        })
    }

    pub fn list_leases(&self) -> Result<Vec<SandboxLease>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT lease_id, session_id, provider, instance_id, desired_state, observed_state,
                        last_error, updated_at
                 FROM leases ORDER BY updated_at DESC",
            )?;
            let rows = stmt.query_map([], row_to_lease)?;
            rows.collect()
        })
    }

    /// Write back the reconciler's view of a lease.
    pub fn update_lease(&self, lease: &SandboxLease) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE leases SET instance_id = ?2, desired_state = ?3, observed_state = ?4,
                     last_error = ?5, updated_at = ?6
                 WHERE lease_id = ?1",
                rusqlite::params![
                    lease.lease_id.to_string(),
                    lease.instance_id,
                    lease.desired_state.as_str(),
                    lease.observed_state.as_str(),
                    lease.last_error,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    /// Set only the desired state (resolver-side intent change).
    pub fn set_desired(&self, lease_id: uuid::Uuid, desired: DesiredState) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE leases SET desired_state = ?2, updated_at = ?3 WHERE lease_id = ?1",
                rusqlite::params![lease_id.to_string(), desired.as_str(), Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    /// Instance ids currently referenced by any lease of a provider, for
    /// the orphan join.
    pub fn leased_instance_ids(&self, provider: &str) -> Result<Vec<String>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT instance_id FROM leases
                 WHERE provider = ?1 AND instance_id IS NOT NULL",
            )?;
            let rows = stmt.query_map([provider], |row| row.get(0))?;
            rows.collect()
        })
    }

    // ── Lease events ───────────────────────────────────────────────

    pub fn record_lease_event(&self, event: &LeaseEvent) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO lease_events (lease_id, provider, event_type, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    event.lease_id.to_string(),
                    event.provider,
                    event.event_type,
                    event.payload.to_string(),
                    event.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn lease_events(&self, lease_id: uuid::Uuid, limit: usize) -> Result<Vec<LeaseEvent>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT lease_id, provider, event_type, payload, created_at
                 FROM lease_events WHERE lease_id = ?1
                 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(
                rusqlite::params![lease_id.to_string(), limit as i64],
                |row| {
                    let lease_id: String = row.get(0)?;
                    let payload: String = row.get(3)?;
                    Ok(LeaseEvent {
                        lease_id: uuid::Uuid::parse_str(&lease_id).unwrap_or_default(),
                        provider: row.get(1)?,
                        event_type: row.get(2)?,
                        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
                        created_at: parse_ts(row.get::<_, String>(4)?),
                    })
                },
            )?;
            rows.collect()
        })
    }
}

// ── Row mappers ─────────────────────────────────────────────────────

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatSession> {
    let session_id: String = row.get(0)?;
    let cwd: String = row.get(6)?;
    Ok(ChatSession {
        session_id: uuid::Uuid::parse_str(&session_id).unwrap_or_default(),
        thread_id: row.get(1)?,
        active: row.get(2)?,
        idle_ttl_secs: row.get::<_, i64>(3)?.max(0) as u64,
        max_wall_secs: row.get::<_, i64>(4)?.max(0) as u64,
        max_cost_usd: row.get(5)?,
        default_cwd: cwd.into(),
        created_at: parse_ts(row.get::<_, String>(7)?),
        ended_at: row.get::<_, Option<String>>(8)?.map(parse_ts),
    })
}

fn row_to_terminal(row: &rusqlite::Row<'_>) -> rusqlite::Result<AbstractTerminal> {
    let terminal_id: String = row.get(0)?;
    let session_id: String = row.get(1)?;
    let cwd: String = row.get(2)?;
    let env_delta: String = row.get(3)?;
    let history: String = row.get(5)?;
    let hydration: Option<String> = row.get(6)?;
    Ok(AbstractTerminal {
        terminal_id: uuid::Uuid::parse_str(&terminal_id).unwrap_or_default(),
        session_id: uuid::Uuid::parse_str(&session_id).unwrap_or_default(),
        cwd: cwd.into(),
        env_delta: serde_json::from_str(&env_delta).unwrap_or_default(),
        version: row.get::<_, i64>(4)?.max(0) as u64,
        history: serde_json::from_str(&history).unwrap_or_default(),
        hydration: hydration.and_then(|h| serde_json::from_str(&h).ok()),
        updated_at: parse_ts(row.get::<_, String>(7)?),
    })
}

fn row_to_lease(row: &rusqlite::Row<'_>) -> rusqlite::Result<SandboxLease> {
    let lease_id: String = row.get(0)?;
    let session_id: String = row.get(1)?;
    let desired: String = row.get(4)?;
    let observed: String = row.get(5)?;
    Ok(SandboxLease {
        lease_id: uuid::Uuid::parse_str(&lease_id).unwrap_or_default(),
        session_id: uuid::Uuid::parse_str(&session_id).unwrap_or_default(),
        provider: row.get(2)?,
        instance_id: row.get(3)?,
        desired_state: DesiredState::from_str(&desired).unwrap_or(DesiredState::Destroyed),
        observed_state: ObservedState::from_str(&observed).unwrap_or(ObservedState::Unknown),
        last_error: row.get(6)?,
        updated_at: parse_ts(row.get::<_, String>(7)?),
    })
}
