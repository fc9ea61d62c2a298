//! The five-layer resource model: thread → session → terminal → lease →
//! instance. Each layer is keyed by its own id and references downward
//! only; upward lookups go through indexed queries, never in-memory cycles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::config::SessionPolicyConfig;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lease state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where the lease should be. Set by the resolver and session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    Active,
    Paused,
    Destroyed,
}

/// Where the provider last told us the instance actually is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservedState {
    Unknown,
    Provisioning,
    Active,
    Paused,
    Destroyed,
    Error,
}

impl DesiredState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Destroyed => "destroyed",
        }
    }
}

impl ObservedState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Provisioning => "provisioning",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Destroyed => "destroyed",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for DesiredState {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "destroyed" => Ok(Self::Destroyed),
            other => Err(crate::Error::Corruption(format!("unknown desired state: {other}"))),
        }
    }
}

impl std::str::FromStr for ObservedState {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(Self::Unknown),
            "provisioning" => Ok(Self::Provisioning),
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "destroyed" => Ok(Self::Destroyed),
            "error" => Ok(Self::Error),
            other => Err(crate::Error::Corruption(format!("unknown observed state: {other}"))),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lifecycle envelope inside a thread, holding the policy under which
/// physical compute may be used. At most one active session per thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub session_id: uuid::Uuid,
    pub thread_id: String,
    pub active: bool,
    pub idle_ttl_secs: u64,
    pub max_wall_secs: u64,
    pub max_cost_usd: f64,
    pub default_cwd: PathBuf,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl ChatSession {
    pub fn with_policy(thread_id: impl Into<String>, policy: &SessionPolicyConfig) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4(),
            thread_id: thread_id.into(),
            active: true,
            idle_ttl_secs: policy.idle_ttl_secs,
            max_wall_secs: policy.max_wall_secs,
            max_cost_usd: policy.max_cost_usd,
            default_cwd: policy.default_cwd.clone(),
            created_at: Utc::now(),
            ended_at: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Abstract terminal
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Logical shell identity bound to a session. Survives physical-runtime
/// restart; `version` bumps on any mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbstractTerminal {
    pub terminal_id: uuid::Uuid,
    pub session_id: uuid::Uuid,
    pub cwd: PathBuf,
    /// Environment changes relative to the sandbox baseline. BTreeMap so
    /// the persisted JSON is stable across hydrate/persist cycles.
    pub env_delta: BTreeMap<String, String>,
    pub version: u64,
    /// Bounded shell history, newest last.
    #[serde(default)]
    pub history: Vec<String>,
    /// Opaque provider hydration blob carried across physical restarts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hydration: Option<serde_json::Value>,
    pub updated_at: DateTime<Utc>,
}

impl AbstractTerminal {
    pub fn new(session_id: uuid::Uuid, cwd: PathBuf) -> Self {
        Self {
            terminal_id: uuid::Uuid::new_v4(),
            session_id,
            cwd,
            env_delta: BTreeMap::new(),
            version: 0,
            history: Vec::new(),
            hydration: None,
            updated_at: Utc::now(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lease
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A session's reservation of a sandbox instance. The reconciler drives
/// `observed_state` toward `desired_state`; the instance itself is
/// referenced by id only (its lifetime is provider-managed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxLease {
    pub lease_id: uuid::Uuid,
    pub session_id: uuid::Uuid,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    pub desired_state: DesiredState,
    pub observed_state: ObservedState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SandboxLease {
    pub fn new(session_id: uuid::Uuid, provider: impl Into<String>) -> Self {
        Self {
            lease_id: uuid::Uuid::new_v4(),
            session_id,
            provider: provider.into(),
            instance_id: None,
            desired_state: DesiredState::Active,
            observed_state: ObservedState::Unknown,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    /// A quiesced lease either matches its desire or is parked in `error`
    /// with `last_error` set.
    pub fn converged(&self) -> bool {
        self.observed_state == ObservedState::Error
            || match self.desired_state {
                DesiredState::Active => self.observed_state == ObservedState::Active,
                DesiredState::Paused => self.observed_state == ObservedState::Paused,
                DesiredState::Destroyed => self.observed_state == ObservedState::Destroyed,
            }
    }
}

/// One reconcile step, surfaced through the operator view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseEvent {
    pub lease_id: uuid::Uuid,
    pub provider: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn lease_starts_unknown() {
        let lease = SandboxLease::new(uuid::Uuid::new_v4(), "mem");
        assert_eq!(lease.desired_state, DesiredState::Active);
        assert_eq!(lease.observed_state, ObservedState::Unknown);
        assert!(!lease.converged());
    }

    #[test]
    fn converged_on_match_or_error() {
        let mut lease = SandboxLease::new(uuid::Uuid::new_v4(), "mem");
        lease.observed_state = ObservedState::Active;
        assert!(lease.converged());

        lease.desired_state = DesiredState::Paused;
        assert!(!lease.converged());

        lease.observed_state = ObservedState::Error;
        lease.last_error = Some("create failed".into());
        assert!(lease.converged());
    }

    #[test]
    fn state_strings_roundtrip() {
        for s in [
            ObservedState::Unknown,
            ObservedState::Provisioning,
            ObservedState::Active,
            ObservedState::Paused,
            ObservedState::Destroyed,
            ObservedState::Error,
        ] {
            assert_eq!(ObservedState::from_str(s.as_str()).unwrap(), s);
        }
        for s in [DesiredState::Active, DesiredState::Paused, DesiredState::Destroyed] {
            assert_eq!(DesiredState::from_str(s.as_str()).unwrap(), s);
        }
    }

    #[test]
    fn terminal_starts_at_version_zero() {
        let t = AbstractTerminal::new(uuid::Uuid::new_v4(), PathBuf::from("/workspace"));
        assert_eq!(t.version, 0);
        assert!(t.env_delta.is_empty());
        assert!(t.history.is_empty());
    }
}
