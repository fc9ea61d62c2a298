use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use leon_domain::resolver::ObservedState;
use leon_domain::Result;

/// Creation parameters passed to a provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// Where the provider says an instance is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Provisioning,
    Active,
    Paused,
    Destroyed,
}

impl InstanceState {
    pub fn to_observed(self) -> ObservedState {
        match self {
            Self::Provisioning => ObservedState::Provisioning,
            Self::Active => ObservedState::Active,
            Self::Paused => ObservedState::Paused,
            Self::Destroyed => ObservedState::Destroyed,
        }
    }
}

/// Trait every sandbox provider adapter must implement.
///
/// The reconciler and resolver are the only callers, and never touch the
/// same instance concurrently. Calls that fail transiently are retried by
/// the reconciler with bounded backoff.
#[async_trait::async_trait]
pub trait SandboxProvider: Send + Sync {
    /// A stable provider name ("local", "docker", "remote", ...).
    fn name(&self) -> &str;

    /// Provision a new instance; returns its provider-scoped id.
    async fn create(&self, config: &SandboxConfig) -> Result<String>;

    async fn status(&self, instance_id: &str) -> Result<InstanceState>;

    async fn pause(&self, instance_id: &str) -> Result<()>;

    async fn resume(&self, instance_id: &str) -> Result<()>;

    async fn destroy(&self, instance_id: &str) -> Result<()>;

    /// Every live instance id the provider knows about, for orphan scans.
    async fn list_instances(&self) -> Result<Vec<String>>;
}
