//! In-memory sandbox provider for dev mode and tests.
//!
//! Instances are plain state entries; `create` returns an instance in
//! `Provisioning` which becomes `Active` on the next `status` poll, so the
//! reconciler's provisioning path is exercised end to end.

use std::collections::HashMap;

use parking_lot::Mutex;

use leon_domain::{Error, Result};

use crate::provider::{InstanceState, SandboxConfig, SandboxProvider};

pub struct MemSandboxProvider {
    name: String,
    instances: Mutex<HashMap<String, InstanceState>>,
    /// When set, the next call of each kind fails once (error-path tests).
    fail_next: Mutex<Option<String>>,
}

impl MemSandboxProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instances: Mutex::new(HashMap::new()),
            fail_next: Mutex::new(None),
        }
    }

    /// Arm a one-shot failure for the next provider call.
    pub fn fail_next(&self, message: impl Into<String>) {
        *self.fail_next.lock() = Some(message.into());
    }

    /// Create an instance outside any lease, simulating drift (orphans).
    pub fn create_detached(&self) -> String {
        let id = next_id(&self.name);
        self.instances.lock().insert(id.clone(), InstanceState::Active);
        id
    }

    pub fn instance_count(&self) -> usize {
        self.instances.lock().len()
    }

    fn take_failure(&self) -> Result<()> {
        if let Some(message) = self.fail_next.lock().take() {
            return Err(Error::TransientUpstream(message));
        }
        Ok(())
    }
}

fn next_id(provider: &str) -> String {
    format!("{provider}-{}", uuid::Uuid::new_v4().simple())
}

#[async_trait::async_trait]
impl SandboxProvider for MemSandboxProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create(&self, _config: &SandboxConfig) -> Result<String> {
        self.take_failure()?;
        let id = next_id(&self.name);
        self.instances
            .lock()
            .insert(id.clone(), InstanceState::Provisioning);
        Ok(id)
    }

    async fn status(&self, instance_id: &str) -> Result<InstanceState> {
        self.take_failure()?;
        let mut instances = self.instances.lock();
        match instances.get_mut(instance_id) {
            Some(state) => {
                if *state == InstanceState::Provisioning {
                    *state = InstanceState::Active;
                }
                Ok(*state)
            }
            None => Err(Error::NotFound(format!("instance {instance_id}"))),
        }
    }

    async fn pause(&self, instance_id: &str) -> Result<()> {
        self.take_failure()?;
        let mut instances = self.instances.lock();
        match instances.get_mut(instance_id) {
            Some(state) => {
                *state = InstanceState::Paused;
                Ok(())
            }
            None => Err(Error::NotFound(format!("instance {instance_id}"))),
        }
    }

    async fn resume(&self, instance_id: &str) -> Result<()> {
        self.take_failure()?;
        let mut instances = self.instances.lock();
        match instances.get_mut(instance_id) {
            Some(state) => {
                *state = InstanceState::Active;
                Ok(())
            }
            None => Err(Error::NotFound(format!("instance {instance_id}"))),
        }
    }

    async fn destroy(&self, instance_id: &str) -> Result<()> {
        self.take_failure()?;
        // Destroy is idempotent: a missing instance is already destroyed.
        self.instances.lock().remove(instance_id);
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<String>> {
        self.take_failure()?;
        Ok(self.instances.lock().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_provisioning_then_active() {
        let provider = MemSandboxProvider::new("mem");
        let id = provider.create(&SandboxConfig::default()).await.unwrap();
        assert_eq!(provider.status(&id).await.unwrap(), InstanceState::Active);
    }

    #[tokio::test]
    async fn pause_resume_destroy_cycle() {
        let provider = MemSandboxProvider::new("mem");
        let id = provider.create(&SandboxConfig::default()).await.unwrap();
        provider.status(&id).await.unwrap();

        provider.pause(&id).await.unwrap();
        assert_eq!(provider.status(&id).await.unwrap(), InstanceState::Paused);

        provider.resume(&id).await.unwrap();
        assert_eq!(provider.status(&id).await.unwrap(), InstanceState::Active);

        provider.destroy(&id).await.unwrap();
        assert!(provider.status(&id).await.is_err());
        // Idempotent destroy.
        provider.destroy(&id).await.unwrap();
    }

    #[tokio::test]
    async fn fail_next_fires_once() {
        let provider = MemSandboxProvider::new("mem");
        provider.fail_next("flaky");
        assert!(provider.create(&SandboxConfig::default()).await.is_err());
        assert!(provider.create(&SandboxConfig::default()).await.is_ok());
    }

    #[tokio::test]
    async fn detached_instances_are_listed() {
        let provider = MemSandboxProvider::new("mem");
        let id = provider.create_detached();
        assert_eq!(provider.list_instances().await.unwrap(), vec![id]);
    }
}
