//! Process-wide sandbox provider registry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use leon_domain::{Error, Result};

use crate::provider::SandboxProvider;

pub struct ProviderManager {
    providers: RwLock<HashMap<String, Arc<dyn SandboxProvider>>>,
}

impl Default for ProviderManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderManager {
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, provider: Arc<dyn SandboxProvider>) {
        let name = provider.name().to_owned();
        tracing::info!(provider = %name, "sandbox provider registered");
        self.providers.write().insert(name, provider);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn SandboxProvider>> {
        self.providers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("sandbox provider {name}")))
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.read().keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.read().contains_key(name)
    }
}
