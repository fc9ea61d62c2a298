//! Provider registry — maps model names onto provider instances.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::traits::LlmProvider;

/// Process-wide registry of LLM providers keyed by model name.
///
/// The runtime resolves in order: explicit model override → default model →
/// any registered provider.
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<dyn LlmProvider>>>,
    default_model: String,
}

impl ProviderRegistry {
    pub fn new(default_model: impl Into<String>) -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            default_model: default_model.into(),
        }
    }

    pub fn register(&self, provider: Arc<dyn LlmProvider>) {
        let model = provider.model().to_owned();
        tracing::info!(model = %model, "LLM provider registered");
        self.providers.write().insert(model, provider);
    }

    pub fn get(&self, model: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers.read().get(model).cloned()
    }

    /// Resolve a provider: explicit override, then the default model, then
    /// any registered provider.
    pub fn resolve(&self, model_override: Option<&str>) -> Option<Arc<dyn LlmProvider>> {
        let providers = self.providers.read();
        if let Some(model) = model_override {
            if let Some(p) = providers.get(model) {
                return Some(p.clone());
            }
        }
        if let Some(p) = providers.get(&self.default_model) {
            return Some(p.clone());
        }
        providers.values().next().cloned()
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub fn is_empty(&self) -> bool {
        self.providers.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.providers.read().len()
    }

    pub fn models(&self) -> Vec<String> {
        self.providers.read().keys().cloned().collect()
    }
}
