//! Context and token monitors — the numbers behind `status` events and the
//! runtime-status endpoint.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use leon_domain::config::ModelConfig;
use leon_domain::stream::Usage;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Snapshots
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How full the model context is, updated before every model call.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ContextSnapshot {
    pub messages: usize,
    pub estimated_tokens: u64,
    pub context_limit: u64,
    pub percent_used: f64,
    pub near_limit: bool,
}

/// Running token totals and estimated spend for a thread.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TokenSnapshot {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub estimated_cost_usd: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ThreadMonitorSnapshot {
    pub context: ContextSnapshot,
    pub tokens: TokenSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_tool: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Near-limit warning threshold as a fraction of the context window.
const NEAR_LIMIT_RATIO: f64 = 0.85;

#[derive(Default)]
pub struct MonitorRegistry {
    monitors: RwLock<HashMap<String, Arc<RwLock<ThreadMonitorSnapshot>>>>,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, thread_id: &str) -> Arc<RwLock<ThreadMonitorSnapshot>> {
        if let Some(m) = self.monitors.read().get(thread_id) {
            return m.clone();
        }
        self.monitors
            .write()
            .entry(thread_id.to_owned())
            .or_default()
            .clone()
    }

    pub fn snapshot(&self, thread_id: &str) -> ThreadMonitorSnapshot {
        self.entry(thread_id).read().clone()
    }

    /// Record the context shape of the message list about to go to the model.
    pub fn record_context(&self, thread_id: &str, messages: usize, estimated_tokens: u64, context_limit: u64) {
        let entry = self.entry(thread_id);
        let mut monitor = entry.write();
        let percent_used = if context_limit == 0 {
            0.0
        } else {
            (estimated_tokens as f64 / context_limit as f64) * 100.0
        };
        monitor.context = ContextSnapshot {
            messages,
            estimated_tokens,
            context_limit,
            percent_used,
            near_limit: percent_used >= NEAR_LIMIT_RATIO * 100.0,
        };
    }

    /// Fold one model call's usage into the running totals.
    pub fn record_usage(&self, thread_id: &str, model: &str, usage: &Usage, model_config: &ModelConfig) {
        let entry = self.entry(thread_id);
        let mut monitor = entry.write();
        monitor.tokens.input_tokens += usage.input_tokens;
        monitor.tokens.output_tokens += usage.output_tokens;
        monitor.tokens.cache_read_tokens += usage.cache_read_tokens.unwrap_or(0);
        monitor.tokens.cache_write_tokens += usage.cache_write_tokens.unwrap_or(0);
        if let Some(pricing) = model_config.pricing.get(model) {
            monitor.tokens.estimated_cost_usd +=
                pricing.estimate_cost(usage.input_tokens, usage.output_tokens);
        }
    }

    pub fn set_current_tool(&self, thread_id: &str, tool: Option<String>) {
        self.entry(thread_id).write().current_tool = tool;
    }

    pub fn remove(&self, thread_id: &str) {
        self.monitors.write().remove(thread_id);
    }
}
