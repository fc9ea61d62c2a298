use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Runtime configuration, loaded from `config.toml` under `LEON_HOME` with
/// selected fields overridable by `LEON_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub runs: RunsConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub sessions: SessionPolicyConfig,
    #[serde(default)]
    pub hooks: HooksConfig,
}

impl Config {
    /// Apply `LEON_*` environment overrides on top of the file config.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("LEON_DEFAULT_MODEL") {
            if !v.is_empty() {
                self.model.default_model = v;
            }
        }
        if let Some(v) = env_parse::<f64>("LEON_CONTEXT_THRESHOLD") {
            self.memory.context_threshold = v;
        }
        if let Some(v) = env_parse::<usize>("LEON_RING_CAPACITY") {
            self.runs.ring_capacity = v;
        }
        if let Some(v) = env_parse::<u64>("LEON_RECONCILE_INTERVAL_MS") {
            self.reconciler.interval_ms = v;
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    match std::env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(var = name, value = %raw, "ignoring unparseable env override");
                None
            }
        },
        Err(_) => None,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: d_port(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Model defaults & pricing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "d_model")]
    pub default_model: String,
    /// Context window in tokens for models not listed in `context_limits`.
    #[serde(default = "d_context_limit")]
    pub default_context_limit: u64,
    /// Per-model context windows (key = model name).
    #[serde(default)]
    pub context_limits: HashMap<String, u64>,
    /// Per-model pricing for cost accounting (key = model name).
    #[serde(default)]
    pub pricing: HashMap<String, ModelPricing>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            default_model: d_model(),
            default_context_limit: d_context_limit(),
            context_limits: HashMap::new(),
            pricing: HashMap::new(),
        }
    }
}

impl ModelConfig {
    pub fn context_limit(&self, model: &str) -> u64 {
        self.context_limits
            .get(model)
            .copied()
            .unwrap_or(self.default_context_limit)
    }
}

/// Pricing per million tokens for a specific model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Dollars per 1 million input (prompt) tokens.
    pub input_per_1m: f64,
    /// Dollars per 1 million output (completion) tokens.
    pub output_per_1m: f64,
}

impl ModelPricing {
    pub fn estimate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 * self.input_per_1m + output_tokens as f64 * self.output_per_1m)
            / 1_000_000.0
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Memory manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Fraction of the context limit at which compaction triggers.
    #[serde(default = "d_threshold")]
    pub context_threshold: f64,
    /// Messages at the tail that pruning never touches.
    #[serde(default = "d_keep_last")]
    pub keep_last_messages: usize,
    /// Per-type content caps applied by the pruner, in chars.
    #[serde(default = "d_tool_cap")]
    pub tool_result_cap_chars: usize,
    #[serde(default = "d_text_cap")]
    pub text_cap_chars: usize,
    /// Bounded retries for summary-store reads and writes.
    #[serde(default = "d_retries")]
    pub summary_store_retries: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            context_threshold: d_threshold(),
            keep_last_messages: d_keep_last(),
            tool_result_cap_chars: d_tool_cap(),
            text_cap_chars: d_text_cap(),
            summary_store_retries: d_retries(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run supervisor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunsConfig {
    /// Capacity of the per-thread in-memory event ring.
    #[serde(default = "d_ring")]
    pub ring_capacity: usize,
    /// Grace period after cancel before the producer is force-aborted.
    #[serde(default = "d_grace")]
    pub cancel_grace_secs: u64,
    /// Tool-loop iterations before a run is force-stopped.
    #[serde(default = "d_max_loops")]
    pub max_tool_loops: usize,
}

impl Default for RunsConfig {
    fn default() -> Self {
        Self {
            ring_capacity: d_ring(),
            cancel_grace_secs: d_grace(),
            max_tool_loops: d_max_loops(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Reconciler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    #[serde(default = "d_interval")]
    pub interval_ms: u64,
    /// How long a resolution waits for a lease to converge.
    #[serde(default = "d_converge")]
    pub converge_timeout_secs: u64,
    /// Provider-call retries per reconcile step.
    #[serde(default = "d_retries")]
    pub provider_retries: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_ms: d_interval(),
            converge_timeout_secs: d_converge(),
            provider_retries: d_retries(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Queue router
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// When true, messages arriving mid-run are injected into the live run
    /// as system reminders instead of queueing behind it.
    #[serde(default = "d_true")]
    pub steer_enabled: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            steer_enabled: true,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Defaults applied when a thread's first session is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionPolicyConfig {
    #[serde(default = "d_idle_ttl")]
    pub idle_ttl_secs: u64,
    #[serde(default = "d_max_wall")]
    pub max_wall_secs: u64,
    #[serde(default = "d_max_cost")]
    pub max_cost_usd: f64,
    #[serde(default = "d_cwd")]
    pub default_cwd: PathBuf,
}

impl Default for SessionPolicyConfig {
    fn default() -> Self {
        Self {
            idle_ttl_secs: d_idle_ttl(),
            max_wall_secs: d_max_wall(),
            max_cost_usd: d_max_cost(),
            default_cwd: d_cwd(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Command hooks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HooksConfig {
    /// Regex patterns; commands matching any of these are blocked before
    /// execution.
    #[serde(default)]
    pub denied_commands: Vec<String>,
}

// ── serde default helpers ───────────────────────────────────────────

fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_port() -> u16 {
    4400
}
fn d_model() -> String {
    "scripted".into()
}
fn d_context_limit() -> u64 {
    200_000
}
fn d_threshold() -> f64 {
    0.70
}
fn d_keep_last() -> usize {
    6
}
fn d_tool_cap() -> usize {
    20_000
}
fn d_text_cap() -> usize {
    40_000
}
fn d_retries() -> u32 {
    3
}
fn d_ring() -> usize {
    1024
}
fn d_grace() -> u64 {
    5
}
fn d_max_loops() -> usize {
    25
}
fn d_interval() -> u64 {
    1000
}
fn d_converge() -> u64 {
    30
}
fn d_idle_ttl() -> u64 {
    1800
}
fn d_max_wall() -> u64 {
    14_400
}
fn d_max_cost() -> f64 {
    25.0
}
fn d_cwd() -> PathBuf {
    PathBuf::from("/workspace")
}
fn d_true() -> bool {
    true
}
