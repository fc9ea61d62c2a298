//! Memory manager — keeps the model's context under budget.
//!
//! Two tiers: pruning caps individual message contents before every model
//! call; compaction summarizes a prefix of the history into a system
//! message once total tokens cross the configured threshold. Summaries are
//! persisted so a restarted process picks up exactly where it left off,
//! and a corrupt summary row is rebuilt from the checkpointed history.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use leon_domain::config::{MemoryConfig, ModelConfig};
use leon_domain::message::{Message, Role};
use leon_domain::{Error, Result};
use leon_providers::{ChatRequest, ProviderRegistry};
use leon_store::{Summary, SummaryStore};

use super::machine::ThreadMachine;

/// Prefix of the synthetic system message carrying the active summary.
pub const SUMMARY_PREFIX: &str = "Conversation Summary:\n";

/// Joins the historical summary and the turn-prefix summary of a split turn.
pub const SPLIT_TURN_SEPARATOR: &str = "\n\n--- current turn, earlier portion ---\n\n";

/// Fixed per-message token overhead on top of content.
const MESSAGE_OVERHEAD_TOKENS: u64 = 4;

/// A split turn is declared when the tail alone exceeds half the context
/// budget by this factor.
const SPLIT_TURN_SLACK: f64 = 1.2;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Token estimation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Chars-over-four heuristic; close enough for budget decisions and cheap
/// enough to run on every call.
pub fn estimate_message_tokens(msg: &Message) -> u64 {
    let mut chars = msg.text().len();
    for tc in &msg.tool_calls {
        chars += tc.tool_name.len() + tc.arguments.to_string().len();
    }
    (chars as u64 / 4) + MESSAGE_OVERHEAD_TOKENS
}

pub fn estimate_tokens(messages: &[Message]) -> u64 {
    messages.iter().map(estimate_message_tokens).sum()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Memory manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What the producer hands to the model.
pub struct PreparedContext {
    pub messages: Vec<Message>,
    pub estimated_tokens: u64,
    pub context_limit: u64,
    pub compacted: bool,
}

pub struct MemoryManager {
    memory: MemoryConfig,
    model: ModelConfig,
    summaries: Arc<SummaryStore>,
    providers: Arc<ProviderRegistry>,
    /// Per-thread summary cache. An entry (even `None`) means the store
    /// was consulted since startup.
    cache: RwLock<HashMap<String, Option<Summary>>>,
}

impl MemoryManager {
    pub fn new(
        memory: MemoryConfig,
        model: ModelConfig,
        summaries: Arc<SummaryStore>,
        providers: Arc<ProviderRegistry>,
    ) -> Self {
        Self {
            memory,
            model,
            summaries,
            providers,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Build the message list for the next model call: apply the active
    /// summary, prune, and compact when over threshold.
    pub async fn prepare(
        &self,
        thread_id: &str,
        model: &str,
        history: &[Message],
        machine: Option<&ThreadMachine>,
    ) -> Result<PreparedContext> {
        let limit = self.model.context_limit(model);
        let summary = self.ensure_summary(thread_id, history, limit).await?;

        let (mut view, covered) = apply_summary(history, summary.as_ref());
        view = self.prune(&view);

        let mut compacted = false;
        let threshold = (self.memory.context_threshold * limit as f64) as u64;
        if estimate_tokens(&view) >= threshold {
            if let Some(machine) = machine {
                machine.update_flags(|f| f.compacting = true);
            }
            let result = self.compact(thread_id, view, covered, limit).await;
            if let Some(machine) = machine {
                machine.update_flags(|f| f.compacting = false);
            }
            view = result?;
            compacted = true;
        }

        Ok(PreparedContext {
            estimated_tokens: estimate_tokens(&view),
            context_limit: limit,
            compacted,
            messages: view,
        })
    }

    // ── Tier 1: pruning ────────────────────────────────────────────

    /// Cap oversized message contents, preserving role and tool-call
    /// linkage. The first system message and the last N messages are never
    /// touched. Idempotent: placeholders are always under the caps.
    pub fn prune(&self, messages: &[Message]) -> Vec<Message> {
        let len = messages.len();
        let protected_tail = len.saturating_sub(self.memory.keep_last_messages);

        messages
            .iter()
            .enumerate()
            .map(|(i, msg)| {
                if i >= protected_tail {
                    return msg.clone();
                }
                if i == 0 && msg.role == Role::System {
                    return msg.clone();
                }
                let cap = match msg.role {
                    Role::Tool => self.memory.tool_result_cap_chars,
                    _ => self.memory.text_cap_chars,
                };
                let text_len = msg.text().len();
                if text_len <= cap {
                    return msg.clone();
                }
                let mut pruned = msg.clone();
                pruned.set_text(format!("[content pruned: {text_len} chars omitted]"));
                pruned
            })
            .collect()
    }

    // ── Tier 2: compaction ─────────────────────────────────────────

    /// Summarize a prefix of the working view into a single system message
    /// and persist the summary row. `covered` is how many original history
    /// messages the prior active summary already replaced.
    async fn compact(
        &self,
        thread_id: &str,
        view: Vec<Message>,
        covered: usize,
        limit: u64,
    ) -> Result<Vec<Message>> {
        // One synthetic summary message sits at the head when a prior
        // summary is applied; it never counts toward history indexes.
        let synthetic = usize::from(covered > 0);
        let half = limit / 2;

        let k = adjust_boundary(&view, split_at_budget(&view, half));
        let tail = &view[k..];
        let tail_tokens = estimate_tokens(tail);

        if (tail_tokens as f64) > half as f64 * SPLIT_TURN_SLACK {
            return self.compact_split_turn(thread_id, &view, k, covered, synthetic, half).await;
        }

        let summary_text = self.summarize(&view[..k]).await?;
        let compact_up_to = covered + (k - synthetic.min(k));
        let summary = Summary::new(thread_id, &summary_text, compact_up_to);
        self.summaries.save(&summary).await?;
        self.cache
            .write()
            .insert(thread_id.to_owned(), Some(summary));

        tracing::info!(
            thread_id,
            compact_up_to,
            summary_chars = summary_text.len(),
            "history compacted"
        );

        let mut out = vec![Message::system(format!("{SUMMARY_PREFIX}{summary_text}"))];
        out.extend_from_slice(tail);
        Ok(out)
    }

    /// Split-turn variant: the remaining turn alone is too large, so its
    /// prefix is summarized separately with an instruction emphasizing the
    /// original request, and the two layers are joined by a fixed separator.
    async fn compact_split_turn(
        &self,
        thread_id: &str,
        view: &[Message],
        k: usize,
        covered: usize,
        synthetic: usize,
        half: u64,
    ) -> Result<Vec<Message>> {
        let tail = &view[k..];
        let m = adjust_boundary(tail, keep_suffix_at_budget(tail, half));
        let prefix_tokens = estimate_tokens(&tail[..m]);

        let historical = if k > 0 {
            Some(self.summarize(&view[..k]).await?)
        } else {
            None
        };
        let turn_prefix = self.summarize_turn_prefix(&tail[..m]).await?;

        let summary_text = match historical {
            Some(h) if !h.trim().is_empty() => format!("{h}{SPLIT_TURN_SEPARATOR}{turn_prefix}"),
            _ => turn_prefix,
        };

        let compact_up_to = covered + (k + m).saturating_sub(synthetic);
        let mut summary = Summary::new(thread_id, &summary_text, compact_up_to);
        summary.is_split_turn = true;
        summary.split_turn_prefix = Some(prefix_tokens);
        self.summaries.save(&summary).await?;
        self.cache
            .write()
            .insert(thread_id.to_owned(), Some(summary));

        tracing::info!(thread_id, compact_up_to, prefix_tokens, "split-turn compaction");

        let mut out = vec![Message::system(format!("{SUMMARY_PREFIX}{summary_text}"))];
        out.extend_from_slice(&tail[m..]);
        Ok(out)
    }

    // ── Restart & rebuild ──────────────────────────────────────────

    /// On the first model call per thread since startup, load the active
    /// summary row; a row that fails validation is rebuilt from the
    /// checkpointed history and re-saved.
    async fn ensure_summary(
        &self,
        thread_id: &str,
        history: &[Message],
        limit: u64,
    ) -> Result<Option<Summary>> {
        if let Some(cached) = self.cache.read().get(thread_id) {
            return Ok(cached.clone());
        }

        let loaded = self.summaries.load_active(thread_id).await?;
        let resolved = match loaded {
            Some(row) if row.is_valid(history.len()) => Some(row),
            Some(row) => {
                tracing::warn!(
                    thread_id,
                    summary_id = %row.summary_id,
                    "active summary failed validation, rebuilding"
                );
                self.rebuild_summary(thread_id, history, limit).await?
            }
            None => None,
        };

        self.cache
            .write()
            .insert(thread_id.to_owned(), resolved.clone());
        Ok(resolved)
    }

    async fn rebuild_summary(
        &self,
        thread_id: &str,
        history: &[Message],
        limit: u64,
    ) -> Result<Option<Summary>> {
        let k = adjust_boundary(history, split_at_budget(history, limit / 2));
        if k == 0 {
            return Ok(None);
        }
        let summary_text = self.summarize(&history[..k]).await?;
        let summary = Summary::new(thread_id, &summary_text, k);
        self.summaries.save(&summary).await?;
        Ok(Some(summary))
    }

    // ── Summarization calls ────────────────────────────────────────

    async fn summarize(&self, messages: &[Message]) -> Result<String> {
        let prompt = format!(
            "Summarize the following conversation history into a concise summary \
             that preserves:\n\
             1. The current goal or plan being worked on\n\
             2. Key decisions made\n\
             3. Open questions or threads\n\
             4. Tool state (running processes, files touched, pending work)\n\n\
             Be concise but preserve all actionable context. Write in present \
             tense; omit pleasantries.\n\nCONVERSATION:\n{}",
            conversation_text(messages)
        );
        self.call_summarizer(prompt).await
    }

    async fn summarize_turn_prefix(&self, messages: &[Message]) -> Result<String> {
        let prompt = format!(
            "The following is the earlier portion of a single in-progress turn \
             that is too large to keep verbatim. Summarize it, emphasizing the \
             user's ORIGINAL REQUEST and any constraints stated, so the rest of \
             the turn can continue faithfully.\n\nTURN SO FAR:\n{}",
            conversation_text(messages)
        );
        self.call_summarizer(prompt).await
    }

    /// One summarization model call with bounded, jittered retries.
    async fn call_summarizer(&self, prompt: String) -> Result<String> {
        let provider = self
            .providers
            .resolve(None)
            .ok_or_else(|| Error::TransientUpstream("no provider for summarization".into()))?;
        let attempts = self.memory.summary_store_retries.max(1);
        let mut attempt = 0;
        loop {
            let req = ChatRequest {
                messages: vec![Message::user(prompt.clone())],
                temperature: Some(0.1),
                max_tokens: Some(2000),
                ..Default::default()
            };
            match provider.chat(req).await {
                Ok(resp) if !resp.content.trim().is_empty() => return Ok(resp.content),
                Ok(_) => return Err(Error::Corruption("summarizer returned empty text".into())),
                Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                    let delay = 50u64 * (1 << attempt.min(5));
                    tracing::warn!(attempt = attempt + 1, error = %e, "summarization retry");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pure helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Apply the active summary to the full history: the covered prefix is
/// replaced by one synthetic system message. Returns the working view and
/// how many history messages the summary covers.
fn apply_summary(history: &[Message], summary: Option<&Summary>) -> (Vec<Message>, usize) {
    match summary {
        Some(s) if s.compact_up_to_index > 0 && s.compact_up_to_index <= history.len() => {
            let mut view = vec![Message::system(format!("{SUMMARY_PREFIX}{}", s.summary_text))];
            view.extend_from_slice(&history[s.compact_up_to_index..]);
            (view, s.compact_up_to_index)
        }
        _ => (history.to_vec(), 0),
    }
}

/// Largest k such that the first k messages fit the token budget.
fn split_at_budget(messages: &[Message], budget: u64) -> usize {
    let mut acc = 0u64;
    for (i, msg) in messages.iter().enumerate() {
        acc += estimate_message_tokens(msg);
        if acc > budget {
            return i;
        }
    }
    messages.len()
}

/// Smallest m such that messages[m..] fits the token budget, leaving at
/// least the final message in the suffix.
fn keep_suffix_at_budget(messages: &[Message], budget: u64) -> usize {
    let mut acc = 0u64;
    for i in (0..messages.len()).rev() {
        acc += estimate_message_tokens(&messages[i]);
        if acc > budget {
            return (i + 1).min(messages.len().saturating_sub(1));
        }
    }
    0
}

/// Walk the boundary forward until it no longer splits a tool dialog: the
/// message before the cut must not be an assistant message with pending
/// tool calls, and the message at the cut must not be an orphaned tool
/// result.
pub fn adjust_boundary(messages: &[Message], mut k: usize) -> usize {
    while k > 0 && k < messages.len() {
        let splits_pair = messages[k - 1].has_tool_calls() || messages[k].tool_call_id.is_some();
        if !splits_pair {
            break;
        }
        k += 1;
    }
    k.min(messages.len())
}

fn conversation_text(messages: &[Message]) -> String {
    let mut buf = String::new();
    for msg in messages {
        let label = match msg.role {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::Tool => "Tool",
        };
        buf.push_str(label);
        buf.push_str(": ");
        let text = msg.text();
        // Keep very long entries (tool output) from bloating the prompt.
        if text.len() > 2000 {
            buf.push_str(&text[..1000]);
            buf.push_str(" [...] ");
            buf.push_str(&text[text.len() - 500..]);
        } else {
            buf.push_str(text);
        }
        for tc in &msg.tool_calls {
            buf.push_str(&format!(" [calls {}]", tc.tool_name));
        }
        buf.push('\n');
    }
    buf
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
