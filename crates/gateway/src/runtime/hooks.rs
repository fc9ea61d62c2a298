//! Command-hook chain — pre-execute validation and post-hoc metadata for
//! every command the agent runs.
//!
//! A flat list of handlers scanned in ascending priority order; the first
//! `Block` wins, `Note` metadata accumulates. No inheritance, no nesting.

use std::path::Path;
use std::sync::Arc;

use leon_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Hook contract
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct CommandContext<'a> {
    pub thread_id: &'a str,
    pub cwd: &'a Path,
}

#[derive(Debug, Clone)]
pub enum HookDecision {
    Allow,
    Block(String),
    Note(serde_json::Value),
}

pub trait CommandHook: Send + Sync {
    fn name(&self) -> &str;

    /// Lower runs earlier.
    fn priority(&self) -> i32;

    fn check(&self, command: &str, ctx: &CommandContext<'_>) -> HookDecision;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Chain
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct HookChain {
    hooks: Vec<Arc<dyn CommandHook>>,
}

impl HookChain {
    pub fn new(mut hooks: Vec<Arc<dyn CommandHook>>) -> Self {
        hooks.sort_by_key(|h| h.priority());
        Self { hooks }
    }

    /// Run every hook in priority order. Returns accumulated metadata, or
    /// `Validation` carrying the blocking hook's reason.
    pub fn evaluate(&self, command: &str, ctx: &CommandContext<'_>) -> Result<Vec<serde_json::Value>> {
        let mut notes = Vec::new();
        for hook in &self.hooks {
            match hook.check(command, ctx) {
                HookDecision::Allow => {}
                HookDecision::Block(reason) => {
                    tracing::info!(
                        thread_id = %ctx.thread_id,
                        hook = hook.name(),
                        reason = %reason,
                        "command blocked"
                    );
                    return Err(Error::Validation(format!(
                        "command blocked by {}: {reason}",
                        hook.name()
                    )));
                }
                HookDecision::Note(meta) => notes.push(meta),
            }
        }
        Ok(notes)
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Built-in hooks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Blocks commands matching any configured deny pattern. Patterns are
/// compiled once at startup; invalid patterns are dropped with a warning.
pub struct DenyPatternHook {
    set: regex::RegexSet,
}

impl DenyPatternHook {
    pub fn from_patterns(patterns: &[String]) -> Self {
        let valid: Vec<&String> = patterns
            .iter()
            .filter(|p| match regex::Regex::new(p) {
                Ok(_) => true,
                Err(e) => {
                    tracing::warn!(pattern = %p, error = %e, "dropping invalid deny pattern");
                    false
                }
            })
            .collect();
        let set = regex::RegexSet::new(valid).unwrap_or_else(|_| regex::RegexSet::empty());
        Self { set }
    }
}

impl CommandHook for DenyPatternHook {
    fn name(&self) -> &str {
        "deny_patterns"
    }

    fn priority(&self) -> i32 {
        0
    }

    fn check(&self, command: &str, _ctx: &CommandContext<'_>) -> HookDecision {
        if self.set.is_match(command) {
            HookDecision::Block("matches a denied pattern".into())
        } else {
            HookDecision::Allow
        }
    }
}

/// Records every allowed command at info level.
pub struct CommandLogHook;

impl CommandHook for CommandLogHook {
    fn name(&self) -> &str {
        "command_log"
    }

    fn priority(&self) -> i32 {
        100
    }

    fn check(&self, command: &str, ctx: &CommandContext<'_>) -> HookDecision {
        tracing::info!(
            thread_id = %ctx.thread_id,
            cwd = %ctx.cwd.display(),
            command = %command,
            "executing command"
        );
        HookDecision::Note(serde_json::json!({ "logged": true }))
    }
}

/// Default chain: deny patterns from config, then the command log.
pub fn default_chain(denied_commands: &[String]) -> HookChain {
    HookChain::new(vec![
        Arc::new(DenyPatternHook::from_patterns(denied_commands)),
        Arc::new(CommandLogHook),
    ])
}
