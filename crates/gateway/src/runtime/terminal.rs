//! Physical terminal runtime — the transient realization of an abstract
//! terminal.
//!
//! Hydrated from the persisted terminal row on attach, persisted back on
//! detach. The physical side may be destroyed and re-created at will; the
//! abstract terminal row (cwd, env delta, history, hydration blob) is what
//! survives.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use leon_domain::resolver::AbstractTerminal;
use leon_domain::Result;
use leon_store::ResolverStore;

use super::hooks::{CommandContext, HookChain};

/// Shell history entries kept on the abstract terminal.
const MAX_HISTORY: usize = 100;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Executor boundary
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn is_error(&self) -> bool {
        self.exit_code != 0
    }
}

/// Executes a command inside the sandbox instance backing the terminal.
/// Real executors (shell-over-provider) are external collaborators.
#[async_trait::async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(
        &self,
        command: &str,
        cwd: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<CommandOutput>;
}

/// Deterministic executor for dev mode and tests: echoes the command
/// back. `sleep N` actually sleeps, so slow-tool paths are exercisable.
pub struct EchoExecutor;

#[async_trait::async_trait]
impl CommandExecutor for EchoExecutor {
    async fn run(
        &self,
        command: &str,
        cwd: &Path,
        _env: &BTreeMap<String, String>,
    ) -> Result<CommandOutput> {
        if let Some(secs) = command
            .trim()
            .strip_prefix("sleep ")
            .and_then(|s| s.trim().parse::<f64>().ok())
        {
            tokio::time::sleep(std::time::Duration::from_secs_f64(secs)).await;
        }
        Ok(CommandOutput {
            stdout: format!("[{}] $ {command}", cwd.display()),
            stderr: String::new(),
            exit_code: 0,
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Terminal runtime
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct TerminalRuntime {
    terminal: AbstractTerminal,
    executor: Arc<dyn CommandExecutor>,
    hooks: Arc<HookChain>,
    store: Arc<ResolverStore>,
    dirty: bool,
}

impl TerminalRuntime {
    /// Attach a physical runtime to the persisted terminal state.
    pub fn hydrate(
        terminal: AbstractTerminal,
        executor: Arc<dyn CommandExecutor>,
        hooks: Arc<HookChain>,
        store: Arc<ResolverStore>,
    ) -> Self {
        Self {
            terminal,
            executor,
            hooks,
            store,
            dirty: false,
        }
    }

    pub fn cwd(&self) -> &Path {
        &self.terminal.cwd
    }

    pub fn version(&self) -> u64 {
        self.terminal.version
    }

    /// Run one command through the hook chain and the executor, tracking
    /// cwd changes and shell history on the abstract terminal.
    pub async fn run_command(&mut self, thread_id: &str, command: &str) -> Result<CommandOutput> {
        let ctx = CommandContext {
            thread_id,
            cwd: &self.terminal.cwd,
        };
        self.hooks.evaluate(command, &ctx)?;

        let output = self
            .executor
            .run(command, &self.terminal.cwd, &self.terminal.env_delta)
            .await?;

        self.terminal.history.push(command.to_owned());
        while self.terminal.history.len() > MAX_HISTORY {
            self.terminal.history.remove(0);
        }
        if output.exit_code == 0 {
            if let Some(target) = parse_cd(command) {
                self.terminal.cwd = resolve_path(&self.terminal.cwd, &target);
            }
        }
        self.terminal.version += 1;
        self.dirty = true;
        Ok(output)
    }

    /// Apply an environment change (bumps the terminal version).
    pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.terminal.env_delta.insert(key.into(), value.into());
        self.terminal.version += 1;
        self.dirty = true;
    }

    /// Persist the runtime's state back onto the abstract terminal row.
    pub fn detach(mut self) -> Result<()> {
        if self.dirty {
            self.store.persist_terminal(&self.terminal)?;
            self.dirty = false;
        }
        Ok(())
    }
}

/// Extract a `cd` target from a simple command line, if that is what it is.
fn parse_cd(command: &str) -> Option<String> {
    let trimmed = command.trim();
    let rest = trimmed.strip_prefix("cd ")?;
    let target = rest.trim();
    if target.is_empty() || target.contains("&&") || target.contains(';') {
        return None;
    }
    Some(target.trim_matches('"').trim_matches('\'').to_owned())
}

/// Join and normalize without touching the filesystem (the path lives in
/// the sandbox, not on this host).
fn resolve_path(cwd: &Path, target: &str) -> PathBuf {
    let raw = if Path::new(target).is_absolute() {
        PathBuf::from(target)
    } else {
        cwd.join(target)
    };
    let mut out = PathBuf::new();
    for part in raw.components() {
        match part {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    if out.as_os_str().is_empty() {
        PathBuf::from("/")
    } else {
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::hooks::default_chain;
    use leon_domain::config::SessionPolicyConfig;
    use leon_domain::resolver::ChatSession;
    use leon_store::Database;

    fn runtime() -> (TerminalRuntime, Arc<ResolverStore>, uuid::Uuid) {
        let store = Arc::new(ResolverStore::new(Database::open_in_memory().unwrap()));
        let session = ChatSession::with_policy("t1", &SessionPolicyConfig::default());
        store.create_session(&session).unwrap();
        let terminal = AbstractTerminal::new(session.session_id, PathBuf::from("/workspace"));
        store.create_terminal(&terminal).unwrap();

        let runtime = TerminalRuntime::hydrate(
            terminal,
            Arc::new(EchoExecutor),
            Arc::new(default_chain(&["forbidden".to_string()])),
            store.clone(),
        );
        (runtime, store, session.session_id)
    }

    #[tokio::test]
    async fn run_records_history_and_version() {
        let (mut runtime, _, _) = runtime();
        let out = runtime.run_command("t1", "echo hello").await.unwrap();
        assert!(out.stdout.contains("echo hello"));
        assert!(!out.is_error());
        assert_eq!(runtime.version(), 1);
    }

    #[tokio::test]
    async fn blocked_command_does_not_execute() {
        let (mut runtime, _, _) = runtime();
        let err = runtime.run_command("t1", "forbidden thing").await.unwrap_err();
        assert_eq!(err.kind(), leon_domain::ErrorKind::Validation);
        // No mutation happened.
        assert_eq!(runtime.version(), 0);
    }

    #[tokio::test]
    async fn cd_tracks_cwd() {
        let (mut runtime, _, _) = runtime();
        runtime.run_command("t1", "cd project").await.unwrap();
        assert_eq!(runtime.cwd(), Path::new("/workspace/project"));

        runtime.run_command("t1", "cd ..").await.unwrap();
        assert_eq!(runtime.cwd(), Path::new("/workspace"));

        runtime.run_command("t1", "cd /tmp").await.unwrap();
        assert_eq!(runtime.cwd(), Path::new("/tmp"));
    }

    #[tokio::test]
    async fn detach_persists_state() {
        let (mut runtime, store, session_id) = runtime();
        runtime.run_command("t1", "cd project").await.unwrap();
        runtime.set_env("FOO", "bar");
        runtime.detach().unwrap();

        let persisted = store.terminal_for_session(session_id).unwrap().unwrap();
        assert_eq!(persisted.cwd, PathBuf::from("/workspace/project"));
        assert_eq!(persisted.env_delta.get("FOO").map(String::as_str), Some("bar"));
        assert_eq!(persisted.version, 2);
        assert_eq!(persisted.history, vec!["cd project".to_string()]);
    }

    #[test]
    fn parse_cd_rejects_compound() {
        assert_eq!(parse_cd("cd /tmp"), Some("/tmp".into()));
        assert_eq!(parse_cd("cd 'my dir'"), Some("my dir".into()));
        assert!(parse_cd("cd /tmp && rm x").is_none());
        assert!(parse_cd("echo cd /tmp").is_none());
        assert!(parse_cd("cd").is_none());
    }

    #[test]
    fn resolve_path_normalizes() {
        let cwd = PathBuf::from("/a/b");
        assert_eq!(resolve_path(&cwd, "c"), PathBuf::from("/a/b/c"));
        assert_eq!(resolve_path(&cwd, "../x"), PathBuf::from("/a/x"));
        assert_eq!(resolve_path(&cwd, "./y"), PathBuf::from("/a/b/y"));
        assert_eq!(resolve_path(&cwd, "../../../.."), PathBuf::from("/"));
    }
}
