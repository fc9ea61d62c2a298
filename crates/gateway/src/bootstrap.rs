//! Wires the application state together from config.
//!
//! `build_state` opens the embedded database under `LEON_HOME`, registers
//! the in-tree dev providers (scripted LLM, in-memory sandbox), and spawns
//! the reconciler. `build_state_with` takes pre-built registries so tests
//! and alternative deployments can inject their own.

use std::path::Path;
use std::sync::Arc;

use leon_domain::config::Config;
use leon_domain::Result;
use leon_providers::{ProviderRegistry, ScriptedProvider};
use leon_sandbox::{MemSandboxProvider, ProviderManager, Reconciler};
use leon_store::{
    Database, EventLog, QueueStore, ResolverStore, RunStore, SqliteCheckpointStore, SummaryStore,
    ThreadStore,
};

use crate::runtime::hooks;
use crate::runtime::memory::MemoryManager;
use crate::runtime::queue::QueueRouter;
use crate::runtime::resolver::ResourceResolver;
use crate::runtime::supervisor::Supervisor;
use crate::runtime::terminal::EchoExecutor;
use crate::state::AppState;

/// Resolve `LEON_HOME` (env override, else `$HOME/.leon`).
pub fn leon_home() -> std::path::PathBuf {
    if let Ok(home) = std::env::var("LEON_HOME") {
        if !home.is_empty() {
            return home.into();
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| ".".into())
        .join(".leon")
}

/// Load `config.toml` under the home directory and apply env overrides.
pub fn load_config(home: &Path) -> Result<Config> {
    let path = home.join("config.toml");
    let mut config: Config = if path.exists() {
        let raw = std::fs::read_to_string(&path)?;
        toml::from_str(&raw)
            .map_err(|e| leon_domain::Error::Validation(format!("config.toml: {e}")))?
    } else {
        Config::default()
    };
    config.apply_env();
    Ok(config)
}

/// Build the full application state with default dev collaborators.
pub fn build_state(config: Arc<Config>, home: &Path) -> Result<AppState> {
    let db = Database::open(&home.join("leon.db"))?;

    let llm = Arc::new(ProviderRegistry::new(&config.model.default_model));
    llm.register(Arc::new(ScriptedProvider::new(&config.model.default_model)));

    let sandboxes = Arc::new(ProviderManager::new());
    sandboxes.register(Arc::new(MemSandboxProvider::new("mem")));

    build_state_with(config, db, llm, sandboxes)
}

/// Build application state over given registries and an open database.
pub fn build_state_with(
    config: Arc<Config>,
    db: Database,
    llm: Arc<ProviderRegistry>,
    sandboxes: Arc<ProviderManager>,
) -> Result<AppState> {
    // Stores.
    let threads = Arc::new(ThreadStore::new(db.clone()));
    let queue = Arc::new(QueueStore::new(db.clone()));
    let run_store = Arc::new(RunStore::new(db.clone()));
    let event_log = Arc::new(EventLog::new(db.clone()));
    let summaries = Arc::new(SummaryStore::new(
        db.clone(),
        config.memory.summary_store_retries,
    ));
    let checkpoints: Arc<dyn leon_store::CheckpointStore> =
        Arc::new(SqliteCheckpointStore::new(db.clone()));
    let resolver_store = Arc::new(ResolverStore::new(db.clone()));

    // Runs marked running by a dead process can never finish.
    run_store.fail_stale_running()?;

    // Reconciler.
    let reconciler = Reconciler::new(
        resolver_store.clone(),
        sandboxes.clone(),
        config.reconciler.clone(),
    );
    let _reconcile_loop = reconciler.spawn();

    // Runtime.
    let supervisor = Supervisor::new(config.runs.clone(), event_log, run_store);
    let hooks = Arc::new(hooks::default_chain(&config.hooks.denied_commands));
    let resolver = Arc::new(ResourceResolver::new(
        resolver_store,
        sandboxes.clone(),
        reconciler.clone(),
        config.sessions.clone(),
        Arc::new(EchoExecutor),
        hooks,
    ));
    let memory = Arc::new(MemoryManager::new(
        config.memory.clone(),
        config.model.clone(),
        summaries.clone(),
        llm.clone(),
    ));

    tracing::info!(
        model = %config.model.default_model,
        providers = llm.len(),
        sandboxes = ?sandboxes.names(),
        "runtime assembled"
    );

    let state = AppState {
        config,
        db,
        threads,
        queue,
        checkpoints,
        summaries,
        llm,
        sandboxes,
        supervisor,
        memory,
        resolver,
        router: Arc::new(QueueRouter::new()),
        reconciler,
    };

    // Messages queued by a previous process are drained once we're up.
    let drain_state = state.clone();
    tokio::spawn(async move {
        match drain_state.queue.threads_with_pending() {
            Ok(threads) => {
                for thread_id in threads {
                    tracing::info!(thread_id = %thread_id, "draining persisted queue");
                    crate::runtime::queue::drain_idle(drain_state.clone(), &thread_id).await;
                }
            }
            Err(e) => tracing::error!(error = %e, "startup queue drain failed"),
        }
    });

    Ok(state)
}
