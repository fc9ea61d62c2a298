use std::sync::Arc;

use leon_domain::config::Config;
use leon_providers::ProviderRegistry;
use leon_sandbox::{ProviderManager, Reconciler};
use leon_store::{CheckpointStore, Database, QueueStore, SummaryStore, ThreadStore};

use crate::runtime::memory::MemoryManager;
use crate::runtime::queue::QueueRouter;
use crate::runtime::resolver::ResourceResolver;
use crate::runtime::supervisor::Supervisor;

/// Shared application state passed to every API handler and runtime task.
///
/// Three process-wide registries live here for the process lifetime: the
/// supervisor's event buffers, the database handle, and the sandbox
/// provider manager. Everything else is a view over those.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Database,

    // ── Stores ────────────────────────────────────────────────────
    pub threads: Arc<ThreadStore>,
    pub queue: Arc<QueueStore>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub summaries: Arc<SummaryStore>,

    // ── Collaborators ─────────────────────────────────────────────
    pub llm: Arc<ProviderRegistry>,
    pub sandboxes: Arc<ProviderManager>,

    // ── Runtime ───────────────────────────────────────────────────
    pub supervisor: Arc<Supervisor>,
    pub memory: Arc<MemoryManager>,
    pub resolver: Arc<ResourceResolver>,
    pub router: Arc<QueueRouter>,
    pub reconciler: Arc<Reconciler>,
}
