//! Resolution chain: thread → session → abstract terminal → lease →
//! instance, executed on every tool-executing operation.
//!
//! Missing layers are created on first use with default policy; the lease
//! is converged through the reconciler before a terminal handle is
//! returned. Thread delete recomputes provider/instance pairs from the
//! database rather than trusting the in-memory provider manager.

use std::sync::Arc;

use leon_domain::config::SessionPolicyConfig;
use leon_domain::resolver::{AbstractTerminal, ChatSession, DesiredState, ObservedState, SandboxLease};
use leon_domain::{Error, Result};
use leon_sandbox::{ProviderManager, Reconciler};
use leon_store::{Database, ResolverStore, ThreadRecord};

use super::hooks::HookChain;
use super::terminal::{CommandExecutor, TerminalRuntime};

/// The fully-resolved resource stack for one thread.
pub struct ResolvedResources {
    pub session: ChatSession,
    pub lease: SandboxLease,
    pub terminal: TerminalRuntime,
}

pub struct ResourceResolver {
    store: Arc<ResolverStore>,
    providers: Arc<ProviderManager>,
    reconciler: Arc<Reconciler>,
    policy: SessionPolicyConfig,
    executor: Arc<dyn CommandExecutor>,
    hooks: Arc<HookChain>,
}

impl ResourceResolver {
    pub fn new(
        store: Arc<ResolverStore>,
        providers: Arc<ProviderManager>,
        reconciler: Arc<Reconciler>,
        policy: SessionPolicyConfig,
        executor: Arc<dyn CommandExecutor>,
        hooks: Arc<HookChain>,
    ) -> Self {
        Self {
            store,
            providers,
            reconciler,
            policy,
            executor,
            hooks,
        }
    }

    pub fn store(&self) -> &Arc<ResolverStore> {
        &self.store
    }

    /// Resolve the full chain, creating missing layers and blocking on
    /// lease convergence (bounded by the reconciler's deadline).
    pub async fn resolve(&self, thread: &ThreadRecord) -> Result<ResolvedResources> {
        // 1. Session (default policy on first use; the thread may pin its
        //    own working directory).
        let session = match self.store.active_session(&thread.thread_id)? {
            Some(session) => session,
            None => {
                let mut session = ChatSession::with_policy(&thread.thread_id, &self.policy);
                if let Some(cwd) = &thread.cwd {
                    session.default_cwd = cwd.into();
                }
                self.store.create_session(&session)?;
                tracing::info!(
                    thread_id = %thread.thread_id,
                    session_id = %session.session_id,
                    "created default session"
                );
                session
            }
        };

        // 2. Abstract terminal.
        let terminal = match self.store.terminal_for_session(session.session_id)? {
            Some(terminal) => terminal,
            None => {
                let terminal = AbstractTerminal::new(session.session_id, session.default_cwd.clone());
                self.store.create_terminal(&terminal)?;
                terminal
            }
        };

        // 3. Lease, converged to active.
        let lease = self.acquire_active_lease(&session, &thread.sandbox_provider).await?;

        // 4. Hydrate the physical runtime from the persisted state.
        let runtime = TerminalRuntime::hydrate(
            terminal,
            self.executor.clone(),
            self.hooks.clone(),
            self.store.clone(),
        );

        Ok(ResolvedResources {
            session,
            lease,
            terminal: runtime,
        })
    }

    async fn acquire_active_lease(
        &self,
        session: &ChatSession,
        provider: &str,
    ) -> Result<SandboxLease> {
        let lease = match self.store.lease_for_session(session.session_id)? {
            Some(lease) => lease,
            None => {
                let lease = SandboxLease::new(session.session_id, provider);
                self.store.create_lease(&lease)?;
                lease
            }
        };

        if lease.observed_state == ObservedState::Active
            && lease.desired_state == DesiredState::Active
        {
            return Ok(lease);
        }

        // A lease parked in error gets one more chance whenever something
        // actually needs the sandbox.
        self.store.set_desired(lease.lease_id, DesiredState::Active)?;
        if lease.observed_state == ObservedState::Error {
            let mut retry = lease.clone();
            retry.desired_state = DesiredState::Active;
            retry.observed_state = ObservedState::Unknown;
            retry.last_error = None;
            self.store.update_lease(&retry)?;
        }
        self.reconciler.kick();

        let converged = self.reconciler.await_converged(lease.lease_id).await?;
        if converged.observed_state != ObservedState::Active {
            return Err(Error::sandbox_unavailable(&session.thread_id));
        }
        Ok(converged)
    }

    // ── Thread delete ──────────────────────────────────────────────

    /// Destroy every instance any of the thread's sessions ever leased,
    /// computing provider/instance from the database, then drop all
    /// thread-owned rows.
    pub async fn delete_thread(&self, db: &Database, thread_id: &str) -> Result<()> {
        for session in self.store.sessions_for_thread(thread_id)? {
            let Some(lease) = self.store.lease_for_session(session.session_id)? else {
                continue;
            };
            let Some(instance_id) = lease.instance_id.clone() else {
                continue;
            };
            match self.providers.get(&lease.provider) {
                Ok(provider) => {
                    if let Err(e) = provider.destroy(&instance_id).await {
                        tracing::warn!(
                            thread_id,
                            instance_id = %instance_id,
                            error = %e,
                            "instance destroy failed during thread delete"
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!(thread_id, error = %e, "provider missing during thread delete");
                }
            }
        }
        db.delete_thread(thread_id)
    }

    // ── Orphans ────────────────────────────────────────────────────

    /// Adopt an orphan: bind a new session + lease on the target thread to
    /// the existing instance, verifying it through the provider.
    pub async fn adopt_orphan(
        &self,
        thread: &ThreadRecord,
        provider_name: &str,
        instance_id: &str,
    ) -> Result<SandboxLease> {
        let provider = self.providers.get(provider_name)?;
        let state = provider.status(instance_id).await?;

        let session = ChatSession::with_policy(&thread.thread_id, &self.policy);
        self.store.create_session(&session)?;

        let mut lease = SandboxLease::new(session.session_id, provider_name);
        lease.instance_id = Some(instance_id.to_owned());
        lease.observed_state = state.to_observed();
        self.store.create_lease(&lease)?;

        tracing::info!(
            thread_id = %thread.thread_id,
            instance_id,
            observed = lease.observed_state.as_str(),
            "orphan adopted"
        );
        Ok(lease)
    }

    /// Destroy an orphan at the provider, with no local side effect.
    pub async fn destroy_orphan(&self, provider_name: &str, instance_id: &str) -> Result<()> {
        let provider = self.providers.get(provider_name)?;
        provider.destroy(instance_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::hooks::default_chain;
    use crate::runtime::terminal::EchoExecutor;
    use leon_domain::config::ReconcilerConfig;
    use leon_sandbox::MemSandboxProvider;
    use leon_store::ThreadStore;

    struct Fixture {
        resolver: ResourceResolver,
        db: Database,
        store: Arc<ResolverStore>,
        provider: Arc<MemSandboxProvider>,
        threads: ThreadStore,
    }

    fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let store = Arc::new(ResolverStore::new(db.clone()));
        let provider = Arc::new(MemSandboxProvider::new("mem"));
        let providers = Arc::new(ProviderManager::new());
        providers.register(provider.clone());
        let reconciler = Reconciler::new(
            store.clone(),
            providers.clone(),
            ReconcilerConfig {
                interval_ms: 10,
                converge_timeout_secs: 2,
                provider_retries: 2,
            },
        );
        let _loop = reconciler.spawn();

        let resolver = ResourceResolver::new(
            store.clone(),
            providers,
            reconciler,
            SessionPolicyConfig::default(),
            Arc::new(EchoExecutor),
            Arc::new(default_chain(&[])),
        );
        Fixture {
            resolver,
            threads: ThreadStore::new(db.clone()),
            db,
            store,
            provider,
        }
    }

    fn thread(f: &Fixture) -> ThreadRecord {
        let t = ThreadRecord::new("mem");
        f.threads.create(&t).unwrap();
        t
    }

    #[tokio::test]
    async fn resolve_creates_full_chain() {
        let f = fixture();
        let t = thread(&f);

        let resolved = f.resolver.resolve(&t).await.unwrap();
        assert_eq!(resolved.session.thread_id, t.thread_id);
        assert_eq!(resolved.lease.observed_state, ObservedState::Active);
        assert!(resolved.lease.instance_id.is_some());
        assert_eq!(resolved.terminal.version(), 0);

        // Second resolve reuses every layer.
        let again = f.resolver.resolve(&t).await.unwrap();
        assert_eq!(again.session.session_id, resolved.session.session_id);
        assert_eq!(again.lease.lease_id, resolved.lease.lease_id);
        assert_eq!(f.provider.instance_count(), 1);
    }

    #[tokio::test]
    async fn terminal_state_survives_physical_restart() {
        let f = fixture();
        let t = thread(&f);

        let mut resolved = f.resolver.resolve(&t).await.unwrap();
        resolved.terminal.run_command(&t.thread_id, "cd sub").await.unwrap();
        resolved.terminal.detach().unwrap();

        // A fresh resolution hydrates the persisted cwd.
        let rehydrated = f.resolver.resolve(&t).await.unwrap();
        assert_eq!(
            rehydrated.terminal.cwd(),
            std::path::Path::new("/workspace/sub")
        );
        assert_eq!(rehydrated.terminal.version(), 1);
    }

    #[tokio::test]
    async fn delete_thread_destroys_instances_and_rows() {
        let f = fixture();
        let t = thread(&f);
        f.resolver.resolve(&t).await.unwrap();
        assert_eq!(f.provider.instance_count(), 1);

        f.resolver.delete_thread(&f.db, &t.thread_id).await.unwrap();
        assert_eq!(f.provider.instance_count(), 0);
        assert!(f.threads.get(&t.thread_id).unwrap().is_none());
        assert!(f.store.sessions_for_thread(&t.thread_id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn adopt_orphan_binds_session_and_lease() {
        let f = fixture();
        let t = thread(&f);
        let orphan_id = f.provider.create_detached();

        let lease = f
            .resolver
            .adopt_orphan(&t, "mem", &orphan_id)
            .await
            .unwrap();
        assert_eq!(lease.instance_id.as_deref(), Some(orphan_id.as_str()));
        assert_eq!(lease.observed_state, ObservedState::Active);

        let session = f.store.active_session(&t.thread_id).unwrap().unwrap();
        assert_eq!(session.session_id, lease.session_id);
    }

    #[tokio::test]
    async fn destroy_orphan_has_no_local_effect() {
        let f = fixture();
        let orphan_id = f.provider.create_detached();
        f.resolver.destroy_orphan("mem", &orphan_id).await.unwrap();
        assert_eq!(f.provider.instance_count(), 0);
        assert!(f.store.list_leases().unwrap().is_empty());
    }

    #[tokio::test]
    async fn adopt_missing_instance_fails() {
        let f = fixture();
        let t = thread(&f);
        let err = f.resolver.adopt_orphan(&t, "mem", "ghost").await.unwrap_err();
        assert_eq!(err.kind(), leon_domain::ErrorKind::NotFound);
    }
}
