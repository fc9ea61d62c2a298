//! Lease reconciler — drives observed state toward desired state.
//!
//! One shared task ticks every `interval_ms`, walking every lease and
//! performing at most one provider transition per lease per tick. Each
//! step lands in the `lease_events` table for the operator view. Waiters
//! block on convergence through [`Reconciler::await_converged`], which is
//! pulsed after every pass.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::Notify;

use leon_domain::config::ReconcilerConfig;
use leon_domain::resolver::{DesiredState, LeaseEvent, ObservedState, SandboxLease};
use leon_domain::{Error, Result};
use leon_store::ResolverStore;

use crate::manager::ProviderManager;
use crate::provider::{SandboxConfig, SandboxProvider};

pub struct Reconciler {
    store: Arc<ResolverStore>,
    providers: Arc<ProviderManager>,
    config: ReconcilerConfig,
    /// Pulsed after every completed pass; convergence waiters listen here.
    pass_done: Notify,
    /// Wakes the loop ahead of its interval when a lease changes.
    kick: Notify,
}

impl Reconciler {
    pub fn new(
        store: Arc<ResolverStore>,
        providers: Arc<ProviderManager>,
        config: ReconcilerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            providers,
            config,
            pass_done: Notify::new(),
            kick: Notify::new(),
        })
    }

    /// Start the background loop. Runs until the process exits.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let interval = Duration::from_millis(this.config.interval_ms.max(10));
            loop {
                this.tick().await;
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = this.kick.notified() => {}
                }
            }
        })
    }

    /// Wake the reconciler ahead of its next interval.
    pub fn kick(&self) {
        self.kick.notify_one();
    }

    /// One full pass over every lease.
    pub async fn tick(&self) {
        let leases = match self.store.list_leases() {
            Ok(leases) => leases,
            Err(e) => {
                tracing::error!(error = %e, "reconciler could not list leases");
                return;
            }
        };
        for lease in leases {
            if lease.converged() {
                continue;
            }
            if let Err(e) = self.reconcile_lease(lease).await {
                tracing::warn!(error = %e, "reconcile step failed");
            }
        }
        self.pass_done.notify_waiters();
    }

    /// Block until the lease converges (observed matches desired, or the
    /// lease is parked in `error`). Fails `Conflict` on deadline.
    pub async fn await_converged(&self, lease_id: uuid::Uuid) -> Result<SandboxLease> {
        let deadline = Duration::from_secs(self.config.converge_timeout_secs.max(1));
        let started = tokio::time::Instant::now();
        loop {
            // Arm the waiter before checking state so a pass finishing
            // between the check and the await is not missed.
            let notified = self.pass_done.notified();
            let lease = self
                .store
                .get_lease(lease_id)?
                .ok_or_else(|| Error::NotFound(format!("lease {lease_id}")))?;
            if lease.converged() {
                return Ok(lease);
            }
            self.kick();
            let remaining = deadline
                .checked_sub(started.elapsed())
                .ok_or_else(|| Error::Conflict(format!("lease {lease_id} did not converge")))?;
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Err(Error::Conflict(format!("lease {lease_id} did not converge")));
            }
        }
    }

    // ── One transition per lease per tick ──────────────────────────

    async fn reconcile_lease(&self, mut lease: SandboxLease) -> Result<()> {
        let provider = match self.providers.get(&lease.provider) {
            Ok(p) => p,
            Err(e) => {
                lease.observed_state = ObservedState::Error;
                lease.last_error = Some(e.to_string());
                self.store.update_lease(&lease)?;
                self.record(&lease, "error", serde_json::json!({"message": e.to_string()}));
                return Ok(());
            }
        };

        let step = match (lease.desired_state, lease.observed_state) {
            (DesiredState::Active, ObservedState::Unknown | ObservedState::Destroyed) => {
                self.step_create(&mut lease, provider.as_ref()).await
            }
            (DesiredState::Active, ObservedState::Provisioning) => {
                self.step_status(&mut lease, provider.as_ref()).await
            }
            (DesiredState::Paused, ObservedState::Active) => {
                self.step_pause(&mut lease, provider.as_ref()).await
            }
            (DesiredState::Active, ObservedState::Paused) => {
                self.step_resume(&mut lease, provider.as_ref()).await
            }
            (DesiredState::Destroyed, observed) if observed != ObservedState::Destroyed => {
                self.step_destroy(&mut lease, provider.as_ref()).await
            }
            _ => return Ok(()),
        };

        if let Err(e) = step {
            lease.observed_state = ObservedState::Error;
            lease.last_error = Some(e.to_string());
            self.record(&lease, "error", serde_json::json!({"message": e.to_string()}));
        } else {
            lease.last_error = None;
        }
        self.store.update_lease(&lease)?;
        Ok(())
    }

    async fn step_create(&self, lease: &mut SandboxLease, provider: &dyn SandboxProvider) -> Result<()> {
        let config = SandboxConfig::default();
        let instance_id = self
            .with_provider_retries("create", || provider.create(&config))
            .await?;
        self.record(lease, "create", serde_json::json!({"instance_id": instance_id}));
        lease.instance_id = Some(instance_id);
        lease.observed_state = ObservedState::Provisioning;
        Ok(())
    }

    async fn step_status(&self, lease: &mut SandboxLease, provider: &dyn SandboxProvider) -> Result<()> {
        let instance_id = lease
            .instance_id
            .clone()
            .ok_or_else(|| Error::Corruption(format!("lease {} provisioning without instance", lease.lease_id)))?;
        let state = self
            .with_provider_retries("status", || provider.status(&instance_id))
            .await?;
        self.record(lease, "status", serde_json::json!({"state": state.to_observed().as_str()}));
        lease.observed_state = state.to_observed();
        Ok(())
    }

    async fn step_pause(&self, lease: &mut SandboxLease, provider: &dyn SandboxProvider) -> Result<()> {
        let instance_id = require_instance(lease)?;
        self.with_provider_retries("pause", || provider.pause(&instance_id))
            .await?;
        self.record(lease, "pause", serde_json::json!({"instance_id": instance_id}));
        lease.observed_state = ObservedState::Paused;
        Ok(())
    }

    async fn step_resume(&self, lease: &mut SandboxLease, provider: &dyn SandboxProvider) -> Result<()> {
        let instance_id = require_instance(lease)?;
        self.with_provider_retries("resume", || provider.resume(&instance_id))
            .await?;
        self.record(lease, "resume", serde_json::json!({"instance_id": instance_id}));
        lease.observed_state = ObservedState::Active;
        Ok(())
    }

    async fn step_destroy(&self, lease: &mut SandboxLease, provider: &dyn SandboxProvider) -> Result<()> {
        if let Some(instance_id) = lease.instance_id.clone() {
            self.with_provider_retries("destroy", || provider.destroy(&instance_id))
                .await?;
            self.record(lease, "destroy", serde_json::json!({"instance_id": instance_id}));
        }
        lease.observed_state = ObservedState::Destroyed;
        Ok(())
    }

    /// Retry a provider call on transient failure with jittered backoff.
    async fn with_provider_retries<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let attempts = self.config.provider_retries.max(1);
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                    let base_ms = 50u64.saturating_mul(1 << attempt.min(5));
                    let jitter_ms = rand::thread_rng().gen_range(0..=base_ms / 2);
                    tracing::warn!(
                        op = label,
                        attempt = attempt + 1,
                        error = %e,
                        "provider call failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(base_ms + jitter_ms)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn record(&self, lease: &SandboxLease, event_type: &str, payload: serde_json::Value) {
        let event = LeaseEvent {
            lease_id: lease.lease_id,
            provider: lease.provider.clone(),
            event_type: event_type.to_owned(),
            payload,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.record_lease_event(&event) {
            tracing::warn!(error = %e, "failed to record lease event");
        }
    }
}

fn require_instance(lease: &SandboxLease) -> Result<String> {
    lease
        .instance_id
        .clone()
        .ok_or_else(|| Error::Corruption(format!("lease {} has no instance", lease.lease_id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemSandboxProvider;
    use leon_domain::config::SessionPolicyConfig;
    use leon_domain::resolver::ChatSession;
    use leon_store::Database;

    struct Fixture {
        reconciler: Arc<Reconciler>,
        store: Arc<ResolverStore>,
        provider: Arc<MemSandboxProvider>,
    }

    fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let store = Arc::new(ResolverStore::new(db));
        let provider = Arc::new(MemSandboxProvider::new("mem"));
        let manager = Arc::new(ProviderManager::new());
        manager.register(provider.clone());
        let reconciler = Reconciler::new(
            store.clone(),
            manager,
            ReconcilerConfig {
                interval_ms: 10,
                converge_timeout_secs: 2,
                provider_retries: 3,
            },
        );
        Fixture {
            reconciler,
            store,
            provider,
        }
    }

    fn lease(store: &ResolverStore) -> SandboxLease {
        let session = ChatSession::with_policy("t1", &SessionPolicyConfig::default());
        store.create_session(&session).unwrap();
        let lease = SandboxLease::new(session.session_id, "mem");
        store.create_lease(&lease).unwrap();
        lease
    }

    #[tokio::test]
    async fn converges_unknown_to_active() {
        let f = fixture();
        let lease = lease(&f.store);

        // Tick 1: create → provisioning. Tick 2: status → active.
        f.reconciler.tick().await;
        let mid = f.store.get_lease(lease.lease_id).unwrap().unwrap();
        assert_eq!(mid.observed_state, ObservedState::Provisioning);
        assert!(mid.instance_id.is_some());

        f.reconciler.tick().await;
        let done = f.store.get_lease(lease.lease_id).unwrap().unwrap();
        assert_eq!(done.observed_state, ObservedState::Active);
        assert!(done.converged());

        // Each step left a lease event.
        let events = f.store.lease_events(lease.lease_id, 10).unwrap();
        let kinds: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert!(kinds.contains(&"create"));
        assert!(kinds.contains(&"status"));
    }

    #[tokio::test]
    async fn pause_and_resume_transitions() {
        let f = fixture();
        let lease = lease(&f.store);
        f.reconciler.tick().await;
        f.reconciler.tick().await;

        f.store
            .set_desired(lease.lease_id, DesiredState::Paused)
            .unwrap();
        f.reconciler.tick().await;
        let paused = f.store.get_lease(lease.lease_id).unwrap().unwrap();
        assert_eq!(paused.observed_state, ObservedState::Paused);

        f.store
            .set_desired(lease.lease_id, DesiredState::Active)
            .unwrap();
        f.reconciler.tick().await;
        let active = f.store.get_lease(lease.lease_id).unwrap().unwrap();
        assert_eq!(active.observed_state, ObservedState::Active);
    }

    #[tokio::test]
    async fn destroy_clears_instance() {
        let f = fixture();
        let lease = lease(&f.store);
        f.reconciler.tick().await;
        f.reconciler.tick().await;

        f.store
            .set_desired(lease.lease_id, DesiredState::Destroyed)
            .unwrap();
        f.reconciler.tick().await;
        let done = f.store.get_lease(lease.lease_id).unwrap().unwrap();
        assert_eq!(done.observed_state, ObservedState::Destroyed);
        assert_eq!(f.provider.instance_count(), 0);
    }

    #[tokio::test]
    async fn transient_create_failure_is_retried() {
        let f = fixture();
        let lease = lease(&f.store);
        f.provider.fail_next("blip");

        f.reconciler.tick().await;
        let mid = f.store.get_lease(lease.lease_id).unwrap().unwrap();
        // Retried within the same step and succeeded.
        assert_eq!(mid.observed_state, ObservedState::Provisioning);
        assert!(mid.last_error.is_none());
    }

    #[tokio::test]
    async fn unknown_provider_parks_in_error() {
        let f = fixture();
        let session = ChatSession::with_policy("t2", &SessionPolicyConfig::default());
        f.store.create_session(&session).unwrap();
        let bad = SandboxLease::new(session.session_id, "no-such-provider");
        f.store.create_lease(&bad).unwrap();

        f.reconciler.tick().await;
        let parked = f.store.get_lease(bad.lease_id).unwrap().unwrap();
        assert_eq!(parked.observed_state, ObservedState::Error);
        assert!(parked.last_error.is_some());
        assert!(parked.converged());
    }

    #[tokio::test]
    async fn await_converged_with_background_loop() {
        let f = fixture();
        let lease = lease(&f.store);
        let _task = f.reconciler.spawn();

        let converged = f.reconciler.await_converged(lease.lease_id).await.unwrap();
        assert_eq!(converged.observed_state, ObservedState::Active);
    }

    #[tokio::test]
    async fn await_converged_times_out() {
        let db = Database::open_in_memory().unwrap();
        let store = Arc::new(ResolverStore::new(db));
        // No provider registered and no loop: leases in error converge, so
        // craft one that stays pending by never ticking.
        let manager = Arc::new(ProviderManager::new());
        manager.register(Arc::new(MemSandboxProvider::new("mem")));
        let reconciler = Reconciler::new(
            store.clone(),
            manager,
            ReconcilerConfig {
                interval_ms: 10_000,
                converge_timeout_secs: 1,
                provider_retries: 1,
            },
        );

        let session = ChatSession::with_policy("t1", &SessionPolicyConfig::default());
        store.create_session(&session).unwrap();
        let lease = SandboxLease::new(session.session_id, "mem");
        store.create_lease(&lease).unwrap();

        let err = reconciler.await_converged(lease.lease_id).await.unwrap_err();
        assert_eq!(err.kind(), leon_domain::ErrorKind::Conflict);
    }
}
