//! Orphan detection — instances no lease points at.
//!
//! The scan asks each provider for its live instances and joins against
//! the lease table. A provider that cannot answer (partial outage) is
//! skipped and surfaced in the report instead of failing the whole scan.

use serde::Serialize;

use leon_store::ResolverStore;

use crate::manager::ProviderManager;

#[derive(Debug, Clone, Serialize)]
pub struct OrphanInstance {
    pub provider: String,
    pub instance_id: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct OrphanReport {
    pub orphans: Vec<OrphanInstance>,
    /// Providers that failed to list, with the error text.
    pub provider_errors: Vec<ProviderError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderError {
    pub provider: String,
    pub error: String,
}

pub async fn scan_orphans(manager: &ProviderManager, store: &ResolverStore) -> OrphanReport {
    let mut report = OrphanReport::default();

    for name in manager.names() {
        let provider = match manager.get(&name) {
            Ok(p) => p,
            Err(_) => continue,
        };
        let instances = match provider.list_instances().await {
            Ok(instances) => instances,
            Err(e) => {
                tracing::warn!(provider = %name, error = %e, "orphan scan skipped provider");
                report.provider_errors.push(ProviderError {
                    provider: name.clone(),
                    error: e.to_string(),
                });
                continue;
            }
        };
        let leased: std::collections::HashSet<String> = match store.leased_instance_ids(&name) {
            Ok(ids) => ids.into_iter().collect(),
            Err(e) => {
                report.provider_errors.push(ProviderError {
                    provider: name.clone(),
                    error: e.to_string(),
                });
                continue;
            }
        };
        for instance_id in instances {
            if !leased.contains(&instance_id) {
                report.orphans.push(OrphanInstance {
                    provider: name.clone(),
                    instance_id,
                });
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemSandboxProvider;
    use crate::provider::SandboxConfig;
    use crate::provider::SandboxProvider as _;
    use leon_domain::config::SessionPolicyConfig;
    use leon_domain::resolver::{ChatSession, SandboxLease};
    use leon_store::Database;
    use std::sync::Arc;

    #[tokio::test]
    async fn detects_unleased_instances() {
        let store = ResolverStore::new(Database::open_in_memory().unwrap());
        let provider = Arc::new(MemSandboxProvider::new("mem"));
        let manager = ProviderManager::new();
        manager.register(provider.clone());

        // One leased instance.
        let session = ChatSession::with_policy("t1", &SessionPolicyConfig::default());
        store.create_session(&session).unwrap();
        let leased_id = provider.create(&SandboxConfig::default()).await.unwrap();
        let mut lease = SandboxLease::new(session.session_id, "mem");
        lease.instance_id = Some(leased_id);
        store.create_lease(&lease).unwrap();

        // One drifted instance nobody leases.
        let orphan_id = provider.create_detached();

        let report = scan_orphans(&manager, &store).await;
        assert!(report.provider_errors.is_empty());
        assert_eq!(report.orphans.len(), 1);
        assert_eq!(report.orphans[0].instance_id, orphan_id);
        assert_eq!(report.orphans[0].provider, "mem");
    }

    #[tokio::test]
    async fn provider_outage_is_surfaced_not_fatal() {
        let store = ResolverStore::new(Database::open_in_memory().unwrap());
        let healthy = Arc::new(MemSandboxProvider::new("healthy"));
        let flaky = Arc::new(MemSandboxProvider::new("flaky"));
        let manager = ProviderManager::new();
        manager.register(healthy.clone());
        manager.register(flaky.clone());

        let visible = healthy.create_detached();
        flaky.create_detached();
        flaky.fail_next("listing down");

        let report = scan_orphans(&manager, &store).await;
        assert_eq!(report.provider_errors.len(), 1);
        assert_eq!(report.provider_errors[0].provider, "flaky");
        assert_eq!(report.orphans.len(), 1);
        assert_eq!(report.orphans[0].instance_id, visible);
    }

    #[tokio::test]
    async fn empty_world_is_quiet() {
        let store = ResolverStore::new(Database::open_in_memory().unwrap());
        let manager = ProviderManager::new();
        manager.register(Arc::new(MemSandboxProvider::new("mem")));

        let report = scan_orphans(&manager, &store).await;
        assert!(report.orphans.is_empty());
        assert!(report.provider_errors.is_empty());
    }
}
