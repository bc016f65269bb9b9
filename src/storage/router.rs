use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::quota::{QuotaLevel, QuotaMonitor};
use super::registry::{Backend, Registry};
use super::{PoolKind, StoreError};

/// Quota-aware round-robin selector over the two backend pools. Cursors
/// advance atomically so concurrent writers spread across backends.
pub struct Router {
    registry: Arc<Registry>,
    monitor: Arc<QuotaMonitor>,
    crawl_cursor: AtomicUsize,
    backlink_cursor: AtomicUsize,
}

/// Point-in-time view of one backend for status output.
#[derive(Debug, Clone)]
pub struct BackendHealth {
    pub name: String,
    pub pool: PoolKind,
    pub level: QuotaLevel,
    pub storage_bytes: u64,
    pub rows_written: u64,
    pub reachable: bool,
}

impl Router {
    pub fn new(registry: Arc<Registry>, monitor: Arc<QuotaMonitor>) -> Self {
        Router {
            registry,
            monitor,
            crawl_cursor: AtomicUsize::new(0),
            backlink_cursor: AtomicUsize::new(0),
        }
    }

    pub fn monitor(&self) -> &QuotaMonitor {
        &self.monitor
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn cursor(&self, kind: PoolKind) -> &AtomicUsize {
        match kind {
            PoolKind::Crawl => &self.crawl_cursor,
            PoolKind::Backlink => &self.backlink_cursor,
        }
    }

    /// Pick the next backend under quota. Walks the cycle at most one
    /// full revolution, skipping backends already tested in this call,
    /// and re-evaluates quota for each candidate. Fails only when every
    /// backend in the pool is over its limits or unreachable.
    pub async fn choose(&self, kind: PoolKind) -> Result<Arc<Backend>, StoreError> {
        let pool = self.registry.pool(kind);
        if pool.is_empty() {
            return Err(StoreError::NoAvailableBackend(kind));
        }

        let cursor = self.cursor(kind);
        let mut tested: HashSet<&str> = HashSet::with_capacity(pool.len());

        for _ in 0..pool.len() {
            let index = cursor.fetch_add(1, Ordering::Relaxed) % pool.len();
            let backend = &pool[index];
            if !tested.insert(backend.name.as_str()) {
                continue;
            }
            match self.monitor.usage(backend).await {
                Ok(usage) if self.monitor.within_router_limits(backend, usage) => {
                    return Ok(backend.clone());
                }
                Ok(_) => {
                    tracing::debug!(backend = %backend.name, "backend over quota, skipping");
                }
                Err(error) => {
                    tracing::warn!(backend = %backend.name, %error, "usage check failed, skipping");
                }
            }
        }

        Err(StoreError::NoAvailableBackend(kind))
    }

    /// Backend by name, for writes that must land where a session lives.
    /// Still refuses a backend that is over quota.
    pub async fn backend_for(&self, name: &str, kind: PoolKind) -> Result<Arc<Backend>, StoreError> {
        let backend = self
            .registry
            .pool(kind)
            .iter()
            .find(|b| b.name == name)
            .cloned()
            .ok_or_else(|| StoreError::UnknownBackend(name.to_string(), kind))?;

        let usage = self.monitor.usage(&backend).await?;
        if !self.monitor.within_router_limits(&backend, usage) {
            return Err(StoreError::OverQuota(backend.name.clone()));
        }
        Ok(backend)
    }

    /// Re-query every backend and drop cached usage.
    pub async fn force_refresh(&self) {
        let backends: Vec<Arc<Backend>> = self.registry.all().cloned().collect();
        self.monitor.force_refresh(&backends).await;
    }

    /// Usage snapshot of every backend, for the status command.
    pub async fn health_snapshot(&self) -> Vec<BackendHealth> {
        let mut snapshot = Vec::new();
        for (kind, pool) in [
            (PoolKind::Crawl, &self.registry.crawl),
            (PoolKind::Backlink, &self.registry.backlink),
        ] {
            for backend in pool {
                let entry = match self.monitor.usage(backend).await {
                    Ok(usage) => BackendHealth {
                        name: backend.name.clone(),
                        pool: kind,
                        level: self.monitor.classify(backend, usage),
                        storage_bytes: usage.storage_bytes,
                        rows_written: usage.rows_written,
                        reachable: true,
                    },
                    Err(_) => BackendHealth {
                        name: backend.name.clone(),
                        pool: kind,
                        level: QuotaLevel::Unusable,
                        storage_bytes: 0,
                        rows_written: 0,
                        reachable: false,
                    },
                };
                snapshot.push(entry);
            }
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::registry::test_descriptor;

    async fn router_with(descriptors: Vec<crate::config::DbDescriptor>, api_base: Option<String>) -> Router {
        let registry = Arc::new(Registry::open(descriptors, 10_000_000).await.unwrap());
        let monitor = Arc::new(QuotaMonitor::new(api_base, 10_000_000));
        Router::new(registry, monitor)
    }

    #[tokio::test]
    async fn round_robin_alternates_backends() {
        let router = router_with(
            vec![test_descriptor("a", 2), test_descriptor("b", 2)],
            None,
        )
        .await;

        let first = router.choose(PoolKind::Crawl).await.unwrap();
        let second = router.choose(PoolKind::Crawl).await.unwrap();
        let third = router.choose(PoolKind::Crawl).await.unwrap();
        assert_eq!(first.name, "a");
        assert_eq!(second.name, "b");
        assert_eq!(third.name, "a");
    }

    #[tokio::test]
    async fn empty_pool_is_exhaustion() {
        let router = router_with(vec![test_descriptor("a", 2)], None).await;
        let err = router.choose(PoolKind::Backlink).await.unwrap_err();
        assert!(matches!(err, StoreError::NoAvailableBackend(PoolKind::Backlink)));
        assert!(err.is_quota_exhaustion());
    }

    #[tokio::test]
    async fn over_quota_backends_are_skipped_until_refresh() {
        let mut server = mockito::Server::new_async().await;
        let over = r#"{"database":{"total":{"storage_bytes":0,"rows_written":9500000,"rows_read":0}}}"#;
        let under = r#"{"database":{"total":{"storage_bytes":0,"rows_written":1000000,"rows_read":0}}}"#;

        // Both backends report over the write limit, then one recovers.
        let mock_a1 = server
            .mock("GET", "/v1/organizations/org/databases/a/usage")
            .with_body(over)
            .create_async()
            .await;
        let mock_b = server
            .mock("GET", "/v1/organizations/org/databases/b/usage")
            .with_body(over)
            .expect_at_least(1)
            .create_async()
            .await;

        let mut desc_a = test_descriptor("a", 2);
        let mut desc_b = test_descriptor("b", 2);
        // Daily write limit for the router is 10M; 9.5M is under it, so
        // tighten the per-backend monthly knob to force exhaustion.
        desc_a.monthly_write_limit = Some(9_000_000);
        desc_b.monthly_write_limit = Some(9_000_000);

        let router = router_with(vec![desc_a, desc_b], Some(server.url())).await;

        let err = router.choose(PoolKind::Crawl).await.unwrap_err();
        assert!(matches!(err, StoreError::NoAvailableBackend(PoolKind::Crawl)));
        mock_a1.assert_async().await;

        // Backend a recovers; a refresh must make it routable again.
        let mock_a2 = server
            .mock("GET", "/v1/organizations/org/databases/a/usage")
            .with_body(under)
            .create_async()
            .await;
        router.force_refresh().await;

        let chosen = router.choose(PoolKind::Crawl).await.unwrap();
        assert_eq!(chosen.name, "a");
        mock_a2.assert_async().await;
        mock_b.assert_async().await;
    }

    #[tokio::test]
    async fn backend_for_finds_named_backend() {
        let router = router_with(
            vec![test_descriptor("a", 2), test_descriptor("b", 2)],
            None,
        )
        .await;

        let backend = router.backend_for("b", PoolKind::Crawl).await.unwrap();
        assert_eq!(backend.name, "b");

        let missing = router.backend_for("zzz", PoolKind::Crawl).await;
        assert!(matches!(missing, Err(StoreError::UnknownBackend(_, _))));
    }
}
