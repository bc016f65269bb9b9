use std::sync::Arc;

use crate::config::DbDescriptor;

use super::engine::{Engine, SqliteEngine};
use super::{PoolKind, StoreError};

const GIB: u64 = 1024 * 1024 * 1024;
const DEFAULT_STORAGE_QUOTA_BYTES: u64 = 5 * GIB;

/// One remote database in the routed pool, with its quota knobs and a
/// live engine handle.
pub struct Backend {
    pub name: String,
    pub url: String,
    pub auth_token: String,
    pub organization: String,
    pub api_key: String,
    pub monthly_write_limit: u64,
    pub storage_quota_bytes: u64,
    pub engine: Arc<dyn Engine>,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name)
            .field("organization", &self.organization)
            .field("monthly_write_limit", &self.monthly_write_limit)
            .field("storage_quota_bytes", &self.storage_quota_bytes)
            .finish()
    }
}

/// The two immutable backend pools, built once at startup. `cat=2`
/// descriptors land in the crawl pool, `cat=1` in the backlink pool;
/// anything else is rejected up front.
pub struct Registry {
    pub crawl: Vec<Arc<Backend>>,
    pub backlink: Vec<Arc<Backend>>,
}

impl Registry {
    pub async fn open(
        descriptors: Vec<DbDescriptor>,
        default_monthly_write_limit: u64,
    ) -> Result<Self, StoreError> {
        let mut crawl = Vec::new();
        let mut backlink = Vec::new();

        for descriptor in descriptors {
            let engine: Arc<dyn Engine> = Arc::new(
                SqliteEngine::connect(&descriptor.url, &descriptor.auth_token).await?,
            );
            let backend = Arc::new(Backend {
                monthly_write_limit: descriptor
                    .monthly_write_limit
                    .unwrap_or(default_monthly_write_limit),
                storage_quota_bytes: descriptor
                    .storage_quota_gb
                    .map(|gb| (gb * GIB as f64) as u64)
                    .unwrap_or(DEFAULT_STORAGE_QUOTA_BYTES),
                name: descriptor.name,
                url: descriptor.url,
                auth_token: descriptor.auth_token,
                organization: descriptor.organization,
                api_key: descriptor.api_key,
                engine,
            });
            match descriptor_pool(descriptor.cat) {
                Some(PoolKind::Crawl) => crawl.push(backend),
                Some(PoolKind::Backlink) => backlink.push(backend),
                None => {
                    tracing::warn!(name = %backend.name, cat = descriptor.cat, "skipping backend with unknown category");
                }
            }
        }

        tracing::info!(
            crawl = crawl.len(),
            backlink = backlink.len(),
            "backend registry loaded"
        );
        Ok(Registry { crawl, backlink })
    }

    pub fn pool(&self, kind: PoolKind) -> &[Arc<Backend>] {
        match kind {
            PoolKind::Crawl => &self.crawl,
            PoolKind::Backlink => &self.backlink,
        }
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<Backend>> {
        self.crawl.iter().chain(self.backlink.iter())
    }
}

fn descriptor_pool(cat: u8) -> Option<PoolKind> {
    match cat {
        1 => Some(PoolKind::Backlink),
        2 => Some(PoolKind::Crawl),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) fn test_descriptor(name: &str, cat: u8) -> DbDescriptor {
    // In-memory engines keep router and store tests hermetic.
    serde_json::from_value(serde_json::json!({
        "name": name,
        "url": "sqlite::memory:",
        "auth_token": "token",
        "apikey": "key",
        "organization": "org",
        "cat": cat,
    }))
    .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn partitions_pools_by_category() {
        let registry = Registry::open(
            vec![
                test_descriptor("crawl-1", 2),
                test_descriptor("crawl-2", 2),
                test_descriptor("backlink-1", 1),
                test_descriptor("weird", 9),
            ],
            10_000_000,
        )
        .await
        .unwrap();

        assert_eq!(registry.crawl.len(), 2);
        assert_eq!(registry.backlink.len(), 1);
        assert_eq!(registry.pool(PoolKind::Crawl)[0].name, "crawl-1");
        assert_eq!(registry.all().count(), 3);
    }

    #[tokio::test]
    async fn applies_quota_defaults() {
        let registry = Registry::open(vec![test_descriptor("c", 2)], 10_000_000)
            .await
            .unwrap();
        let backend = &registry.crawl[0];
        assert_eq!(backend.monthly_write_limit, 10_000_000);
        assert_eq!(backend.storage_quota_bytes, 5 * GIB);
    }
}
