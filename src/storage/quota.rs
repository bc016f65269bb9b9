use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::RwLock;

use super::registry::Backend;
use super::StoreError;

/// Router-side limits: tighter than the provider's hard caps so a batch
/// in flight cannot push a backend over the real ceiling.
pub const ROUTER_STORAGE_LIMIT_BYTES: u64 = 5 * 1024 * 1024 * 1024;
pub const ROUTER_DAILY_WRITE_LIMIT: u64 = 10_000_000;

/// Provider hard caps. A backend past either is unusable outright.
pub const PROVIDER_ROWS_READ_LIMIT: u64 = 9_000_000;
pub const PROVIDER_STORAGE_LIMIT_BYTES: u64 = 4_000_000_000;

const WARNING_FRACTION: f64 = 0.75;
const CRITICAL_FRACTION: f64 = 0.90;
const USAGE_CACHE_TTL: Duration = Duration::from_secs(300);
const USAGE_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Usage figures for one backend, as reported by the provider. Missing or
/// null fields read as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Usage {
    pub storage_bytes: u64,
    pub rows_written: u64,
    pub rows_read: u64,
}

#[derive(Debug, Deserialize)]
struct UsageResponse {
    database: UsageDatabase,
}

#[derive(Debug, Deserialize)]
struct UsageDatabase {
    total: UsageTotals,
}

#[derive(Debug, Default, Deserialize)]
struct UsageTotals {
    #[serde(default)]
    storage_bytes: Option<u64>,
    #[serde(default)]
    rows_written: Option<u64>,
    #[serde(default)]
    rows_read: Option<u64>,
}

impl From<UsageTotals> for Usage {
    fn from(totals: UsageTotals) -> Self {
        Usage {
            storage_bytes: totals.storage_bytes.unwrap_or(0),
            rows_written: totals.rows_written.unwrap_or(0),
            rows_read: totals.rows_read.unwrap_or(0),
        }
    }
}

/// How close a backend is to its limits. Warning and Critical are
/// advisory; only Unusable blocks routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaLevel {
    Healthy,
    Warning,
    Critical,
    Unusable,
}

/// Polls the provider usage API and caches the answers. With no API base
/// configured (local development, tests), every backend reads as empty.
pub struct QuotaMonitor {
    client: reqwest::Client,
    api_base: Option<String>,
    daily_write_limit: u64,
    cache: RwLock<HashMap<String, (Usage, Instant)>>,
}

impl QuotaMonitor {
    pub fn new(api_base: Option<String>, daily_write_limit: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(USAGE_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        QuotaMonitor {
            client,
            api_base,
            daily_write_limit,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Current usage for a backend, served from cache while fresh.
    pub async fn usage(&self, backend: &Backend) -> Result<Usage, StoreError> {
        {
            let cache = self.cache.read().await;
            if let Some((usage, fetched)) = cache.get(&backend.name) {
                if fetched.elapsed() < USAGE_CACHE_TTL {
                    return Ok(*usage);
                }
            }
        }

        let usage = self.fetch_usage(backend).await?;
        self.cache
            .write()
            .await
            .insert(backend.name.clone(), (usage, Instant::now()));
        Ok(usage)
    }

    async fn fetch_usage(&self, backend: &Backend) -> Result<Usage, StoreError> {
        let Some(base) = &self.api_base else {
            return Ok(Usage::default());
        };

        let url = format!(
            "{}/v1/organizations/{}/databases/{}/usage",
            base.trim_end_matches('/'),
            backend.organization,
            backend.name
        );
        let response = self
            .client
            .get(&url)
            .bearer_auth(&backend.api_key)
            .send()
            .await?
            .error_for_status()?;
        let body: UsageResponse = response.json().await?;
        Ok(body.database.total.into())
    }

    /// Drop all cached usage and re-query every backend concurrently.
    pub async fn force_refresh(&self, backends: &[std::sync::Arc<Backend>]) {
        self.cache.write().await.clear();
        let fetches = backends.iter().map(|backend| self.usage(backend));
        for (backend, result) in backends.iter().zip(futures::future::join_all(fetches).await) {
            if let Err(error) = result {
                tracing::warn!(backend = %backend.name, %error, "usage refresh failed");
            }
        }
    }

    /// Provider-level gate: false once the hard caps are hit.
    pub fn provider_usable(&self, usage: Usage) -> bool {
        usage.rows_read < PROVIDER_ROWS_READ_LIMIT
            && usage.storage_bytes < PROVIDER_STORAGE_LIMIT_BYTES
    }

    /// Router-level gate used by backend selection. Storage is capped by
    /// the backend's own quota (5 GiB default); writes by the daily and
    /// monthly knobs, which default to the same figure but are tracked
    /// independently.
    pub fn within_router_limits(&self, backend: &Backend, usage: Usage) -> bool {
        usage.storage_bytes < backend.storage_quota_bytes.min(ROUTER_STORAGE_LIMIT_BYTES)
            && usage.rows_written < self.daily_write_limit
            && usage.rows_written < backend.monthly_write_limit
    }

    /// Advisory classification surfaced to observers. Does not block
    /// writes below Unusable.
    pub fn classify(&self, backend: &Backend, usage: Usage) -> QuotaLevel {
        if !self.within_router_limits(backend, usage) || !self.provider_usable(usage) {
            return QuotaLevel::Unusable;
        }
        let storage_fraction = usage.storage_bytes as f64 / ROUTER_STORAGE_LIMIT_BYTES as f64;
        let write_fraction = usage.rows_written as f64 / self.daily_write_limit as f64;
        let worst = storage_fraction.max(write_fraction);
        if worst >= CRITICAL_FRACTION {
            QuotaLevel::Critical
        } else if worst >= WARNING_FRACTION {
            QuotaLevel::Warning
        } else {
            QuotaLevel::Healthy
        }
    }
}
