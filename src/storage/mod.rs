pub mod engine;
pub mod quota;
pub mod registry;
pub mod router;
pub mod schema;
pub mod store;

pub use engine::{Engine, SqlValue, SqliteEngine};
pub use quota::{QuotaLevel, QuotaMonitor, Usage};
pub use registry::{Backend, Registry};
pub use router::Router;
pub use store::PageStore;

use std::fmt;

use thiserror::Error;

/// Which backend pool an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    Crawl,
    Backlink,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolKind::Crawl => write!(f, "crawl"),
            PoolKind::Backlink => write!(f, "backlink"),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sql(#[from] sqlx::Error),
    #[error("no available {0} backend under quota")]
    NoAvailableBackend(PoolKind),
    #[error("unknown {1} backend: {0}")]
    UnknownBackend(String, PoolKind),
    #[error("backend {0} is over quota")]
    OverQuota(String),
    #[error("crawl session {0} does not exist in backend {1}")]
    SessionNotFound(i64, String),
    #[error("usage API request failed: {0}")]
    Usage(#[from] reqwest::Error),
    #[error("malformed row: {0}")]
    Decode(String),
}

impl StoreError {
    /// True when retrying after a quota refresh could succeed.
    pub fn is_quota_exhaustion(&self) -> bool {
        matches!(self, StoreError::NoAvailableBackend(_))
    }
}
