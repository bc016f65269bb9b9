pub mod backlinks;
pub mod config;
pub mod crawler;
pub mod logring;
pub mod models;
pub mod progress;
pub mod storage;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::crawler::{AutoBatchCrawler, CrawlEngine, Fetcher, RobotsCache};
use crate::progress::ProgressStore;
use crate::storage::{PageStore, QuotaMonitor, Registry, Router};

pub use crate::crawler::{CrawlOptions, CrawlRunError};

/// Everything a run needs, wired together from settings: registry,
/// router, store, fetcher, and engine.
pub struct App {
    pub settings: Settings,
    pub store: Arc<PageStore>,
    pub engine: Arc<CrawlEngine>,
    pub cancel: CancellationToken,
}

impl App {
    /// Load the backend registry, create schema everywhere, and build
    /// the crawl pipeline.
    pub async fn bootstrap(settings: Settings, cancel: CancellationToken) -> Result<Self, AppError> {
        let descriptors = config::load_db_descriptors(&settings.databases_path)?;
        let registry = Arc::new(
            Registry::open(descriptors, settings.monthly_write_limit).await?,
        );
        storage::schema::initialize(&registry).await?;

        let monitor = Arc::new(QuotaMonitor::new(
            settings.usage_api_url.clone(),
            settings.daily_write_limit,
        ));
        let router = Arc::new(Router::new(registry, monitor));
        let store = Arc::new(PageStore::new(router));

        let robots = Arc::new(RobotsCache::new());
        let fetcher = Arc::new(Fetcher::new(&settings, robots, cancel.clone()));
        let engine = Arc::new(CrawlEngine::new(store.clone(), fetcher, &settings).await?);

        Ok(App {
            settings,
            store,
            engine,
            cancel,
        })
    }

    pub fn fetcher(&self) -> Arc<Fetcher> {
        Arc::new(Fetcher::new(
            &self.settings,
            Arc::new(RobotsCache::new()),
            self.cancel.clone(),
        ))
    }

    pub fn batch_crawler(&self) -> AutoBatchCrawler {
        AutoBatchCrawler::new(
            self.engine.clone(),
            self.store.clone(),
            ProgressStore::new(&self.settings.progress_path),
            self.settings.clone(),
            self.cancel.clone(),
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Store(#[from] storage::StoreError),
}
