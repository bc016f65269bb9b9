pub mod fetcher;
pub mod parser;
pub mod robots;
pub mod urls;

pub use fetcher::{FetchError, Fetcher};
pub use parser::Parser;
pub use robots::RobotsCache;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::models::{
    BatchOutcome, ContentKind, ErrorKind, ErrorRecord, PageRecord, RunSummary, SessionStatus,
};
use crate::progress::{ProgressError, ProgressStore};
use crate::storage::{PageStore, StoreError};

#[derive(Debug, Error)]
pub enum CrawlRunError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Progress(#[from] ProgressError),
    #[error("no URLs found in the backlink store")]
    NoUrls,
}

/// What happened to one URL inside a batch.
#[derive(Debug)]
pub enum PageOutcome {
    /// Fetched, parsed, and written.
    Stored(Box<PageRecord>),
    /// Body was byte-identical to an already-stored page; nothing new
    /// written, but the known row's crawl_time was refreshed.
    DuplicateContent,
    /// Crawled recently; the recrawl window has not elapsed.
    SkippedRecent,
    /// Parsed but deliberately not stored (noindex, foreign canonical).
    Dropped(&'static str),
    /// Fetch, parse, or persistence failure.
    Failed(ErrorKind),
}

/// Fetch-parse-store pipeline for single URLs, with the shared visited
/// and content-hash sets. Shared across batch workers behind an Arc.
pub struct CrawlEngine {
    store: Arc<PageStore>,
    fetcher: Arc<Fetcher>,
    recrawl_days: i64,
    visited: RwLock<HashSet<String>>,
    hashes: RwLock<HashSet<String>>,
}

impl CrawlEngine {
    /// Build the engine, seeding visited URLs and content hashes from
    /// every crawl backend so restarts keep deduplicating.
    pub async fn new(
        store: Arc<PageStore>,
        fetcher: Arc<Fetcher>,
        settings: &Settings,
    ) -> Result<Self, StoreError> {
        let (visited, hashes) = store.load_crawl_state().await?;
        tracing::info!(
            visited = visited.len(),
            hashes = hashes.len(),
            "crawl state loaded"
        );
        Ok(CrawlEngine {
            store,
            fetcher,
            recrawl_days: settings.recrawl_days,
            visited: RwLock::new(visited),
            hashes: RwLock::new(hashes),
        })
    }

    async fn needs_recrawl(&self, url: &str) -> bool {
        match self.store.last_crawl_time(url).await {
            Ok(Some(last)) => {
                let days = Utc::now().signed_duration_since(last).num_days();
                days >= self.recrawl_days
            }
            Ok(None) => true,
            Err(error) => {
                tracing::warn!(url, %error, "last crawl time lookup failed");
                true
            }
        }
    }

    /// Crawl one URL end to end. Failures are converted into recorded
    /// errors and a Failed outcome; this never brings down a worker.
    pub async fn crawl_url(&self, raw_url: &str, session_id: i64, db_name: &str) -> PageOutcome {
        let Some(url) = urls::normalize(raw_url) else {
            tracing::debug!(url = raw_url, "invalid URL skipped");
            return PageOutcome::Failed(ErrorKind::ClientError);
        };

        let already_visited = { self.visited.read().await.contains(&url) };
        if already_visited && !self.needs_recrawl(&url).await {
            return PageOutcome::SkippedRecent;
        }

        let fetched = match self.fetcher.fetch(&url).await {
            Ok(page) => page,
            Err(error) => {
                let kind = error.kind();
                self.record_error(
                    ErrorRecord {
                        url: url.clone(),
                        kind,
                        message: error.to_string(),
                        status_code: error.status_code(),
                    },
                    session_id,
                    db_name,
                )
                .await;
                return PageOutcome::Failed(kind);
            }
        };

        // Body-level deduplication before any parsing.
        if self.hashes.read().await.contains(&fetched.content_hash) {
            tracing::debug!(url = %fetched.url, "duplicate content");
            if let Err(error) = self.store.touch_crawl_time(&fetched.url).await {
                tracing::warn!(url = %fetched.url, %error, "crawl_time touch failed");
            }
            self.mark_visited([url.as_str(), fetched.url.as_str()]).await;
            return PageOutcome::DuplicateContent;
        }

        let (content_type, file_extension) = urls::classify(&fetched.url);
        let record = if content_type.is_html() {
            let parsed = Parser::parse(&fetched.text, &fetched.url);
            if parsed.noindex() {
                tracing::debug!(url = %fetched.url, "noindex, dropping page");
                self.mark_visited([url.as_str(), fetched.url.as_str()]).await;
                return PageOutcome::Dropped("noindex");
            }
            if let Some(canonical) = &parsed.canonical_url {
                let canonical_visited =
                    { self.visited.read().await.contains(canonical) };
                if canonical != &fetched.url
                    && canonical_visited
                    && !self.needs_recrawl(canonical).await
                {
                    tracing::debug!(url = %fetched.url, canonical = %canonical, "canonical already crawled");
                    self.mark_visited([url.as_str(), fetched.url.as_str()]).await;
                    return PageOutcome::Dropped("canonical");
                }
            }
            build_html_record(&fetched, parsed, content_type, file_extension)
        } else {
            build_file_record(&fetched, content_type, file_extension)
        };

        let canonical = record.canonical_url.clone();
        if let Err(error) = self.store.store_page(&record, session_id, db_name).await {
            tracing::error!(url = %record.url, %error, "page store failed");
            return PageOutcome::Failed(ErrorKind::ClientError);
        }

        self.hashes.write().await.insert(record.content_hash.clone());
        let mut to_mark = vec![url.as_str(), record.url.as_str()];
        if let Some(canonical) = canonical.as_deref() {
            to_mark.push(canonical);
        }
        self.mark_visited(to_mark).await;

        tracing::info!(
            url = %record.url,
            status = record.http_status_code,
            words = record.word_count,
            "page stored"
        );
        PageOutcome::Stored(Box::new(record))
    }

    async fn mark_visited<'a>(&self, urls: impl IntoIterator<Item = &'a str>) {
        let mut visited = self.visited.write().await;
        for url in urls {
            visited.insert(url.to_string());
        }
    }

    async fn record_error(&self, record: ErrorRecord, session_id: i64, db_name: &str) {
        tracing::warn!(url = %record.url, kind = record.kind.as_str(), "crawl failed");
        if let Err(error) = self.store.store_error(&record, session_id, db_name).await {
            tracing::error!(url = %record.url, %error, "error record store failed");
        }
    }
}

fn build_html_record(
    fetched: &fetcher::FetchedPage,
    parsed: parser::ParsedPage,
    content_type: ContentKind,
    file_extension: Option<String>,
) -> PageRecord {
    PageRecord {
        url: fetched.url.clone(),
        original_url: (fetched.original_url != fetched.url)
            .then(|| fetched.original_url.clone()),
        redirect_chain: fetched.redirect_chain.clone(),
        title: parsed.title,
        meta_description: parsed.meta_description,
        content_text: Some(parsed.content_text),
        content_html: Some(fetched.text.clone()),
        content_hash: fetched.content_hash.clone(),
        word_count: parsed.word_count as i64,
        page_size: fetched.body.len() as i64,
        http_status_code: fetched.status as i64,
        response_time_ms: fetched.response_time_ms as i64,
        language: parsed.language,
        charset: Some(fetched.charset.to_string()),
        h1_tags: parsed.h1_tags,
        h2_tags: parsed.h2_tags,
        meta_keywords: parsed.meta_keywords,
        canonical_url: parsed.canonical_url,
        robots_meta: parsed.robots_meta,
        internal_links_count: parsed.internal_links_count as i64,
        external_links_count: parsed.external_links_count as i64,
        images_count: parsed.images_count as i64,
        content_type,
        file_extension,
    }
}

/// Non-HTML responses get a synthesized record typed by extension.
fn build_file_record(
    fetched: &fetcher::FetchedPage,
    content_type: ContentKind,
    file_extension: Option<String>,
) -> PageRecord {
    let file_name = fetched
        .url
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string();
    let kind_name = content_type.as_str();
    let mut description = format!("File of type: {kind_name}");
    if let Some(ext) = &file_extension {
        description.push_str(&format!(" ({ext})"));
    }

    PageRecord {
        url: fetched.url.clone(),
        original_url: (fetched.original_url != fetched.url)
            .then(|| fetched.original_url.clone()),
        redirect_chain: fetched.redirect_chain.clone(),
        title: Some(format!("{} File: {file_name}", kind_name.to_uppercase())),
        meta_description: Some(description),
        content_text: Some(format!(
            "This is a {kind_name} file. URL: {}",
            fetched.url
        )),
        content_html: None,
        content_hash: fetched.content_hash.clone(),
        word_count: 0,
        page_size: fetched.body.len() as i64,
        http_status_code: fetched.status as i64,
        response_time_ms: fetched.response_time_ms as i64,
        language: None,
        charset: Some(fetched.charset.to_string()),
        h1_tags: Vec::new(),
        h2_tags: Vec::new(),
        meta_keywords: Vec::new(),
        canonical_url: None,
        robots_meta: None,
        internal_links_count: 0,
        external_links_count: 0,
        images_count: 0,
        content_type,
        file_extension,
    }
}

/// Overrides for a single run, from the command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrawlOptions {
    pub start_page: Option<u32>,
    pub max_pages: Option<u32>,
    pub batch_size: Option<u32>,
}

/// Sequential batch coordinator: draws pages of URLs from the backlink
/// store, fans each batch out to bounded workers, and flushes progress
/// after every committed batch so an interrupted run resumes at the next
/// unprocessed page.
pub struct AutoBatchCrawler {
    engine: Arc<CrawlEngine>,
    store: Arc<PageStore>,
    progress_store: ProgressStore,
    settings: Settings,
    cancel: CancellationToken,
}

impl AutoBatchCrawler {
    pub fn new(
        engine: Arc<CrawlEngine>,
        store: Arc<PageStore>,
        progress_store: ProgressStore,
        settings: Settings,
        cancel: CancellationToken,
    ) -> Self {
        AutoBatchCrawler {
            engine,
            store,
            progress_store,
            settings,
            cancel,
        }
    }

    pub async fn run(&self, options: CrawlOptions) -> Result<RunSummary, CrawlRunError> {
        let mut progress = self.progress_store.load()?;
        let batch_size = options.batch_size.unwrap_or(self.settings.batch_size).max(1);
        progress.batch_size = batch_size;

        let total_urls = self.store.count_unique_urls().await?;
        if total_urls == 0 {
            return Err(CrawlRunError::NoUrls);
        }
        progress.total_urls = total_urls;

        let start_page = options.start_page.unwrap_or(progress.current_page).max(1);
        let first_batch = self.store.urls_batch(start_page, batch_size).await?;
        let session_config = serde_json::json!({
            "crawler_type": "auto_batch",
            "batch_size": batch_size,
            "start_page": start_page,
            "max_pages": options.max_pages,
            "total_urls": total_urls,
        });
        let seeds: Vec<String> = first_batch.iter().take(5).cloned().collect();
        // A session that cannot be created is fatal for the run.
        let (session_id, db_name) = self.store.create_session(&seeds, &session_config).await?;

        progress.current_page = start_page;
        progress.session_id = Some(session_id);
        progress.db_name = Some(db_name.clone());
        self.progress_store.mark_start(&mut progress)?;

        tracing::info!(
            session_id,
            backend = %db_name,
            total_urls,
            batch_size,
            start_page,
            "auto batch crawl starting"
        );

        let started = Instant::now();
        let mut totals = BatchOutcome::default();
        let mut batches = 0u64;
        let mut page = start_page;

        loop {
            if self.cancel.is_cancelled() {
                tracing::info!("stop requested, halting before next batch");
                break;
            }
            if let Some(max_pages) = options.max_pages {
                if batches >= u64::from(max_pages) {
                    break;
                }
            }

            let urls = if page == start_page {
                first_batch.clone()
            } else {
                self.store.urls_batch(page, batch_size).await?
            };
            if urls.is_empty() {
                tracing::info!(page, "no more URLs, crawl finished");
                break;
            }

            let (outcome, completed) = self.crawl_batch(&urls, session_id, &db_name).await;
            totals.absorb(outcome);
            if !completed {
                // Interrupted mid-batch: do not advance the page so the
                // whole batch is redone on resume.
                tracing::info!(page, "batch interrupted, will be retried on resume");
                break;
            }

            batches += 1;
            progress.record_batch(page, outcome);
            self.progress_store.save(&progress)?;
            tracing::info!(
                page,
                processed = outcome.urls_processed,
                successful = outcome.successful,
                failed = outcome.failed,
                "batch committed"
            );
            page += 1;

            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_secs_f64(
                    self.settings.inter_batch_delay_secs.max(0.0),
                )) => {}
            }
        }

        if let Err(error) = self
            .store
            .finish_session(session_id, &db_name, SessionStatus::Completed)
            .await
        {
            tracing::warn!(session_id, %error, "session finish failed");
        }
        self.progress_store.mark_stop(&mut progress)?;

        Ok(RunSummary {
            session_id,
            db_name,
            pages_processed: totals.urls_processed,
            successful: totals.successful,
            failed: totals.failed,
            batches,
            elapsed_s: started.elapsed().as_secs_f64(),
        })
    }

    /// Crawl one batch with bounded concurrency. Returns the tally and
    /// whether the batch ran to completion (false when cancelled while
    /// URLs were still waiting to be dispatched).
    async fn crawl_batch(
        &self,
        batch_urls: &[String],
        session_id: i64,
        db_name: &str,
    ) -> (BatchOutcome, bool) {
        let mut outcome = BatchOutcome::default();
        let mut pending = batch_urls.iter();
        let mut join_set: JoinSet<PageOutcome> = JoinSet::new();
        let mut completed = true;

        loop {
            while join_set.len() < self.engine_concurrency() {
                if self.cancel.is_cancelled() {
                    completed = pending.len() == 0;
                    break;
                }
                let Some(url) = pending.next() else {
                    break;
                };
                let engine = self.engine.clone();
                let url = url.clone();
                let db_name = db_name.to_string();
                join_set.spawn(async move { engine.crawl_url(&url, session_id, &db_name).await });
            }

            let Some(result) = join_set.join_next().await else {
                break;
            };
            outcome.urls_processed += 1;
            match result {
                Ok(PageOutcome::Stored(_)) => outcome.successful += 1,
                Ok(PageOutcome::DuplicateContent)
                | Ok(PageOutcome::SkippedRecent)
                | Ok(PageOutcome::Dropped(_)) => {}
                Ok(PageOutcome::Failed(_)) => outcome.failed += 1,
                Err(error) => {
                    tracing::error!(%error, "crawl worker panicked");
                    outcome.failed += 1;
                }
            }
        }

        (outcome, completed)
    }

    fn engine_concurrency(&self) -> usize {
        self.settings.max_concurrent.max(1)
    }
}
