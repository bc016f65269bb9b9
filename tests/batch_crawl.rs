//! End-to-end batch crawling against a local HTTP server and in-memory
//! backends: resumable pagination, duplicate-content skipping, and the
//! stored-page invariants.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crawlrank::config::Settings;
use crawlrank::crawler::{AutoBatchCrawler, CrawlEngine, CrawlOptions, Fetcher, RobotsCache};
use crawlrank::models::Backlink;
use crawlrank::progress::ProgressStore;
use crawlrank::storage::{
    schema, Engine, PageStore, PoolKind, QuotaMonitor, Registry, Router, SqlValue,
};

fn settings(progress_path: &std::path::Path, batch_size: u32) -> Settings {
    Settings {
        databases_path: String::new(),
        seed_urls_path: String::new(),
        progress_path: progress_path.to_string_lossy().into_owned(),
        max_concurrent: 1,
        batch_size,
        crawl_delay_secs: 0.0,
        max_retries: 0,
        retry_base_delay_secs: 0.01,
        recrawl_days: 7,
        max_depth: 2,
        request_timeout_secs: 5,
        usage_api_url: None,
        daily_write_limit: 10_000_000,
        monthly_write_limit: 10_000_000,
        inter_batch_delay_secs: 0.0,
    }
}

fn descriptor(name: &str, cat: u8) -> crawlrank::config::DbDescriptor {
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

async fn build_store() -> Arc<PageStore> {
    let registry = Arc::new(
        Registry::open(vec![descriptor("crawl-0", 2), descriptor("backlink-0", 1)], 10_000_000)
            .await
            .unwrap(),
    );
    schema::initialize(&registry).await.unwrap();
    let monitor = Arc::new(QuotaMonitor::new(None, 10_000_000));
    Arc::new(PageStore::new(Arc::new(Router::new(registry, monitor))))
}

fn backlink(source: &str, target: &str) -> Backlink {
    Backlink {
        source_url: source.to_string(),
        target_url: target.to_string(),
        anchor_text: "anchor".to_string(),
        context: "context".to_string(),
        page_title: "title".to_string(),
        domain_authority: 0.0,
        is_nofollow: false,
    }
}

async fn crawler_for(
    store: &Arc<PageStore>,
    settings: &Settings,
) -> AutoBatchCrawler {
    let fetcher = Arc::new(Fetcher::new(
        settings,
        Arc::new(RobotsCache::new()),
        CancellationToken::new(),
    ));
    let engine = Arc::new(
        CrawlEngine::new(store.clone(), fetcher, settings)
            .await
            .unwrap(),
    );
    AutoBatchCrawler::new(
        engine,
        store.clone(),
        ProgressStore::new(&settings.progress_path),
        settings.clone(),
        CancellationToken::new(),
    )
}

#[tokio::test]
async fn batch_crawl_resumes_at_next_page_and_dedups_content() {
    let mut server = mockito::Server::new_async().await;
    let base = server.url();

    // Eight URLs in the backlink store. /dup1 and /dup2 serve identical
    // bytes. Sorted order: /a /b /c /d /dup1 /dup2 /e /f.
    for path in ["/a", "/b", "/c", "/d", "/e", "/f"] {
        server
            .mock("GET", path)
            .with_status(200)
            .with_body(format!(
                "<html><head><title>page {path}</title></head><body>content of {path}</body></html>"
            ))
            .create_async()
            .await;
    }
    for path in ["/dup1", "/dup2"] {
        server
            .mock("GET", path)
            .with_status(200)
            .with_body("<html><head><title>same</title></head><body>identical bytes</body></html>")
            .create_async()
            .await;
    }

    let store = build_store().await;
    let seeds: Vec<Backlink> = ["/a", "/b", "/c", "/d", "/dup1", "/dup2", "/e", "/f"]
        .iter()
        .map(|path| backlink(&format!("{base}{path}"), &format!("{base}/a")))
        .collect();
    store.store_backlinks(&seeds).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let progress_path = dir.path().join("crawl_progress.json");
    let settings = settings(&progress_path, 3);

    // First run: two batches of three URLs, then stop.
    let crawler = crawler_for(&store, &settings).await;
    let summary = crawler
        .run(CrawlOptions {
            max_pages: Some(2),
            ..CrawlOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(summary.pages_processed, 6);
    assert_eq!(summary.batches, 2);
    // /dup2 came after /dup1 and was skipped as duplicate content.
    assert_eq!(summary.successful, 5);
    assert_eq!(summary.failed, 0);

    let progress = ProgressStore::new(&progress_path).load().unwrap();
    assert_eq!(progress.current_page, 3);
    assert_eq!(progress.urls_processed, 6);
    assert!(!progress.is_running);

    // Second run resumes from page 3 and finishes the remaining two URLs.
    let crawler = crawler_for(&store, &settings).await;
    let summary = crawler.run(CrawlOptions::default()).await.unwrap();
    assert_eq!(summary.pages_processed, 2);
    assert_eq!(summary.successful, 2);

    // Seven rows: six distinct pages plus the first of the duplicates.
    let backend = store
        .router()
        .backend_for("crawl-0", PoolKind::Crawl)
        .await
        .unwrap();
    let rows = backend
        .engine
        .query_rows("SELECT url, content_hash FROM crawled_pages ORDER BY url", &[])
        .await
        .unwrap();
    assert_eq!(rows.len(), 7);
    for row in &rows {
        let url = row[0].as_text().unwrap();
        assert!(!url.contains("/dup2"), "duplicate body must not be stored");
        let hash = row[1].as_text().unwrap();
        assert_eq!(hash.len(), 32, "content hash is a hex md5");
    }

    // Two sessions were created, one per run, both completed.
    let sessions = backend
        .engine
        .query_rows("SELECT status FROM crawl_sessions", &[])
        .await
        .unwrap();
    assert_eq!(sessions.len(), 2);
    for session in &sessions {
        assert_eq!(session[0], SqlValue::Text("completed".to_string()));
    }
}

#[tokio::test]
async fn robots_blocked_urls_produce_error_records_not_pages() {
    let mut server = mockito::Server::new_async().await;
    let base = server.url();
    server
        .mock("GET", "/robots.txt")
        .with_status(200)
        .with_body("User-agent: *\nDisallow: /private\n")
        .create_async()
        .await;
    let page_mock = server
        .mock("GET", "/private")
        .with_status(200)
        .expect(0)
        .create_async()
        .await;

    let store = build_store().await;
    store
        .store_backlinks(&[backlink(&format!("{base}/private"), &format!("{base}/x"))])
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let settings = settings(&dir.path().join("progress.json"), 50);
    let crawler = crawler_for(&store, &settings).await;
    let summary = crawler.run(CrawlOptions::default()).await.unwrap();
    // /private is blocked; /x 501s from the mock server. Both fail.
    assert_eq!(summary.successful, 0);
    assert_eq!(summary.failed, 2);
    page_mock.assert_async().await;

    let backend = store
        .router()
        .backend_for("crawl-0", PoolKind::Crawl)
        .await
        .unwrap();
    let pages = backend
        .engine
        .query_rows("SELECT url FROM crawled_pages", &[])
        .await
        .unwrap();
    assert!(pages.is_empty());

    let errors = backend
        .engine
        .query_rows(
            "SELECT url, error_type FROM crawl_errors ORDER BY url",
            &[],
        )
        .await
        .unwrap();
    assert_eq!(errors.len(), 2);
    let blocked = errors
        .iter()
        .find(|row| row[0].as_text().unwrap().contains("/private"))
        .unwrap();
    assert_eq!(blocked[1], SqlValue::Text("ROBOTS_BLOCKED".to_string()));
}

#[tokio::test]
async fn noindex_pages_are_never_stored() {
    let mut server = mockito::Server::new_async().await;
    let base = server.url();
    server
        .mock("GET", "/hidden")
        .with_status(200)
        .with_body(
            r#"<html><head><meta name="robots" content="noindex, follow"></head>
               <body>secret</body></html>"#,
        )
        .create_async()
        .await;

    let store = build_store().await;
    store
        .store_backlinks(&[backlink(&format!("{base}/hidden"), &format!("{base}/hidden"))])
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let settings = settings(&dir.path().join("progress.json"), 50);
    let crawler = crawler_for(&store, &settings).await;
    let summary = crawler.run(CrawlOptions::default()).await.unwrap();
    assert_eq!(summary.pages_processed, 1);
    assert_eq!(summary.successful, 0);
    assert_eq!(summary.failed, 0);

    let backend = store
        .router()
        .backend_for("crawl-0", PoolKind::Crawl)
        .await
        .unwrap();
    let pages = backend
        .engine
        .query_rows("SELECT url FROM crawled_pages", &[])
        .await
        .unwrap();
    assert!(pages.is_empty());
}
