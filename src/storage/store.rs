use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::crawler::urls;
use crate::models::{Backlink, ErrorRecord, PageRecord, SessionStatus};

use super::engine::{Engine, EngineExt, SqlValue};
use super::router::Router;
use super::{PoolKind, StoreError};

const BACKLINK_CHUNK_SIZE: usize = 5_000;
const SCORE_CHUNK_SIZE: usize = 1_000;

const INSERT_PAGE_SQL: &str = r#"
INSERT INTO crawled_pages (
    session_id, url, original_url, redirect_chain, title, meta_description,
    content_text, content_html, content_hash, word_count, page_size,
    http_status_code, response_time_ms, language, charset, h1_tags, h2_tags,
    meta_keywords, canonical_url, robots_meta, internal_links_count,
    external_links_count, images_count, content_type, file_extension, crawl_time
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT(url) DO UPDATE SET
    original_url = excluded.original_url,
    redirect_chain = excluded.redirect_chain,
    title = excluded.title,
    meta_description = excluded.meta_description,
    content_text = excluded.content_text,
    content_html = excluded.content_html,
    content_hash = excluded.content_hash,
    word_count = excluded.word_count,
    page_size = excluded.page_size,
    http_status_code = excluded.http_status_code,
    response_time_ms = excluded.response_time_ms,
    language = excluded.language,
    charset = excluded.charset,
    h1_tags = excluded.h1_tags,
    h2_tags = excluded.h2_tags,
    meta_keywords = excluded.meta_keywords,
    canonical_url = excluded.canonical_url,
    robots_meta = excluded.robots_meta,
    internal_links_count = excluded.internal_links_count,
    external_links_count = excluded.external_links_count,
    images_count = excluded.images_count,
    content_type = excluded.content_type,
    file_extension = excluded.file_extension,
    crawl_time = excluded.crawl_time
"#;

const INSERT_BACKLINK_SQL: &str = r#"
INSERT OR IGNORE INTO backlinks
    (source_url, target_url, anchor_text, context, page_title,
     domain_authority, is_nofollow, crawl_date)
VALUES (?, ?, ?, ?, ?, ?, ?, ?)
"#;

const DISTINCT_URLS_SQL: &str = r#"
SELECT DISTINCT url FROM (
    SELECT source_url AS url FROM backlinks WHERE source_url IS NOT NULL
    UNION
    SELECT target_url AS url FROM backlinks WHERE target_url IS NOT NULL
) AS unique_urls
ORDER BY url
LIMIT ?
"#;

/// All reads and writes of crawl state, routed through the quota-aware
/// router. Writes that belong to an existing session are pinned to the
/// backend that owns it; everything else round-robins.
pub struct PageStore {
    router: Arc<Router>,
}

impl PageStore {
    pub fn new(router: Arc<Router>) -> Self {
        PageStore { router }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    // --- Sessions ---

    /// Create a crawl session on the next crawl backend under quota.
    /// Returns the backend-assigned id and the backend name; both are
    /// needed later because session ids are only unique per backend.
    pub async fn create_session(
        &self,
        seed_urls: &[String],
        config: &serde_json::Value,
    ) -> Result<(i64, String), StoreError> {
        let backend = self.router.choose(PoolKind::Crawl).await?;
        let id = backend
            .engine
            .insert_returning_id(
                "INSERT INTO crawl_sessions (seed_urls, config, status, start_time)
                 VALUES (?, ?, 'running', ?)",
                &[
                    json_text(seed_urls),
                    SqlValue::Text(config.to_string()),
                    SqlValue::Text(now()),
                ],
            )
            .await?;
        tracing::info!(session_id = id, backend = %backend.name, "crawl session created");
        Ok((id, backend.name.clone()))
    }

    /// Move a session to a terminal status. The WHERE clause keeps the
    /// transition monotonic: an already-finished session is untouched.
    pub async fn finish_session(
        &self,
        session_id: i64,
        db_name: &str,
        status: SessionStatus,
    ) -> Result<(), StoreError> {
        let backend = self.router.backend_for(db_name, PoolKind::Crawl).await?;
        backend
            .engine
            .execute(
                "UPDATE crawl_sessions SET end_time = ?, status = ?
                 WHERE id = ? AND status = 'running'",
                &[
                    SqlValue::Text(now()),
                    SqlValue::from(status.as_str()),
                    SqlValue::Integer(session_id),
                ],
            )
            .await?;
        Ok(())
    }

    // --- Pages and errors ---

    /// Upsert one crawled page into the backend owning its session. On
    /// re-crawl every field is refreshed in place except `session_id`,
    /// which stays with the session that first stored the page.
    pub async fn store_page(
        &self,
        page: &PageRecord,
        session_id: i64,
        db_name: &str,
    ) -> Result<(), StoreError> {
        let backend = self.router.backend_for(db_name, PoolKind::Crawl).await?;
        let exists = backend
            .engine
            .query_i64(
                "SELECT id FROM crawl_sessions WHERE id = ?",
                &[SqlValue::Integer(session_id)],
            )
            .await?;
        if exists.is_none() {
            return Err(StoreError::SessionNotFound(session_id, db_name.to_string()));
        }

        let params = vec![
            SqlValue::Integer(session_id),
            SqlValue::from(page.url.as_str()),
            SqlValue::from(page.original_url.clone()),
            json_text(&page.redirect_chain),
            SqlValue::from(page.title.clone()),
            SqlValue::from(page.meta_description.clone()),
            SqlValue::from(page.content_text.clone()),
            SqlValue::from(page.content_html.clone()),
            SqlValue::from(page.content_hash.as_str()),
            SqlValue::Integer(page.word_count),
            SqlValue::Integer(page.page_size),
            SqlValue::Integer(page.http_status_code),
            SqlValue::Integer(page.response_time_ms),
            SqlValue::from(page.language.clone()),
            SqlValue::from(page.charset.clone()),
            json_text(&page.h1_tags),
            json_text(&page.h2_tags),
            json_text(&page.meta_keywords),
            SqlValue::from(page.canonical_url.clone()),
            SqlValue::from(page.robots_meta.clone()),
            SqlValue::Integer(page.internal_links_count),
            SqlValue::Integer(page.external_links_count),
            SqlValue::Integer(page.images_count),
            SqlValue::from(page.content_type.as_str()),
            SqlValue::from(page.file_extension.clone()),
            SqlValue::Text(now()),
        ];
        backend.engine.execute(INSERT_PAGE_SQL, &params).await?;
        Ok(())
    }

    pub async fn store_error(
        &self,
        record: &ErrorRecord,
        session_id: i64,
        db_name: &str,
    ) -> Result<(), StoreError> {
        let backend = self.router.backend_for(db_name, PoolKind::Crawl).await?;
        backend
            .engine
            .execute(
                "INSERT INTO crawl_errors (session_id, url, error_type, error_msg, status_code, timestamp)
                 VALUES (?, ?, ?, ?, ?, ?)",
                &[
                    SqlValue::Integer(session_id),
                    SqlValue::from(record.url.as_str()),
                    SqlValue::from(record.kind.as_str()),
                    SqlValue::from(record.message.as_str()),
                    record
                        .status_code
                        .map(|c| SqlValue::Integer(c as i64))
                        .unwrap_or(SqlValue::Null),
                    SqlValue::Text(now()),
                ],
            )
            .await?;
        Ok(())
    }

    /// Refresh `crawl_time` for a URL whose body came back byte-identical
    /// to an already-stored page, so the recrawl window moves forward even
    /// though the row is not rewritten.
    pub async fn touch_crawl_time(&self, url: &str) -> Result<(), StoreError> {
        for backend in &self.router.registry().crawl {
            backend
                .engine
                .execute(
                    "UPDATE crawled_pages SET crawl_time = ? WHERE url = ?",
                    &[SqlValue::Text(now()), SqlValue::from(url)],
                )
                .await?;
        }
        Ok(())
    }

    // --- Backlinks and scores ---

    /// Store backlinks in chunks, each chunk committed on its own through
    /// the next backlink backend under quota. A chunk that fails is
    /// logged and skipped; later chunks still run. Re-inserting the same
    /// records is a no-op thanks to the identity index.
    pub async fn store_backlinks(&self, backlinks: &[Backlink]) -> Result<u64, StoreError> {
        if backlinks.is_empty() {
            return Ok(0);
        }

        let total_chunks = backlinks.len().div_ceil(BACKLINK_CHUNK_SIZE);
        let mut stored = 0u64;
        for (index, chunk) in backlinks.chunks(BACKLINK_CHUNK_SIZE).enumerate() {
            let backend = self.router.choose(PoolKind::Backlink).await?;
            let rows: Vec<Vec<SqlValue>> = chunk.iter().map(backlink_row).collect();
            match backend.engine.execute_batch(INSERT_BACKLINK_SQL, &rows).await {
                Ok(affected) => {
                    stored += affected;
                    tracing::info!(
                        chunk = index + 1,
                        total_chunks,
                        rows = chunk.len(),
                        inserted = affected,
                        backend = %backend.name,
                        "backlink chunk committed"
                    );
                }
                Err(error) => {
                    tracing::error!(
                        chunk = index + 1,
                        total_chunks,
                        backend = %backend.name,
                        %error,
                        "backlink chunk failed, skipping"
                    );
                }
            }
        }
        tracing::info!(stored, total = backlinks.len(), "backlink storage complete");
        Ok(stored)
    }

    pub async fn store_domain_scores(
        &self,
        scores: &std::collections::HashMap<String, f64>,
    ) -> Result<u64, StoreError> {
        self.store_scores(
            scores,
            PoolKind::Backlink,
            "INSERT INTO domain_authority (domain, authority_score, last_updated)
             VALUES (?, ?, ?)
             ON CONFLICT(domain) DO UPDATE SET
                 authority_score = excluded.authority_score,
                 last_updated = excluded.last_updated",
        )
        .await
    }

    pub async fn store_pagerank_scores(
        &self,
        scores: &std::collections::HashMap<String, f64>,
    ) -> Result<u64, StoreError> {
        self.store_scores(
            scores,
            PoolKind::Crawl,
            "INSERT INTO pagerank_scores (url, pagerank_score, last_calculated)
             VALUES (?, ?, ?)
             ON CONFLICT(url) DO UPDATE SET
                 pagerank_score = excluded.pagerank_score,
                 last_calculated = excluded.last_calculated",
        )
        .await
    }

    async fn store_scores(
        &self,
        scores: &std::collections::HashMap<String, f64>,
        pool: PoolKind,
        sql: &str,
    ) -> Result<u64, StoreError> {
        if scores.is_empty() {
            return Ok(0);
        }
        let mut entries: Vec<(&String, &f64)> = scores.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));

        let mut stored = 0u64;
        for chunk in entries.chunks(SCORE_CHUNK_SIZE) {
            let backend = self.router.choose(pool).await?;
            let rows: Vec<Vec<SqlValue>> = chunk
                .iter()
                .map(|(key, score)| {
                    vec![
                        SqlValue::from(key.as_str()),
                        SqlValue::Real(**score),
                        SqlValue::Text(now()),
                    ]
                })
                .collect();
            match backend.engine.execute_batch(sql, &rows).await {
                Ok(_) => stored += chunk.len() as u64,
                Err(error) => {
                    tracing::error!(backend = %backend.name, %error, "score chunk failed, skipping");
                }
            }
        }
        Ok(stored)
    }

    // --- URL source ---

    /// Total distinct URLs across every backlink backend.
    pub async fn count_unique_urls(&self) -> Result<u64, StoreError> {
        let mut merged: HashSet<String> = HashSet::new();
        for backend in &self.router.registry().backlink {
            let urls = backend
                .engine
                .query_strings(
                    "SELECT DISTINCT url FROM (
                         SELECT source_url AS url FROM backlinks WHERE source_url IS NOT NULL
                         UNION
                         SELECT target_url AS url FROM backlinks WHERE target_url IS NOT NULL
                     ) AS unique_urls",
                    &[],
                )
                .await?;
            merged.extend(urls);
        }
        Ok(merged.len() as u64)
    }

    /// One page of the deterministic URL ordering: the distinct union of
    /// source and target URLs across every backlink backend, sorted,
    /// offset by `(page - 1) * limit`. URLs failing basic validation are
    /// filtered out after pagination so page boundaries stay stable.
    pub async fn urls_batch(&self, page: u32, limit: u32) -> Result<Vec<String>, StoreError> {
        let page = page.max(1);
        // The global first page*limit URLs are always contained in the
        // union of each backend's first page*limit URLs, so per-backend
        // queries can be bounded before merging.
        let per_backend_limit = i64::from(page) * i64::from(limit);
        let mut merged: BTreeSet<String> = BTreeSet::new();
        for backend in &self.router.registry().backlink {
            let urls = backend
                .engine
                .query_strings(DISTINCT_URLS_SQL, &[SqlValue::Integer(per_backend_limit)])
                .await?;
            merged.extend(urls);
        }

        let offset = (page as usize - 1) * limit as usize;
        Ok(merged
            .into_iter()
            .skip(offset)
            .take(limit as usize)
            .filter(|u| urls::is_valid(u))
            .collect())
    }

    // --- Crawl-state loaders ---

    /// Union of already-crawled URLs and content hashes across every
    /// crawl backend, used to seed the in-memory visited and dedup sets.
    pub async fn load_crawl_state(&self) -> Result<(HashSet<String>, HashSet<String>), StoreError> {
        let mut visited = HashSet::new();
        let mut hashes = HashSet::new();
        for backend in &self.router.registry().crawl {
            visited.extend(
                backend
                    .engine
                    .query_strings("SELECT url FROM crawled_pages", &[])
                    .await?,
            );
            hashes.extend(
                backend
                    .engine
                    .query_strings(
                        "SELECT DISTINCT content_hash FROM crawled_pages
                         WHERE content_hash IS NOT NULL AND content_hash != ''",
                        &[],
                    )
                    .await?,
            );
        }
        Ok((visited, hashes))
    }

    /// Most recent crawl time for a URL, across crawl backends.
    pub async fn last_crawl_time(&self, url: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let mut latest: Option<DateTime<Utc>> = None;
        for backend in &self.router.registry().crawl {
            let raw = backend
                .engine
                .query_string(
                    "SELECT MAX(crawl_time) FROM crawled_pages WHERE url = ?",
                    &[SqlValue::from(url)],
                )
                .await?;
            if let Some(raw) = raw {
                if let Ok(parsed) = DateTime::parse_from_rfc3339(&raw) {
                    let parsed = parsed.with_timezone(&Utc);
                    if latest.map(|l| parsed > l).unwrap_or(true) {
                        latest = Some(parsed);
                    }
                }
            }
        }
        Ok(latest)
    }

    /// Every stored backlink, deduplicated by identity across backends.
    /// Feeds the graph engine.
    pub async fn all_backlinks(&self) -> Result<Vec<Backlink>, StoreError> {
        let mut seen: HashSet<(String, String, String)> = HashSet::new();
        let mut out = Vec::new();
        for backend in &self.router.registry().backlink {
            let rows = backend
                .engine
                .query_rows(
                    "SELECT source_url, target_url, anchor_text, context, page_title,
                            domain_authority, is_nofollow
                     FROM backlinks",
                    &[],
                )
                .await?;
            for row in rows {
                let backlink = decode_backlink(&row)?;
                let key = (
                    backlink.source_url.clone(),
                    backlink.target_url.clone(),
                    backlink.anchor_text.clone(),
                );
                if seen.insert(key) {
                    out.push(backlink);
                }
            }
        }
        Ok(out)
    }
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn json_text(values: &[String]) -> SqlValue {
    match serde_json::to_string(values) {
        Ok(text) => SqlValue::Text(text),
        Err(_) => SqlValue::Null,
    }
}

fn backlink_row(backlink: &Backlink) -> Vec<SqlValue> {
    vec![
        SqlValue::from(backlink.source_url.as_str()),
        SqlValue::from(backlink.target_url.as_str()),
        SqlValue::from(backlink.anchor_text.as_str()),
        SqlValue::from(backlink.context.as_str()),
        SqlValue::from(backlink.page_title.as_str()),
        SqlValue::Real(backlink.domain_authority),
        SqlValue::from(backlink.is_nofollow),
        SqlValue::Text(now()),
    ]
}

fn decode_backlink(row: &[SqlValue]) -> Result<Backlink, StoreError> {
    let text = |idx: usize| -> String {
        row.get(idx)
            .and_then(|v| v.as_text())
            .unwrap_or_default()
            .to_string()
    };
    if row.len() < 7 {
        return Err(StoreError::Decode(format!(
            "expected 7 backlink columns, got {}",
            row.len()
        )));
    }
    Ok(Backlink {
        source_url: text(0),
        target_url: text(1),
        anchor_text: text(2),
        context: text(3),
        page_title: text(4),
        domain_authority: row[5].as_real().unwrap_or(0.0),
        is_nofollow: row[6].as_integer().unwrap_or(0) != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContentKind, ErrorKind};
    use crate::storage::quota::QuotaMonitor;
    use crate::storage::registry::{test_descriptor, Registry};
    use crate::storage::schema;

    async fn store_with(crawl: usize, backlink: usize) -> PageStore {
        let mut descriptors = Vec::new();
        for i in 0..crawl {
            descriptors.push(test_descriptor(&format!("crawl-{i}"), 2));
        }
        for i in 0..backlink {
            descriptors.push(test_descriptor(&format!("backlink-{i}"), 1));
        }
        let registry = Arc::new(Registry::open(descriptors, 10_000_000).await.unwrap());
        schema::initialize(&registry).await.unwrap();
        let monitor = Arc::new(QuotaMonitor::new(None, 10_000_000));
        PageStore::new(Arc::new(Router::new(registry, monitor)))
    }

    fn page(url: &str, hash: &str) -> PageRecord {
        PageRecord {
            url: url.to_string(),
            original_url: None,
            redirect_chain: vec![],
            title: Some("Title".to_string()),
            meta_description: None,
            content_text: Some("body".to_string()),
            content_html: Some("<html></html>".to_string()),
            content_hash: hash.to_string(),
            word_count: 1,
            page_size: 13,
            http_status_code: 200,
            response_time_ms: 5,
            language: None,
            charset: Some("utf-8".to_string()),
            h1_tags: vec!["H".to_string()],
            h2_tags: vec![],
            meta_keywords: vec![],
            canonical_url: None,
            robots_meta: None,
            internal_links_count: 0,
            external_links_count: 0,
            images_count: 0,
            content_type: ContentKind::Html,
            file_extension: None,
        }
    }

    fn backlink(source: &str, target: &str, anchor: &str) -> Backlink {
        Backlink {
            source_url: source.to_string(),
            target_url: target.to_string(),
            anchor_text: anchor.to_string(),
            context: "context".to_string(),
            page_title: "title".to_string(),
            domain_authority: 0.0,
            is_nofollow: false,
        }
    }

    #[tokio::test]
    async fn session_lifecycle_is_monotonic() {
        let store = store_with(1, 1).await;
        let (id, db_name) = store
            .create_session(&["https://a.test/".to_string()], &serde_json::json!({}))
            .await
            .unwrap();

        store
            .finish_session(id, &db_name, SessionStatus::Completed)
            .await
            .unwrap();
        // A second terminal transition must not overwrite the first.
        store
            .finish_session(id, &db_name, SessionStatus::Failed)
            .await
            .unwrap();

        let backend = store.router.backend_for(&db_name, PoolKind::Crawl).await.unwrap();
        let status = backend
            .engine
            .query_string(
                "SELECT status FROM crawl_sessions WHERE id = ?",
                &[SqlValue::Integer(id)],
            )
            .await
            .unwrap();
        assert_eq!(status.as_deref(), Some("completed"));
    }

    #[tokio::test]
    async fn store_page_requires_existing_session() {
        let store = store_with(1, 1).await;
        let err = store
            .store_page(&page("https://a.test/", "h1"), 999, "crawl-0")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::SessionNotFound(999, _)));
    }

    #[tokio::test]
    async fn recrawl_updates_in_place_and_keeps_session_id() {
        let store = store_with(1, 1).await;
        let (first_session, db_name) = store
            .create_session(&[], &serde_json::json!({}))
            .await
            .unwrap();
        store
            .store_page(&page("https://a.test/", "hash-1"), first_session, &db_name)
            .await
            .unwrap();

        let (second_session, db_name2) = store
            .create_session(&[], &serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(db_name, db_name2); // single crawl backend
        let mut updated = page("https://a.test/", "hash-2");
        updated.title = Some("New title".to_string());
        store
            .store_page(&updated, second_session, &db_name)
            .await
            .unwrap();

        let backend = store.router.backend_for(&db_name, PoolKind::Crawl).await.unwrap();
        let rows = backend
            .engine
            .query_rows(
                "SELECT session_id, title, content_hash FROM crawled_pages WHERE url = ?",
                &[SqlValue::from("https://a.test/")],
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], SqlValue::Integer(first_session));
        assert_eq!(rows[0][1], SqlValue::Text("New title".to_string()));
        assert_eq!(rows[0][2], SqlValue::Text("hash-2".to_string()));
    }

    #[tokio::test]
    async fn backlink_reinsertion_is_idempotent() {
        let store = store_with(1, 1).await;
        let links = vec![
            backlink("https://s.test/a", "https://t.test/", "anchor"),
            backlink("https://s.test/b", "https://t.test/", "anchor"),
            backlink("https://s.test/a", "https://t.test/", "other anchor"),
        ];

        let first = store.store_backlinks(&links).await.unwrap();
        assert_eq!(first, 3);
        let second = store.store_backlinks(&links).await.unwrap();
        assert_eq!(second, 0);

        assert_eq!(store.all_backlinks().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn urls_batch_paginates_deterministically() {
        let store = store_with(1, 1).await;
        let mut links = Vec::new();
        for i in 0..7 {
            links.push(backlink(
                &format!("https://s.test/page-{i}"),
                "https://t.test/",
                "a",
            ));
        }
        store.store_backlinks(&links).await.unwrap();

        let total = store.count_unique_urls().await.unwrap();
        assert_eq!(total, 8); // 7 sources + 1 shared target

        let page1 = store.urls_batch(1, 3).await.unwrap();
        let page2 = store.urls_batch(2, 3).await.unwrap();
        let page3 = store.urls_batch(3, 3).await.unwrap();
        assert_eq!(page1.len(), 3);
        assert_eq!(page2.len(), 3);
        assert_eq!(page3.len(), 2);

        let mut all: Vec<String> = page1.iter().chain(&page2).chain(&page3).cloned().collect();
        let mut sorted = all.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(all.len(), sorted.len());
        all.sort();
        assert_eq!(all, sorted);

        // Same page requested again returns the same slice.
        assert_eq!(store.urls_batch(2, 3).await.unwrap(), page2);
    }

    #[tokio::test]
    async fn urls_batch_spans_multiple_backends() {
        let store = store_with(1, 2).await;
        // Chunks round-robin across the two backlink backends.
        store
            .store_backlinks(&[backlink("https://s.test/1", "https://t.test/", "a")])
            .await
            .unwrap();
        store
            .store_backlinks(&[backlink("https://s.test/2", "https://t.test/", "a")])
            .await
            .unwrap();

        let urls = store.urls_batch(1, 10).await.unwrap();
        assert!(urls.contains(&"https://s.test/1".to_string()));
        assert!(urls.contains(&"https://s.test/2".to_string()));
        // The shared target appears once even though both backends hold it.
        assert_eq!(
            urls.iter().filter(|u| u.as_str() == "https://t.test/").count(),
            1
        );
    }

    #[tokio::test]
    async fn error_records_are_stored() {
        let store = store_with(1, 1).await;
        let (id, db_name) = store.create_session(&[], &serde_json::json!({})).await.unwrap();
        store
            .store_error(
                &ErrorRecord {
                    url: "https://a.test/private".to_string(),
                    kind: ErrorKind::RobotsBlocked,
                    message: "Blocked by robots.txt".to_string(),
                    status_code: None,
                },
                id,
                &db_name,
            )
            .await
            .unwrap();

        let backend = store.router.backend_for(&db_name, PoolKind::Crawl).await.unwrap();
        let kind = backend
            .engine
            .query_string("SELECT error_type FROM crawl_errors WHERE session_id = ?", &[
                SqlValue::Integer(id),
            ])
            .await
            .unwrap();
        assert_eq!(kind.as_deref(), Some("ROBOTS_BLOCKED"));
    }

    #[tokio::test]
    async fn score_upserts_replace_values() {
        let store = store_with(1, 1).await;
        let mut scores = std::collections::HashMap::new();
        scores.insert("t.test".to_string(), 10.0);
        store.store_domain_scores(&scores).await.unwrap();
        scores.insert("t.test".to_string(), 42.0);
        store.store_domain_scores(&scores).await.unwrap();

        let backend = store
            .router
            .backend_for("backlink-0", PoolKind::Backlink)
            .await
            .unwrap();
        let rows = backend
            .engine
            .query_rows("SELECT authority_score FROM domain_authority", &[])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], SqlValue::Real(42.0));
    }

    #[tokio::test]
    async fn crawl_state_and_touch() {
        let store = store_with(1, 1).await;
        let (id, db_name) = store.create_session(&[], &serde_json::json!({})).await.unwrap();
        store
            .store_page(&page("https://a.test/", "hash-a"), id, &db_name)
            .await
            .unwrap();

        let (visited, hashes) = store.load_crawl_state().await.unwrap();
        assert!(visited.contains("https://a.test/"));
        assert!(hashes.contains("hash-a"));

        let before = store.last_crawl_time("https://a.test/").await.unwrap().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.touch_crawl_time("https://a.test/").await.unwrap();
        let after = store.last_crawl_time("https://a.test/").await.unwrap().unwrap();
        assert!(after >= before);
    }
}
