use super::engine::Engine;
use super::registry::Registry;
use super::StoreError;

/// Table definitions applied to every backend in both pools. All
/// statements are idempotent so startup can run them unconditionally.
pub const CREATE_TABLES: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS crawl_sessions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        start_time TEXT NOT NULL DEFAULT (datetime('now')),
        end_time TEXT,
        seed_urls TEXT NOT NULL,
        config TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'running'
    )"#,
    r#"CREATE TABLE IF NOT EXISTS crawled_pages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id INTEGER NOT NULL REFERENCES crawl_sessions(id),
        url TEXT NOT NULL UNIQUE,
        original_url TEXT,
        redirect_chain TEXT,
        title TEXT,
        meta_description TEXT,
        content_text TEXT,
        content_html TEXT,
        content_hash TEXT,
        word_count INTEGER,
        page_size INTEGER,
        http_status_code INTEGER,
        response_time_ms INTEGER,
        language TEXT,
        charset TEXT,
        h1_tags TEXT,
        h2_tags TEXT,
        meta_keywords TEXT,
        canonical_url TEXT,
        robots_meta TEXT,
        internal_links_count INTEGER,
        external_links_count INTEGER,
        images_count INTEGER,
        content_type TEXT,
        file_extension TEXT,
        crawl_time TEXT NOT NULL DEFAULT (datetime('now'))
    )"#,
    r#"CREATE TABLE IF NOT EXISTS crawl_errors (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id INTEGER NOT NULL REFERENCES crawl_sessions(id),
        url TEXT NOT NULL,
        error_type TEXT NOT NULL,
        error_msg TEXT NOT NULL,
        status_code INTEGER,
        timestamp TEXT NOT NULL DEFAULT (datetime('now'))
    )"#,
    r#"CREATE TABLE IF NOT EXISTS backlinks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        source_url TEXT NOT NULL,
        target_url TEXT NOT NULL,
        anchor_text TEXT NOT NULL DEFAULT '',
        context TEXT NOT NULL DEFAULT '',
        page_title TEXT NOT NULL DEFAULT '',
        domain_authority REAL NOT NULL DEFAULT 0.0,
        is_nofollow INTEGER NOT NULL DEFAULT 0,
        crawl_date TEXT NOT NULL DEFAULT (datetime('now'))
    )"#,
    r#"CREATE TABLE IF NOT EXISTS domain_authority (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        domain TEXT NOT NULL UNIQUE,
        authority_score REAL NOT NULL DEFAULT 0.0,
        last_updated TEXT NOT NULL DEFAULT (datetime('now'))
    )"#,
    r#"CREATE TABLE IF NOT EXISTS pagerank_scores (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        url TEXT NOT NULL UNIQUE,
        pagerank_score REAL NOT NULL DEFAULT 0.0,
        last_calculated TEXT NOT NULL DEFAULT (datetime('now'))
    )"#,
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_backlinks_identity
        ON backlinks(source_url, target_url, anchor_text)",
    "CREATE INDEX IF NOT EXISTS idx_pages_content_hash ON crawled_pages(content_hash)",
    "CREATE INDEX IF NOT EXISTS idx_pages_crawl_time ON crawled_pages(crawl_time)",
    "CREATE INDEX IF NOT EXISTS idx_backlinks_target ON backlinks(target_url)",
];

/// Additive column migrations, applied in order. SQLite has no ADD COLUMN
/// IF NOT EXISTS, so a "duplicate column" failure means the column is
/// already there and the statement is skipped.
pub const MIGRATIONS: &[&str] = &[
    "ALTER TABLE crawled_pages ADD COLUMN content_type TEXT",
    "ALTER TABLE crawled_pages ADD COLUMN file_extension TEXT",
];

fn is_duplicate_column(error: &StoreError) -> bool {
    error.to_string().to_lowercase().contains("duplicate column")
}

/// Create all tables and apply pending migrations on every backend.
pub async fn initialize(registry: &Registry) -> Result<(), StoreError> {
    for backend in registry.all() {
        for statement in CREATE_TABLES {
            backend.engine.execute(statement, &[]).await?;
        }
        for statement in MIGRATIONS {
            match backend.engine.execute(statement, &[]).await {
                Ok(_) => {}
                Err(error) if is_duplicate_column(&error) => {}
                Err(error) => {
                    tracing::error!(backend = %backend.name, %error, "migration failed");
                    return Err(error);
                }
            }
        }
        tracing::info!(backend = %backend.name, "schema ready");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::registry::test_descriptor;

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let registry = Registry::open(
            vec![test_descriptor("c", 2), test_descriptor("b", 1)],
            10_000_000,
        )
        .await
        .unwrap();

        initialize(&registry).await.unwrap();
        // Second run exercises both CREATE IF NOT EXISTS and the
        // duplicate-column path of the ALTER statements.
        initialize(&registry).await.unwrap();

        for backend in registry.all() {
            backend
                .engine
                .execute(
                    "INSERT INTO crawl_sessions (seed_urls, config) VALUES ('[]', '{}')",
                    &[],
                )
                .await
                .unwrap();
        }
    }
}
