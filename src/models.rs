use serde::{Deserialize, Serialize};

// --- Session lifecycle ---

/// Lifecycle of a crawl session row. Transitions to a terminal state are
/// one-way: a completed or failed session never goes back to running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }
}

// --- Error taxonomy ---

/// Error categories recorded in the crawl_errors table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    RobotsBlocked,
    HttpError,
    ParseError,
    Timeout,
    ClientError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RobotsBlocked => "ROBOTS_BLOCKED",
            ErrorKind::HttpError => "HTTP_ERROR",
            ErrorKind::ParseError => "PARSE_ERROR",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::ClientError => "CLIENT_ERROR",
        }
    }
}

/// A single recorded crawl failure, keyed to the session that hit it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub url: String,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

// --- Content classification ---

/// Coarse content class derived from the URL path extension.
/// HTML is the default for extension-less paths and paths ending in "/".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Html,
    Pdf,
    Image,
    Document,
    Archive,
    Media,
    Stylesheet,
    Script,
    Data,
    Font,
    Other,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Html => "html",
            ContentKind::Pdf => "pdf",
            ContentKind::Image => "image",
            ContentKind::Document => "document",
            ContentKind::Archive => "archive",
            ContentKind::Media => "media",
            ContentKind::Stylesheet => "stylesheet",
            ContentKind::Script => "script",
            ContentKind::Data => "data",
            ContentKind::Font => "font",
            ContentKind::Other => "other",
        }
    }

    pub fn is_html(&self) -> bool {
        matches!(self, ContentKind::Html)
    }
}

// --- Crawled page ---

/// Everything we persist for one fetched URL. The url field is the
/// post-redirect URL and is unique within a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageRecord {
    pub url: String,
    pub original_url: Option<String>,
    pub redirect_chain: Vec<String>,
    pub title: Option<String>,
    pub meta_description: Option<String>,
    pub content_text: Option<String>,
    pub content_html: Option<String>,
    pub content_hash: String,
    pub word_count: i64,
    pub page_size: i64,
    pub http_status_code: i64,
    pub response_time_ms: i64,
    pub language: Option<String>,
    pub charset: Option<String>,
    pub h1_tags: Vec<String>,
    pub h2_tags: Vec<String>,
    pub meta_keywords: Vec<String>,
    pub canonical_url: Option<String>,
    pub robots_meta: Option<String>,
    pub internal_links_count: i64,
    pub external_links_count: i64,
    pub images_count: i64,
    pub content_type: ContentKind,
    pub file_extension: Option<String>,
}

// --- Backlinks ---

/// A directed link from a crawled page to a URL on one of the target hosts.
/// Identity is the (source_url, target_url, anchor_text) triple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backlink {
    pub source_url: String,
    pub target_url: String,
    pub anchor_text: String,
    /// Up to 250 characters of text surrounding the anchor.
    pub context: String,
    pub page_title: String,
    pub domain_authority: f64,
    pub is_nofollow: bool,
}

// --- Batch accounting ---

/// Counters produced by one committed batch of URLs.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub urls_processed: u64,
    pub successful: u64,
    pub failed: u64,
}

impl BatchOutcome {
    pub fn absorb(&mut self, other: BatchOutcome) {
        self.urls_processed += other.urls_processed;
        self.successful += other.successful;
        self.failed += other.failed;
    }
}

/// Final numbers for a whole crawl run, across all batches.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub session_id: i64,
    pub db_name: String,
    pub pages_processed: u64,
    pub successful: u64,
    pub failed: u64,
    pub batches: u64,
    pub elapsed_s: f64,
}
