use std::env;
use std::path::Path;

use serde::Deserialize;

/// Runtime tunables, loaded from environment variables with defaults.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Path to the backend registry file (databases.json).
    pub databases_path: String,
    pub seed_urls_path: String,
    pub progress_path: String,
    pub max_concurrent: usize,
    pub batch_size: u32,
    /// Minimum per-host delay between requests, in seconds.
    pub crawl_delay_secs: f64,
    pub max_retries: u32,
    pub retry_base_delay_secs: f64,
    pub recrawl_days: i64,
    pub max_depth: u32,
    pub request_timeout_secs: u64,
    /// Base URL of the provider usage API. When unset, quota checks are
    /// skipped and every backend reads as empty.
    pub usage_api_url: Option<String>,
    pub daily_write_limit: u64,
    pub monthly_write_limit: u64,
    pub inter_batch_delay_secs: f64,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Settings {
            databases_path: env::var("JSONPATH").unwrap_or_else(|_| "databases.json".to_string()),
            seed_urls_path: env::var("SEED_URLS_PATH")
                .unwrap_or_else(|_| "seed_urls.json".to_string()),
            progress_path: env::var("PROGRESS_PATH")
                .unwrap_or_else(|_| "crawl_progress.json".to_string()),
            max_concurrent: parse_var("MAX_CONCURRENT", 5)?,
            batch_size: parse_var("BATCH_SIZE", 50)?,
            crawl_delay_secs: parse_var("CRAWL_DELAY_SECS", 1.0)?,
            max_retries: parse_var("MAX_RETRIES", 3)?,
            retry_base_delay_secs: parse_var("RETRY_BASE_DELAY_SECS", 2.0)?,
            recrawl_days: parse_var("RECRAWL_DAYS", 7)?,
            max_depth: parse_var("MAX_DEPTH", 2)?,
            request_timeout_secs: parse_var("REQUEST_TIMEOUT_SECS", 30)?,
            usage_api_url: env::var("USAGE_API_URL").ok().filter(|s| !s.is_empty()),
            daily_write_limit: parse_var("DAILY_WRITE_LIMIT", 10_000_000)?,
            monthly_write_limit: parse_var("MONTHLY_WRITE_LIMIT", 10_000_000)?,
            inter_batch_delay_secs: parse_var("INTER_BATCH_DELAY_SECS", 3.0)?,
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue(name, raw)),
        Err(_) => Ok(default),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
    #[error("Failed to read {0}: {1}")]
    Read(String, #[source] std::io::Error),
    #[error("Invalid JSON in {0}: {1}")]
    Parse(String, #[source] serde_json::Error),
}

// --- Backend registry file ---

/// One entry of databases.json. `cat` partitions the pool: 1 = backlink
/// databases, 2 = crawl databases.
#[derive(Debug, Clone, Deserialize)]
pub struct DbDescriptor {
    pub name: String,
    pub url: String,
    pub auth_token: String,
    #[serde(rename = "apikey")]
    pub api_key: String,
    pub organization: String,
    pub cat: u8,
    #[serde(default)]
    pub monthly_write_limit: Option<u64>,
    #[serde(default)]
    pub storage_quota_gb: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RegistryFile {
    List(Vec<DbDescriptor>),
    Wrapped { databases: Vec<DbDescriptor> },
}

/// Load backend descriptors from databases.json. Accepts either a bare
/// array or an object with a `databases` array.
pub fn load_db_descriptors(path: &str) -> Result<Vec<DbDescriptor>, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_string(), e))?;
    let parsed: RegistryFile =
        serde_json::from_str(&raw).map_err(|e| ConfigError::Parse(path.to_string(), e))?;
    Ok(match parsed {
        RegistryFile::List(list) => list,
        RegistryFile::Wrapped { databases } => databases,
    })
}

// --- Seed file ---

const SEED_LIST_KEYS: &[&str] = &["urls", "websites", "links", "targets", "domains", "tasks"];

/// Load seed URLs from seed_urls.json. The file is either an array of URL
/// strings or an object carrying such an array under one of the known
/// keys. Entries that are not http(s) URLs are dropped; order is kept and
/// duplicates removed.
pub fn load_seed_urls(path: &str) -> Result<Vec<String>, ConfigError> {
    if !Path::new(path).exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_string(), e))?;
    let value: serde_json::Value =
        serde_json::from_str(&raw).map_err(|e| ConfigError::Parse(path.to_string(), e))?;

    let mut urls = Vec::new();
    match &value {
        serde_json::Value::Array(items) => collect_url_strings(items, &mut urls),
        serde_json::Value::Object(map) => {
            for key in SEED_LIST_KEYS {
                if let Some(serde_json::Value::Array(items)) = map.get(*key) {
                    collect_url_strings(items, &mut urls);
                }
            }
        }
        _ => {}
    }

    let mut seen = std::collections::HashSet::new();
    urls.retain(|u| seen.insert(u.clone()));
    Ok(urls)
}

fn collect_url_strings(items: &[serde_json::Value], out: &mut Vec<String>) {
    for item in items {
        if let Some(s) = item.as_str() {
            if s.starts_with("http://") || s.starts_with("https://") {
                out.push(s.to_string());
            }
        }
    }
}
