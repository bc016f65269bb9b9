use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::BatchOutcome;

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("failed to read progress file {0}: {1}")]
    Read(PathBuf, #[source] std::io::Error),
    #[error("failed to write progress file {0}: {1}")]
    Write(PathBuf, #[source] std::io::Error),
    #[error("invalid progress file {0}: {1}")]
    Parse(PathBuf, #[source] serde_json::Error),
}

/// Mirror of the crawl state kept in a local JSON file so a run can resume
/// even when every backend is temporarily unreachable. `current_page` is
/// always the next page to process, not the last completed one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CrawlProgress {
    pub current_page: u32,
    pub batch_size: u32,
    pub total_urls: u64,
    pub urls_processed: u64,
    pub successful_crawls: u64,
    pub failed_crawls: u64,
    pub last_update: Option<String>,
    pub session_id: Option<i64>,
    pub db_name: Option<String>,
    pub is_running: bool,
}

impl Default for CrawlProgress {
    fn default() -> Self {
        CrawlProgress {
            current_page: 1,
            batch_size: 50,
            total_urls: 0,
            urls_processed: 0,
            successful_crawls: 0,
            failed_crawls: 0,
            last_update: None,
            session_id: None,
            db_name: None,
            is_running: false,
        }
    }
}

impl CrawlProgress {
    /// Fold one committed batch into the counters and advance to the next
    /// page.
    pub fn record_batch(&mut self, page: u32, outcome: BatchOutcome) {
        self.current_page = page + 1;
        self.urls_processed += outcome.urls_processed;
        self.successful_crawls += outcome.successful;
        self.failed_crawls += outcome.failed;
    }
}

/// Loads and saves the progress file. Saves are atomic (write to a
/// temporary file, then rename) so a crash never leaves a torn file.
pub struct ProgressStore {
    path: PathBuf,
}

impl ProgressStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ProgressStore { path: path.into() }
    }

    /// Load progress, merging missing fields with defaults. A leftover
    /// `is_running: true` means the previous run died mid-crawl; it is
    /// coerced to false and persisted immediately.
    pub fn load(&self) -> Result<CrawlProgress, ProgressError> {
        if !Path::new(&self.path).exists() {
            return Ok(CrawlProgress::default());
        }
        let raw = std::fs::read_to_string(&self.path)
            .map_err(|e| ProgressError::Read(self.path.clone(), e))?;
        let mut progress: CrawlProgress = serde_json::from_str(&raw)
            .map_err(|e| ProgressError::Parse(self.path.clone(), e))?;

        if progress.is_running {
            progress.is_running = false;
            self.save(&progress)?;
        }
        Ok(progress)
    }

    pub fn save(&self, progress: &CrawlProgress) -> Result<(), ProgressError> {
        let mut stamped = progress.clone();
        stamped.last_update = Some(chrono::Utc::now().to_rfc3339());

        let body = serde_json::to_string_pretty(&stamped)
            .map_err(|e| ProgressError::Parse(self.path.clone(), e))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, body).map_err(|e| ProgressError::Write(tmp.clone(), e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| ProgressError::Write(self.path.clone(), e))?;
        Ok(())
    }

    pub fn mark_start(&self, progress: &mut CrawlProgress) -> Result<(), ProgressError> {
        progress.is_running = true;
        self.save(progress)
    }

    pub fn mark_stop(&self, progress: &mut CrawlProgress) -> Result<(), ProgressError> {
        progress.is_running = false;
        self.save(progress)
    }

    pub fn reset(&self) -> Result<(), ProgressError> {
        self.save(&CrawlProgress::default())
    }
}
