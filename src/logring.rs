use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

pub const RING_CAPACITY: usize = 2000;

/// One structured log record as exposed to observers.
#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub timestamp: String,
    pub level: String,
    pub logger: String,
    pub message: String,
    pub module: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

/// Bounded in-memory buffer of recent log records. Appends are best
/// effort: a record that cannot be stored is dropped, never surfaced to
/// the logging call site.
pub struct LogRing {
    entries: Mutex<VecDeque<LogRecord>>,
    capacity: usize,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        LogRing {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
            capacity,
        }
    }

    pub fn append(&self, record: LogRecord) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(record);
    }

    /// The most recent `limit` records, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<LogRecord> {
        let entries = self.entries.lock();
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn by_level(&self, level: &str, limit: usize) -> Vec<LogRecord> {
        let wanted = level.to_uppercase();
        let entries = self.entries.lock();
        let matching: Vec<LogRecord> = entries
            .iter()
            .filter(|r| r.level == wanted)
            .cloned()
            .collect();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).collect()
    }

    pub fn by_logger(&self, logger: &str, limit: usize) -> Vec<LogRecord> {
        let entries = self.entries.lock();
        let matching: Vec<LogRecord> = entries
            .iter()
            .filter(|r| r.logger == logger)
            .cloned()
            .collect();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl Default for LogRing {
    fn default() -> Self {
        LogRing::new(RING_CAPACITY)
    }
}

/// Tracing layer that mirrors every event into a LogRing.
pub struct RingLayer {
    ring: Arc<LogRing>,
}

impl RingLayer {
    pub fn new(ring: Arc<LogRing>) -> Self {
        RingLayer { ring }
    }
}

impl<S: Subscriber> Layer<S> for RingLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldCollector::default();
        event.record(&mut visitor);

        let meta = event.metadata();
        self.ring.append(LogRecord {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level: meta.level().to_string(),
            logger: meta.target().to_string(),
            message: visitor.message,
            module: meta.module_path().map(|m| m.to_string()),
            file: meta.file().map(|f| f.to_string()),
            line: meta.line(),
            extra: visitor.fields,
        });
    }
}

#[derive(Default)]
struct FieldCollector {
    message: String,
    fields: BTreeMap<String, String>,
}

impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.insert(field.name().to_string(), value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields
                .insert(field.name().to_string(), format!("{value:?}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(level: &str, logger: &str, message: &str) -> LogRecord {
        LogRecord {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level: level.to_string(),
            logger: logger.to_string(),
            message: message.to_string(),
            module: None,
            file: None,
            line: None,
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn ring_is_bounded() {
        let ring = LogRing::new(3);
        for i in 0..10 {
            ring.append(record("INFO", "crawler", &format!("msg {i}")));
        }
        assert_eq!(ring.len(), 3);
        let recent = ring.recent(10);
        assert_eq!(recent[0].message, "msg 7");
        assert_eq!(recent[2].message, "msg 9");
    }

    #[test]
    fn recent_limits_and_orders() {
        let ring = LogRing::new(100);
        for i in 0..5 {
            ring.append(record("INFO", "crawler", &format!("m{i}")));
        }
        let recent = ring.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "m3");
        assert_eq!(recent[1].message, "m4");
    }

    #[test]
    fn filter_by_level() {
        let ring = LogRing::new(100);
        ring.append(record("INFO", "a", "one"));
        ring.append(record("ERROR", "a", "two"));
        ring.append(record("ERROR", "b", "three"));
        let errors = ring.by_level("error", 10);
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|r| r.level == "ERROR"));
    }

    #[test]
    fn filter_by_logger() {
        let ring = LogRing::new(100);
        ring.append(record("INFO", "storage", "one"));
        ring.append(record("INFO", "crawler", "two"));
        let storage = ring.by_logger("storage", 10);
        assert_eq!(storage.len(), 1);
        assert_eq!(storage[0].message, "one");
    }

    #[test]
    fn layer_captures_events() {
        use tracing_subscriber::prelude::*;

        let ring = Arc::new(LogRing::default());
        let subscriber = tracing_subscriber::registry().with(RingLayer::new(ring.clone()));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(url = "https://a.test/", "page stored");
        });

        let recent = ring.recent(10);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].message, "page stored");
        assert_eq!(recent[0].extra.get("url").unwrap(), "https://a.test/");
        assert_eq!(recent[0].level, "INFO");
    }
}
