//! Audit Log Store
//!
//! Bounded, append-only buffer of timestamped entries. When an append pushes
//! the buffer past [`MAX_LOG`] entries, the oldest [`EVICT_BATCH`] are dropped
//! in a single compaction instead of one at a time.
//!
//! Appends are serialized under one lock that also covers the fan-out send
//! and queueing the optional file write, so observers and the file see
//! entries in append order. The disk write itself happens on a writer
//! thread, outside the lock.

use crate::events::EventBus;
use crate::file_sink::FileSink;
use chrono::{DateTime, SecondsFormat, Utc};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing::warn;

/// Maximum retained entries
pub const MAX_LOG: usize = 1000;

/// Entries removed per compaction
pub const EVICT_BATCH: usize = 500;

/// An immutable log entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl LogEntry {
    fn now(message: String) -> Self {
        Self {
            timestamp: Utc::now(),
            message,
        }
    }

    /// `[<rfc3339>] <message>`
    pub fn format(&self) -> String {
        format!(
            "[{}] {}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.message
        )
    }
}

struct Inner {
    entries: Vec<LogEntry>,
    file: Option<FileSink>,
}

/// Audit log shared by the engine and its readers
pub struct LogStore {
    inner: Mutex<Inner>,
    events: EventBus,
}

impl LogStore {
    /// In-memory store publishing to `events`
    pub fn new(events: EventBus) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: Vec::with_capacity(MAX_LOG + 1),
                file: None,
            }),
            events,
        }
    }

    /// Also append every entry to `path`
    ///
    /// An unopenable file is logged and the store stays in-memory only.
    pub fn with_file(events: EventBus, path: &Path) -> Self {
        let store = Self::new(events);
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!("Cannot create log directory {}: {}", parent.display(), e);
            }
        }
        let sink = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|file| FileSink::append("vpnd-audit-log", file));
        match sink {
            Ok(sink) => store.lock().file = Some(sink),
            Err(e) => warn!("Cannot open audit log {}: {}", path.display(), e),
        }
        store
    }

    /// Timestamp and append a message
    pub fn append(&self, message: impl Into<String>) -> LogEntry {
        let entry = LogEntry::now(message.into());
        let line = entry.format();

        let mut inner = self.lock();
        inner.entries.push(entry.clone());
        if inner.entries.len() > MAX_LOG {
            inner.entries.drain(..EVICT_BATCH);
        }

        if let Some(file) = &inner.file {
            file.write(line.clone());
        }

        self.events.emit_log(line);
        entry
    }

    /// The most recent `min(count, len)` entries, oldest first
    pub fn tail(&self, count: usize) -> Vec<LogEntry> {
        let inner = self.lock();
        let start = inner.entries.len().saturating_sub(count);
        inner.entries[start..].to_vec()
    }

    /// Same as [`tail`](Self::tail), formatted
    pub fn tail_lines(&self, count: usize) -> Vec<String> {
        self.tail(count).iter().map(LogEntry::format).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until queued entries are on disk
    pub fn flush(&self) {
        let file = self.lock().file.clone();
        if let Some(file) = file {
            file.flush();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
