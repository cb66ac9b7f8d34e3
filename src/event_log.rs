//! Event log sink.
//!
//! Every watcher and copy outcome is reported here. Entries are mirrored to
//! `tracing`, filtered by the extended-logging flag and the dedup cache, kept in
//! an in-memory ring and appended to an optional JSON-lines file.

use std::collections::VecDeque;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::dedup::DedupCache;

/// Default maximum number of log lines to keep in memory
pub const DEFAULT_MAX_LOG_LINES: usize = 10000;

const TYPE_SYSTEM: &str = "system";
const TYPE_EXTENDED: &str = "extended";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.pad(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id: u64,
    pub timestamp: String,
    pub level: LogLevel,
    pub message: String,
    #[serde(rename = "type")]
    pub entry_type: String,
}

pub struct EventLogger {
    entries: Mutex<VecDeque<EventLogEntry>>,
    max_lines: usize,
    next_id: AtomicU64,
    extended_logging: AtomicBool,
    dedup: DedupCache,
    file: Option<Mutex<File>>,
    file_path: Option<PathBuf>,
}

impl EventLogger {
    pub fn new(max_lines: usize) -> Self {
        Self::with_dedup_window(max_lines, crate::dedup::DEFAULT_DEDUP_WINDOW)
    }

    pub fn with_dedup_window(max_lines: usize, window: Duration) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(max_lines.min(1024))),
            max_lines,
            next_id: AtomicU64::new(1),
            extended_logging: AtomicBool::new(false),
            dedup: DedupCache::new(window),
            file: None,
            file_path: None,
        }
    }

    /// Mirror accepted entries to an append-only JSON-lines file.
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating event log directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening event log {}", path.display()))?;

        self.file = Some(Mutex::new(file));
        self.file_path = Some(path);
        Ok(self)
    }

    pub fn set_extended_logging(&self, enabled: bool) {
        self.extended_logging.store(enabled, Ordering::Relaxed);
    }

    pub fn extended_logging(&self) -> bool {
        self.extended_logging.load(Ordering::Relaxed)
    }

    /// Record one event.
    ///
    /// Returns `true` if the entry was stored. The `tracing` mirror is emitted
    /// even when the dedup cache drops the entry.
    pub fn log(&self, message: &str, tag: &str, level: LogLevel, extended: bool) -> bool {
        if extended && !self.extended_logging() {
            return false;
        }

        match level {
            LogLevel::Debug => tracing::debug!(tag, "{message}"),
            LogLevel::Info => tracing::info!(tag, "{message}"),
            LogLevel::Warn => tracing::warn!(tag, "{message}"),
            LogLevel::Error => tracing::error!(tag, "{message}"),
        }

        if !self.dedup.check_and_insert(message) {
            return false;
        }

        let entry = EventLogEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            timestamp: chrono::Utc::now().to_rfc3339(),
            level,
            message: message.to_string(),
            entry_type: if extended { TYPE_EXTENDED } else { TYPE_SYSTEM }.to_string(),
        };

        self.append_to_file(&entry);

        let mut entries = self.lock_entries();
        entries.push_back(entry);
        while entries.len() > self.max_lines {
            entries.pop_front();
        }

        true
    }

    pub fn info(&self, tag: &str, message: &str) -> bool {
        self.log(message, tag, LogLevel::Info, false)
    }

    pub fn warn(&self, tag: &str, message: &str) -> bool {
        self.log(message, tag, LogLevel::Warn, false)
    }

    pub fn error(&self, tag: &str, message: &str) -> bool {
        self.log(message, tag, LogLevel::Error, false)
    }

    /// Extended (verbose) entry at debug level.
    pub fn trace(&self, tag: &str, message: &str) -> bool {
        self.log(message, tag, LogLevel::Debug, true)
    }

    pub fn get_logs(&self) -> Vec<EventLogEntry> {
        self.lock_entries().iter().cloned().collect()
    }

    /// The last `limit` entries in chronological order.
    pub fn contains_message(&self, needle: &str) -> bool {
        self.lock_entries().iter().any(|e| e.message.contains(needle))
    }

    pub fn clear(&self) -> Result<()> {
        self.lock_entries().clear();
        self.dedup.clear();

        if let (Some(file), Some(path)) = (&self.file, &self.file_path) {
            let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
            *file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path)
                .with_context(|| format!("truncating event log {}", path.display()))?;
        }
        Ok(())
    }

    fn append_to_file(&self, entry: &EventLogEntry) {
        let Some(file) = &self.file else {
            return;
        };

        let line = match serde_json::to_string(entry) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialise event log entry");
                return;
            }
        };

        let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writeln!(file, "{line}") {
            tracing::warn!(error = %e, "failed to append event log entry");
        }
    }

    fn lock_entries(&self) -> MutexGuard<'_, VecDeque<EventLogEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Read the last `limit` entries of a JSON-lines event log. Corrupt lines are skipped.
pub fn read_log_file(path: &Path, limit: usize) -> Result<Vec<EventLogEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut entries: VecDeque<EventLogEntry> = VecDeque::new();

    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<EventLogEntry>(&line) {
            Ok(entry) => {
                entries.push_back(entry);
                if entries.len() > limit {
                    entries.pop_front();
                }
            }
            Err(e) => tracing::debug!(error = %e, "skipping corrupt event log line"),
        }
    }

    Ok(entries.into_iter().collect())
}
