use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::event_log::DEFAULT_MAX_LOG_LINES;
use crate::latest_watcher::DEFAULT_BACKFILL_LIMIT;
use crate::notifier::BackendPreference;

/// Application configuration, read from a YAML file.
///
/// Every field has a default so a partial (or missing) file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub trackers_file: PathBuf,
    pub event_log_file: Option<PathBuf>,
    pub extended_logging: bool,
    pub max_log_lines: usize,
    pub dedup_window_secs: u64,
    pub backfill_limit: usize,
    pub write_poll_interval_ms: u64,
    pub write_timeout_ms: u64,
    pub preserve_times: bool,
    pub notifier_backend: BackendPreference,
    pub poll_interval_ms: u64,
    pub media_scan_command: Option<Vec<String>>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            trackers_file: PathBuf::from("trackers.yaml"),
            event_log_file: Some(PathBuf::from("event_log.jsonl")),
            extended_logging: false,
            max_log_lines: DEFAULT_MAX_LOG_LINES,
            dedup_window_secs: 60,
            backfill_limit: DEFAULT_BACKFILL_LIMIT,
            write_poll_interval_ms: 100,
            write_timeout_ms: 5_000,
            preserve_times: true,
            notifier_backend: BackendPreference::Auto,
            poll_interval_ms: 1_000,
            media_scan_command: None,
        }
    }
}

impl AppConfig {
    /// Loads the config at `path`. A missing file yields the defaults.
    ///
    /// Relative store and log paths are resolved against the config file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            if text.trim().is_empty() {
                Self::default()
            } else {
                serde_yaml::from_str(&text)
                    .with_context(|| format!("parsing config {}", path.display()))?
            }
        } else {
            Self::default()
        };

        let base = path.parent().unwrap_or_else(|| Path::new(""));
        config.resolve_relative_to(base);
        Ok(config)
    }

    fn resolve_relative_to(&mut self, base: &Path) {
        if self.trackers_file.is_relative() {
            self.trackers_file = base.join(&self.trackers_file);
        }
        if let Some(log) = self.event_log_file.as_mut() {
            if log.is_relative() {
                *log = base.join(&*log);
            }
        }
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }

    pub fn write_poll_interval(&self) -> Duration {
        Duration::from_millis(self.write_poll_interval_ms.max(1))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }
}
