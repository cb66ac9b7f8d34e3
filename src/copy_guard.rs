//! Guarded, idempotent file copy.
//!
//! A copy never overwrites: if the destination exists the copy is refused.
//! Every outcome is reported to the event log with the paths and sizes involved.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::error_codes;
use crate::event_log::{EventLogger, LogLevel};
use crate::media_scan::{MediaScanner, NoopMediaScanner};

const TAG: &str = "FileCopy";

/// Default interval between size checks while waiting for a writer
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default upper bound on waiting for a file to become non-empty
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum CopyError {
    #[error("Source file not found or not a regular file: {path}")]
    SourceMissingOrNotFile { path: PathBuf },

    #[error("No read permission for {path}: {source}")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Destination already exists: {path}")]
    DestinationAlreadyExists { path: PathBuf },

    #[error("Parent directory undeterminable for {path}")]
    ParentDirUndeterminable { path: PathBuf },

    #[error("Failed to create directory {path}: {reason}")]
    DirectoryCreateFailed { path: PathBuf, reason: String },

    #[error("Copy failed {from} -> {to}: {source}")]
    CopyStream {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Copy verification failed {from} ({source_len} bytes) -> {to} ({dest_len:?} bytes)")]
    PostCopySizeMismatch {
        from: PathBuf,
        to: PathBuf,
        source_len: u64,
        dest_len: Option<u64>,
    },

    #[error("Source still empty after {waited:?}: {path}")]
    SourceStillEmptyAtTimeout { path: PathBuf, waited: Duration },
}

impl CopyError {
    pub fn code(&self) -> &'static str {
        match self {
            CopyError::SourceMissingOrNotFile { .. } => error_codes::ERR_SOURCE_MISSING,
            CopyError::PermissionDenied { .. } => error_codes::ERR_PERMISSION_DENIED,
            CopyError::DestinationAlreadyExists { .. } => error_codes::ERR_DEST_EXISTS,
            CopyError::ParentDirUndeterminable { .. } => error_codes::ERR_PARENT_UNDETERMINABLE,
            CopyError::DirectoryCreateFailed { .. } => error_codes::ERR_DIR_CREATE_FAILED,
            CopyError::CopyStream { .. } => error_codes::ERR_COPY_STREAM,
            CopyError::PostCopySizeMismatch { .. } => error_codes::ERR_SIZE_MISMATCH,
            CopyError::SourceStillEmptyAtTimeout { .. } => error_codes::ERR_SOURCE_EMPTY,
        }
    }

    /// Expected refusals are warnings, real failures are errors.
    pub fn level(&self) -> LogLevel {
        match self {
            CopyError::SourceMissingOrNotFile { .. }
            | CopyError::PermissionDenied { .. }
            | CopyError::DestinationAlreadyExists { .. }
            | CopyError::SourceStillEmptyAtTimeout { .. } => LogLevel::Warn,
            _ => LogLevel::Error,
        }
    }
}

pub struct CopyGuard {
    logger: Arc<EventLogger>,
    scanner: Arc<dyn MediaScanner>,
    poll_interval: Duration,
    write_timeout: Duration,
    preserve_times: bool,
}

impl CopyGuard {
    pub fn new(logger: Arc<EventLogger>) -> Self {
        Self {
            logger,
            scanner: Arc::new(NoopMediaScanner),
            poll_interval: DEFAULT_POLL_INTERVAL,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            preserve_times: true,
        }
    }

    pub fn with_scanner(mut self, scanner: Arc<dyn MediaScanner>) -> Self {
        self.scanner = scanner;
        self
    }

    pub fn with_timing(mut self, poll_interval: Duration, write_timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.write_timeout = write_timeout;
        self
    }

    pub fn with_preserve_times(mut self, preserve_times: bool) -> Self {
        self.preserve_times = preserve_times;
        self
    }

    pub fn logger(&self) -> &Arc<EventLogger> {
        &self.logger
    }

    /// Waits until `source` is non-empty.
    ///
    /// Directory events can arrive before the writer flushed a single byte, so
    /// the size is polled until it becomes non-zero or the timeout elapses.
    /// A missing file counts as empty.
    pub fn check_copy_preconditions(&self, source: &Path) -> bool {
        match self.wait_for_content(source) {
            Ok(_) => true,
            Err(e) => {
                self.report(&e);
                false
            }
        }
    }

    fn wait_for_content(&self, source: &Path) -> Result<u64, CopyError> {
        let start = Instant::now();
        let mut len = file_len(source);

        while len == 0 && start.elapsed() < self.write_timeout {
            thread::sleep(self.poll_interval);
            len = file_len(source);
        }

        if len == 0 {
            return Err(CopyError::SourceStillEmptyAtTimeout {
                path: source.to_path_buf(),
                waited: start.elapsed(),
            });
        }
        Ok(len)
    }

    /// Copies `source` to `destination`, logging the outcome.
    pub fn copy(&self, source: &Path, destination: &Path) -> bool {
        match self.try_copy(source, destination) {
            Ok(bytes) => {
                self.logger.info(
                    TAG,
                    &format!(
                        "File copied: {} -> {} size={bytes}",
                        source.display(),
                        destination.display()
                    ),
                );
                self.scanner.rescan(destination);
                true
            }
            Err(e) => {
                self.report(&e);
                false
            }
        }
    }

    /// Waits for content, then copies `source` into `dest_dir` under its own file name.
    pub fn copy_into_dir(&self, source: &Path, dest_dir: &Path) -> bool {
        if !self.check_copy_preconditions(source) {
            return false;
        }

        let Some(name) = source.file_name() else {
            self.report(&CopyError::SourceMissingOrNotFile {
                path: source.to_path_buf(),
            });
            return false;
        };

        self.copy(source, &dest_dir.join(name))
    }

    /// Typed copy: returns the number of bytes copied.
    pub fn try_copy(&self, source: &Path, destination: &Path) -> Result<u64, CopyError> {
        let meta = fs::metadata(source).map_err(|_| CopyError::SourceMissingOrNotFile {
            path: source.to_path_buf(),
        })?;
        if !meta.is_file() {
            return Err(CopyError::SourceMissingOrNotFile {
                path: source.to_path_buf(),
            });
        }

        let input = File::open(source).map_err(|e| match e.kind() {
            io::ErrorKind::PermissionDenied => CopyError::PermissionDenied {
                path: source.to_path_buf(),
                source: e,
            },
            io::ErrorKind::NotFound => CopyError::SourceMissingOrNotFile {
                path: source.to_path_buf(),
            },
            _ => CopyError::CopyStream {
                from: source.to_path_buf(),
                to: destination.to_path_buf(),
                source: e,
            },
        })?;

        if destination.is_file() {
            return Err(CopyError::DestinationAlreadyExists {
                path: destination.to_path_buf(),
            });
        }

        let parent = destination
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| CopyError::ParentDirUndeterminable {
                path: destination.to_path_buf(),
            })?;
        self.ensure_directory(parent)?;

        self.stream_copy(input, source, destination)?;

        if self.preserve_times {
            if let Ok(modified) = meta.modified() {
                let mtime = filetime::FileTime::from_system_time(modified);
                if let Err(e) = filetime::set_file_mtime(destination, mtime) {
                    tracing::debug!(path = %destination.display(), error = %e, "could not preserve mtime");
                }
            }
        }

        verify_copy(source, destination)
    }

    fn stream_copy(&self, input: File, source: &Path, destination: &Path) -> Result<(), CopyError> {
        // create_new keeps a racing writer's file intact
        let output = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(destination)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => CopyError::DestinationAlreadyExists {
                    path: destination.to_path_buf(),
                },
                _ => CopyError::CopyStream {
                    from: source.to_path_buf(),
                    to: destination.to_path_buf(),
                    source: e,
                },
            })?;

        let result = (|| {
            let mut reader = BufReader::new(input);
            let mut writer = BufWriter::new(output);
            io::copy(&mut reader, &mut writer)?;
            writer.flush()?;
            writer.get_ref().sync_all()
        })();

        if let Err(e) = result {
            // a partial file would block every retry with DestinationAlreadyExists
            let _ = fs::remove_file(destination);
            return Err(CopyError::CopyStream {
                from: source.to_path_buf(),
                to: destination.to_path_buf(),
                source: e,
            });
        }
        Ok(())
    }

    /// Creates `dir` and any missing parents.
    ///
    /// Returns `Ok(true)` if something was created, `Ok(false)` if the directory
    /// already existed.
    pub fn ensure_directory(&self, dir: &Path) -> Result<bool, CopyError> {
        if dir.as_os_str().to_string_lossy().trim().is_empty() {
            return Err(CopyError::DirectoryCreateFailed {
                path: dir.to_path_buf(),
                reason: "path is blank".to_string(),
            });
        }

        if dir.exists() {
            if !dir.is_dir() {
                return Err(CopyError::DirectoryCreateFailed {
                    path: dir.to_path_buf(),
                    reason: "path exists but is not a directory".to_string(),
                });
            }
            return Ok(false);
        }

        fs::create_dir_all(dir).map_err(|e| CopyError::DirectoryCreateFailed {
            path: dir.to_path_buf(),
            reason: e.to_string(),
        })?;

        self.logger
            .info(TAG, &format!("Directory created: {}", dir.display()));
        Ok(true)
    }

    /// Logging wrapper around [`ensure_directory`](Self::ensure_directory).
    pub fn create_dir_if_missing(&self, dir: &Path) -> bool {
        match self.ensure_directory(dir) {
            Ok(_) => true,
            Err(e) => {
                self.report(&e);
                false
            }
        }
    }

    fn report(&self, error: &CopyError) {
        self.logger
            .log(&format!("[{}] {error}", error.code()), TAG, error.level(), false);
    }
}

/// Destination must exist as a file with the source's length.
fn verify_copy(source: &Path, destination: &Path) -> Result<u64, CopyError> {
    let source_len = file_len(source);
    let dest_len = fs::metadata(destination)
        .ok()
        .filter(|m| m.is_file())
        .map(|m| m.len());

    if dest_len != Some(source_len) {
        return Err(CopyError::PostCopySizeMismatch {
            from: source.to_path_buf(),
            to: destination.to_path_buf(),
            source_len,
            dest_len,
        });
    }
    Ok(source_len)
}

fn file_len(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}
