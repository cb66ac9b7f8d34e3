pub mod config;
pub mod copy_guard;
pub mod dedup;
pub mod error_codes;
pub mod event_log;
pub mod latest_watcher;
pub mod media_scan;
pub mod notifier;
pub mod path_validation;
pub mod service;
pub mod tracker_store;

#[cfg(test)]
mod lib_tests;

use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use config::AppConfig;
use copy_guard::CopyGuard;
use event_log::EventLogger;
use media_scan::{CommandMediaScanner, MediaScanner, NoopMediaScanner};
use notifier::{DirectoryNotifier, NotifyAdapter, Subscription};
use service::TrackerService;
use tracker_store::TrackerStore;

/// Installs the global `tracing` subscriber. `RUST_LOG` takes precedence.
pub fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Explicitly constructed handles shared by the whole process.
pub struct AppRuntime {
    pub config: AppConfig,
    pub logger: Arc<EventLogger>,
    pub store: Arc<TrackerStore>,
    pub service: Arc<TrackerService>,
    /// Reloads `store` when another process rewrites the tracker file.
    _store_follower: Option<Box<dyn Subscription>>,
}

impl AppRuntime {
    pub fn build(config: AppConfig) -> Result<Self> {
        let notifier: Arc<dyn DirectoryNotifier> = Arc::new(NotifyAdapter::new(
            config.notifier_backend,
            config.poll_interval(),
        ));
        Self::build_with_notifier(config, notifier)
    }

    pub fn build_with_notifier(
        config: AppConfig,
        notifier: Arc<dyn DirectoryNotifier>,
    ) -> Result<Self> {
        let mut logger = EventLogger::with_dedup_window(config.max_log_lines, config.dedup_window());
        if let Some(path) = &config.event_log_file {
            logger = logger.with_file(path)?;
        }
        logger.set_extended_logging(config.extended_logging);
        let logger = Arc::new(logger);

        let scanner: Arc<dyn MediaScanner> = match config
            .media_scan_command
            .as_deref()
            .and_then(CommandMediaScanner::from_argv)
        {
            Some(scanner) => Arc::new(scanner),
            None => Arc::new(NoopMediaScanner),
        };

        let guard = Arc::new(
            CopyGuard::new(Arc::clone(&logger))
                .with_scanner(scanner)
                .with_timing(config.write_poll_interval(), config.write_timeout())
                .with_preserve_times(config.preserve_times),
        );

        let store = Arc::new(TrackerStore::open(&config.trackers_file)?);
        let store_follower = store.follow_file(notifier.as_ref())?;
        let service =
            Arc::new(TrackerService::new(guard, notifier).with_backfill_limit(config.backfill_limit));

        Ok(Self {
            config,
            logger,
            store,
            service,
            _store_follower: store_follower,
        })
    }
}
