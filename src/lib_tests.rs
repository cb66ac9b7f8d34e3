#[cfg(test)]
mod integration_tests {
    use crate::config::AppConfig;
    use crate::copy_guard::{CopyError, CopyGuard};
    use crate::error_codes;
    use crate::event_log::EventLogger;
    use crate::latest_watcher::{LatestFolderWatcher, WatcherSettings, NO_MEDIA_MARKER};
    use crate::notifier::{
        BackendPreference, DirectoryNotifier, EventCallback, EventMask, NotifyAdapter,
        Subscription,
    };
    use crate::service::TrackerService;
    use crate::tracker_store::{Tracker, TrackerStore};
    use crate::AppRuntime;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    /// Delivers events only when a test calls `fire`.
    #[derive(Default)]
    struct ManualNotifier {
        subscriptions: Mutex<Vec<Arc<ManualState>>>,
    }

    struct ManualState {
        path: PathBuf,
        mask: EventMask,
        on_event: EventCallback,
        active: AtomicBool,
        starts: AtomicUsize,
    }

    struct ManualSubscription(Arc<ManualState>);

    impl Subscription for ManualSubscription {
        fn start(&mut self) {
            if !self.0.active.swap(true, Ordering::SeqCst) {
                self.0.starts.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn stop(&mut self) {
            self.0.active.store(false, Ordering::SeqCst);
        }

        fn is_active(&self) -> bool {
            self.0.active.load(Ordering::SeqCst)
        }

        fn path(&self) -> &Path {
            &self.0.path
        }
    }

    impl DirectoryNotifier for ManualNotifier {
        fn subscribe(
            &self,
            path: &Path,
            mask: EventMask,
            on_event: EventCallback,
        ) -> Box<dyn Subscription> {
            let state = Arc::new(ManualState {
                path: path.to_path_buf(),
                mask,
                on_event,
                active: AtomicBool::new(false),
                starts: AtomicUsize::new(0),
            });
            self.subscriptions.lock().unwrap().push(Arc::clone(&state));
            Box::new(ManualSubscription(state))
        }
    }

    impl ManualNotifier {
        fn fire(&self, dir: &Path, bits: EventMask, name: &str) {
            let targets: Vec<_> = self
                .subscriptions
                .lock()
                .unwrap()
                .iter()
                .filter(|s| s.path == dir && s.active.load(Ordering::SeqCst) && s.mask.intersects(bits))
                .cloned()
                .collect();

            for state in targets {
                (state.on_event)(bits, Some(Path::new(name)));
            }
        }

        fn total_starts(&self) -> usize {
            self.subscriptions
                .lock()
                .unwrap()
                .iter()
                .map(|s| s.starts.load(Ordering::SeqCst))
                .sum()
        }

        fn active_paths(&self) -> Vec<PathBuf> {
            self.subscriptions
                .lock()
                .unwrap()
                .iter()
                .filter(|s| s.active.load(Ordering::SeqCst))
                .map(|s| s.path.clone())
                .collect()
        }
    }

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        dest: PathBuf,
        notifier: Arc<ManualNotifier>,
        guard: Arc<CopyGuard>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let root = dir.path().join("root");
            let dest = dir.path().join("dest");
            fs::create_dir_all(&root).unwrap();

            let logger = Arc::new(EventLogger::new(1000));
            let guard = Arc::new(
                CopyGuard::new(logger)
                    .with_timing(Duration::from_millis(5), Duration::from_millis(100)),
            );

            Self {
                _dir: dir,
                root,
                dest,
                notifier: Arc::new(ManualNotifier::default()),
                guard,
            }
        }

        fn watcher(&self, watch_subfolders: bool) -> LatestFolderWatcher {
            LatestFolderWatcher::new(
                WatcherSettings::new(&self.root, &self.dest, watch_subfolders),
                Arc::clone(&self.guard),
                self.notifier.clone(),
            )
        }

        fn dest_files(&self) -> Vec<String> {
            let mut names: Vec<String> = match fs::read_dir(&self.dest) {
                Ok(entries) => entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect(),
                Err(_) => Vec::new(),
            };
            names.sort();
            names
        }
    }

    #[test]
    fn test_start_twice_subscribes_once() {
        let fx = Fixture::new();
        let watcher = fx.watcher(true);

        watcher.start_watching();
        watcher.start_watching();

        assert!(watcher.is_watching());
        assert_eq!(fx.notifier.total_starts(), 1);
        assert!(fx
            .guard
            .logger()
            .contains_message("startWatching called, but already watching root"));

        watcher.stop_watching();
        assert!(!watcher.is_watching());
        assert!(fx.notifier.active_paths().is_empty());
    }

    #[test]
    fn test_stop_without_start_is_noop() {
        let fx = Fixture::new();
        let watcher = fx.watcher(true);

        watcher.stop_watching();
        watcher.stop_watching();

        assert!(!watcher.is_watching());
        assert_eq!(fx.notifier.total_starts(), 0);
        assert!(fx
            .guard
            .logger()
            .contains_message("stopWatching called, but was not watching root"));
    }

    #[test]
    fn test_start_follows_latest_existing_subfolder() {
        let fx = Fixture::new();
        for name in ["2024-01-01", "2024-01-02"] {
            fs::create_dir(fx.root.join(name)).unwrap();
        }
        fs::write(fx.root.join("2024-01-01").join("old.jpg"), b"old").unwrap();
        fs::write(fx.root.join("2024-01-02").join("new.jpg"), b"new").unwrap();

        let watcher = fx.watcher(true);
        watcher.start_watching();

        assert_eq!(watcher.current_folder(), Some(fx.root.join("2024-01-02")));
        assert_eq!(fx.dest_files(), vec!["new.jpg".to_string()]);

        let mut active = fx.notifier.active_paths();
        active.sort();
        assert_eq!(active, vec![fx.root.clone(), fx.root.join("2024-01-02")]);
    }

    #[test]
    fn test_switches_to_lexicographic_max_subfolder() {
        let fx = Fixture::new();
        let watcher = fx.watcher(true);
        watcher.start_watching();
        assert_eq!(watcher.current_folder(), None);

        for name in ["2024-01-01", "2024-01-02", "2024-01-03"] {
            fs::create_dir(fx.root.join(name)).unwrap();
            fx.notifier.fire(&fx.root, EventMask::CREATE, name);
        }
        assert_eq!(watcher.current_folder(), Some(fx.root.join("2024-01-03")));

        // an older name created later does not win
        fs::create_dir(fx.root.join("2023-12-31")).unwrap();
        fx.notifier.fire(&fx.root, EventMask::MOVED_TO, "2023-12-31");
        assert_eq!(watcher.current_folder(), Some(fx.root.join("2024-01-03")));

        // only one nested subscription stays active
        let active = fx.notifier.active_paths();
        assert_eq!(active.len(), 2);
        assert!(active.contains(&fx.root.join("2024-01-03")));
    }

    #[test]
    fn test_live_file_in_current_subfolder_is_copied() {
        let fx = Fixture::new();
        let folder = fx.root.join("2024-05-01");
        fs::create_dir(&folder).unwrap();

        let watcher = fx.watcher(true);
        watcher.start_watching();

        fs::write(folder.join("IMG_1.jpg"), b"jpeg bytes").unwrap();
        fx.notifier.fire(&folder, EventMask::CREATE, "IMG_1.jpg");

        fs::write(folder.join(NO_MEDIA_MARKER), b"x").unwrap();
        fx.notifier.fire(&folder, EventMask::CREATE, NO_MEDIA_MARKER);

        // not a file: ignored without aborting the watcher
        fs::create_dir(folder.join("nested")).unwrap();
        fx.notifier.fire(&folder, EventMask::CREATE, "nested");

        assert_eq!(fx.dest_files(), vec!["IMG_1.jpg".to_string()]);
        assert_eq!(fs::read(fx.dest.join("IMG_1.jpg")).unwrap(), b"jpeg bytes");
        assert!(watcher.is_watching());
    }

    #[test]
    fn test_files_in_root_ignored_in_subfolder_mode() {
        let fx = Fixture::new();
        let watcher = fx.watcher(true);
        watcher.start_watching();

        fs::write(fx.root.join("loose.txt"), b"data").unwrap();
        fx.notifier.fire(&fx.root, EventMask::CREATE, "loose.txt");

        assert!(fx.dest_files().is_empty());
        assert_eq!(watcher.current_folder(), None);
    }

    #[test]
    fn test_flat_mode_backfill_caps_at_twenty() {
        let fx = Fixture::new();
        for i in 0..25 {
            fs::write(fx.root.join(format!("file_{i:02}.dat")), b"payload").unwrap();
        }
        fs::write(fx.root.join(NO_MEDIA_MARKER), b"marker").unwrap();
        fs::create_dir(fx.root.join("zz_subfolder")).unwrap();

        let watcher = fx.watcher(false);
        watcher.start_watching();

        let copied = fx.dest_files();
        assert_eq!(copied.len(), 20);
        assert_eq!(copied.first().map(String::as_str), Some("file_05.dat"));
        assert_eq!(copied.last().map(String::as_str), Some("file_24.dat"));
        assert!(!copied.contains(&NO_MEDIA_MARKER.to_string()));
        assert_eq!(watcher.current_folder(), None);
    }

    #[test]
    fn test_flat_mode_copies_new_root_files() {
        let fx = Fixture::new();
        let watcher = fx.watcher(false);
        watcher.start_watching();

        fs::write(fx.root.join("scan.pdf"), b"%PDF").unwrap();
        fx.notifier.fire(&fx.root, EventMask::CREATE, "scan.pdf");

        // the marker is never copied, live or backfilled
        fs::write(fx.root.join(NO_MEDIA_MARKER), b"marker").unwrap();
        fx.notifier.fire(&fx.root, EventMask::CREATE, NO_MEDIA_MARKER);

        // directories never switch anything in flat mode
        fs::create_dir(fx.root.join("2099-01-01")).unwrap();
        fx.notifier.fire(&fx.root, EventMask::CREATE, "2099-01-01");

        assert_eq!(fx.dest_files(), vec!["scan.pdf".to_string()]);
        assert_eq!(watcher.current_folder(), None);
    }

    #[test]
    fn test_failed_copy_does_not_stop_later_files() {
        let fx = Fixture::new();
        let watcher = fx.watcher(false);
        watcher.start_watching();

        fs::write(fx.root.join("empty.bin"), b"").unwrap();
        fx.notifier.fire(&fx.root, EventMask::CREATE, "empty.bin");

        fs::create_dir_all(&fx.dest).unwrap();
        fs::write(fx.dest.join("dup.txt"), b"original").unwrap();
        fs::write(fx.root.join("dup.txt"), b"replacement").unwrap();
        fx.notifier.fire(&fx.root, EventMask::CREATE, "dup.txt");

        fs::write(fx.root.join("good.txt"), b"fine").unwrap();
        fx.notifier.fire(&fx.root, EventMask::CREATE, "good.txt");

        assert_eq!(
            fx.dest_files(),
            vec!["dup.txt".to_string(), "good.txt".to_string()]
        );
        assert_eq!(fs::read(fx.dest.join("dup.txt")).unwrap(), b"original");
        assert!(watcher.is_watching());
    }

    #[test]
    fn test_revisiting_folder_never_overwrites() {
        let fx = Fixture::new();
        let first = fx.root.join("a");
        let second = fx.root.join("b");
        fs::create_dir(&first).unwrap();
        fs::write(first.join("one.txt"), b"first copy").unwrap();

        let watcher = fx.watcher(true);
        watcher.start_watching();
        assert_eq!(fx.dest_files(), vec!["one.txt".to_string()]);

        // change the source after the backfill; a revisit must not overwrite
        fs::write(first.join("one.txt"), b"changed content").unwrap();
        fs::create_dir(&second).unwrap();
        fx.notifier.fire(&fx.root, EventMask::CREATE, "b");
        assert_eq!(watcher.current_folder(), Some(second));

        assert!(watcher.switch_to_folder(&first));
        assert_eq!(watcher.current_folder(), Some(first.clone()));
        assert_eq!(fs::read(fx.dest.join("one.txt")).unwrap(), b"first copy");

        let err = fx
            .guard
            .try_copy(&first.join("one.txt"), &fx.dest.join("one.txt"))
            .unwrap_err();
        assert!(matches!(err, CopyError::DestinationAlreadyExists { .. }));
    }

    #[test]
    fn test_events_after_stop_are_ignored() {
        let fx = Fixture::new();
        let folder = fx.root.join("2024-02-02");
        fs::create_dir(&folder).unwrap();

        let watcher = fx.watcher(true);
        watcher.start_watching();
        watcher.stop_watching();
        assert_eq!(watcher.current_folder(), None);

        fs::write(folder.join("late.jpg"), b"late").unwrap();
        fx.notifier.fire(&folder, EventMask::CREATE, "late.jpg");
        fs::create_dir(fx.root.join("2024-03-03")).unwrap();
        fx.notifier.fire(&fx.root, EventMask::CREATE, "2024-03-03");

        assert!(fx.dest_files().is_empty());
        assert_eq!(watcher.current_folder(), None);
    }

    #[test]
    fn test_switch_rejected_in_flat_mode() {
        let fx = Fixture::new();
        let watcher = fx.watcher(false);
        watcher.start_watching();

        assert!(!watcher.switch_to_folder(&fx.root));
        assert_eq!(watcher.current_folder(), None);
    }

    #[test]
    fn test_service_starts_only_active_trackers() {
        let fx = Fixture::new();
        let service = TrackerService::new(Arc::clone(&fx.guard), fx.notifier.clone());

        let mut inactive = Tracker::new(&fx.root, fx.dest.join("off"));
        inactive.id = 2;
        inactive.is_active = false;
        let mut active = Tracker::new(&fx.root, &fx.dest);
        active.id = 1;

        assert_eq!(service.apply_trackers(&[active.clone(), inactive]), 1);
        assert_eq!(service.watching_trackers(), vec![1]);

        // re-applying replaces sessions instead of stacking them
        assert_eq!(service.apply_trackers(&[active]), 1);
        assert_eq!(fx.notifier.active_paths(), vec![fx.root.clone()]);

        service.stop_all();
        assert_eq!(service.session_count(), 0);
        assert!(fx.notifier.active_paths().is_empty());
    }

    #[tokio::test]
    async fn test_service_follows_store_changes() -> anyhow::Result<()> {
        let fx = Fixture::new();
        let store = TrackerStore::in_memory();
        let service = Arc::new(TrackerService::new(
            Arc::clone(&fx.guard),
            fx.notifier.clone(),
        ));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&service).run(store.trackers_live(), cancel.clone()));

        let id = store.insert(Tracker::new(&fx.root, &fx.dest))?;
        wait_until(|| service.session_count() == 1).await;

        store.set_active(id, false)?;
        wait_until(|| service.session_count() == 0).await;

        store.set_active(id, true)?;
        wait_until(|| service.session_count() == 1).await;

        cancel.cancel();
        handle.await??;
        assert_eq!(service.session_count(), 0);
        Ok(())
    }

    #[test]
    fn test_runtime_builds_from_config() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let config = AppConfig {
            trackers_file: dir.path().join("trackers.yaml"),
            event_log_file: Some(dir.path().join("logs").join("events.jsonl")),
            extended_logging: true,
            ..AppConfig::default()
        };

        let runtime = AppRuntime::build_with_notifier(config, Arc::new(ManualNotifier::default()))?;
        assert!(runtime.logger.extended_logging());
        assert!(runtime.store.list().is_empty());
        assert_eq!(runtime.service.session_count(), 0);
        assert!(dir.path().join("logs").join("events.jsonl").exists());
        Ok(())
    }

    #[test]
    fn test_end_to_end_with_native_notifications() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let base = dir.path().canonicalize()?;
        let root = base.join("camera");
        let dest = base.join("backup");
        fs::create_dir_all(root.join("2024-01-01"))?;

        let logger = Arc::new(EventLogger::new(1000));
        let guard = Arc::new(
            CopyGuard::new(logger).with_timing(Duration::from_millis(10), Duration::from_secs(2)),
        );
        let notifier = Arc::new(NotifyAdapter::new(
            BackendPreference::Auto,
            Duration::from_millis(50),
        ));
        let watcher = LatestFolderWatcher::new(
            WatcherSettings::new(&root, &dest, true),
            guard,
            notifier,
        );
        watcher.start_watching();

        fs::create_dir(root.join("2024-01-02"))?;
        wait_blocking(|| watcher.current_folder() == Some(root.join("2024-01-02")));
        assert_eq!(watcher.current_folder(), Some(root.join("2024-01-02")));

        fs::write(root.join("2024-01-02").join("photo.jpg"), b"pixels")?;
        wait_blocking(|| dest.join("photo.jpg").is_file());
        assert_eq!(fs::read(dest.join("photo.jpg"))?, b"pixels");

        watcher.stop_watching();
        Ok(())
    }

    #[test]
    fn test_stop_not_blocked_by_slow_backfill() {
        let fx = Fixture::new();
        let folder = fx.root.join("2024-01-01");
        fs::create_dir(&folder).unwrap();
        for name in ["a.jpg", "b.jpg", "c.jpg"] {
            fs::write(folder.join(name), b"").unwrap();
        }

        let logger = Arc::new(EventLogger::new(1000));
        let guard = Arc::new(
            CopyGuard::new(Arc::clone(&logger))
                .with_timing(Duration::from_millis(10), Duration::from_secs(1)),
        );
        let watcher = LatestFolderWatcher::new(
            WatcherSettings::new(&fx.root, &fx.dest, true),
            guard,
            fx.notifier.clone(),
        );

        let stop_took = std::thread::scope(|s| {
            let starter = s.spawn(|| watcher.start_watching());
            std::thread::sleep(Duration::from_millis(200));

            let begin = Instant::now();
            watcher.stop_watching();
            let took = begin.elapsed();

            starter.join().unwrap();
            took
        });

        assert!(stop_took < Duration::from_millis(500), "stop took {stop_took:?}");
        assert!(!watcher.is_watching());
        assert!(fx.notifier.active_paths().is_empty());

        // the in-flight wait finishes, the remaining files are abandoned
        let timeouts = logger
            .get_logs()
            .iter()
            .filter(|e| e.message.contains(error_codes::ERR_SOURCE_EMPTY))
            .count();
        assert_eq!(timeouts, 1);
    }

    #[test]
    fn test_runtime_reloads_trackers_written_elsewhere() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let trackers_file = dir.path().join("trackers.yaml");
        let config = AppConfig {
            trackers_file: trackers_file.clone(),
            event_log_file: None,
            ..AppConfig::default()
        };
        let notifier = Arc::new(ManualNotifier::default());
        let runtime = AppRuntime::build_with_notifier(config, notifier.clone())?;
        let mut live = runtime.store.trackers_live();

        let other = TrackerStore::open(&trackers_file)?;
        let id = other.insert(Tracker::new(dir.path().join("src"), dir.path().join("dst")))?;
        assert!(!live.has_changed()?);

        notifier.fire(dir.path(), EventMask::MOVED_TO, "trackers.yaml");
        assert!(live.has_changed()?);
        assert_eq!(live.borrow_and_update()[0].id, id);

        other.set_active(id, false)?;
        notifier.fire(dir.path(), EventMask::CREATE, "unrelated.txt");
        assert!(!live.has_changed()?);

        notifier.fire(dir.path(), EventMask::MODIFY, "trackers.yaml");
        assert!(!live.borrow_and_update()[0].is_active);
        assert!(!runtime.store.list()[0].is_active);
        Ok(())
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn wait_blocking(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !condition() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}
