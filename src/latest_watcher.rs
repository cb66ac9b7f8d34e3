//! 최신 하위 폴더 감시 모듈
//!
//! 루트 폴더를 감시하면서 이름이 사전순으로 가장 큰 하위 폴더만 따라갑니다.
//! 새 하위 폴더가 생기면 그 폴더로 전환하고, 기존 파일을 백필한 뒤 새 파일을 복사합니다.
//! `watch_subfolders`가 꺼져 있으면 루트 폴더의 파일을 직접 감시합니다.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use walkdir::WalkDir;

use crate::copy_guard::CopyGuard;
use crate::event_log::EventLogger;
use crate::notifier::{DirectoryNotifier, EventCallback, EventMask, Subscription};

const TAG: &str = "LatestFolderWatcher";

/// Sentinel file that marks a folder as hidden from media indexing
pub const NO_MEDIA_MARKER: &str = ".nomedia";

/// Default cap on files copied when a watcher starts or switches folders
pub const DEFAULT_BACKFILL_LIMIT: usize = 20;

const NEW_ENTRY_MASK: EventMask = EventMask::CREATE.union(EventMask::MOVED_TO);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherSettings {
    pub root_path: PathBuf,
    pub dest_dir: PathBuf,
    pub watch_subfolders: bool,
    pub backfill_limit: usize,
}

impl WatcherSettings {
    pub fn new(root_path: impl Into<PathBuf>, dest_dir: impl Into<PathBuf>, watch_subfolders: bool) -> Self {
        Self {
            root_path: root_path.into(),
            dest_dir: dest_dir.into(),
            watch_subfolders,
            backfill_limit: DEFAULT_BACKFILL_LIMIT,
        }
    }
}

/// 하나의 Tracker에 대한 감시 세션
pub struct LatestFolderWatcher {
    inner: Arc<Inner>,
}

struct Inner {
    settings: WatcherSettings,
    guard: Arc<CopyGuard>,
    logger: Arc<EventLogger>,
    notifier: Arc<dyn DirectoryNotifier>,
    state: Mutex<SessionState>,
}

#[derive(Default)]
struct SessionState {
    watching: bool,
    root: Option<Box<dyn Subscription>>,
    current: Option<Box<dyn Subscription>>,
    current_folder: Option<PathBuf>,
}

impl LatestFolderWatcher {
    pub fn new(
        settings: WatcherSettings,
        guard: Arc<CopyGuard>,
        notifier: Arc<dyn DirectoryNotifier>,
    ) -> Self {
        let logger = Arc::clone(guard.logger());
        Self {
            inner: Arc::new(Inner {
                settings,
                guard,
                logger,
                notifier,
                state: Mutex::new(SessionState::default()),
            }),
        }
    }

    pub fn is_watching(&self) -> bool {
        self.inner.lock_state().watching
    }

    /// 현재 중첩 구독이 연결된 하위 폴더
    pub fn current_folder(&self) -> Option<PathBuf> {
        self.inner.lock_state().current_folder.clone()
    }

    pub fn start_watching(&self) {
        let inner = &self.inner;
        let root_path = &inner.settings.root_path;
        let mut state = inner.lock_state();

        if state.watching {
            inner.logger.warn(
                TAG,
                &format!("startWatching called, but already watching root: {}", root_path.display()),
            );
            return;
        }
        state.watching = true;
        inner
            .logger
            .info(TAG, &format!("Start watching root: {}", root_path.display()));

        let weak = Arc::downgrade(inner);
        let on_root: EventCallback = Arc::new(move |bits, relative| {
            if let Some(inner) = weak.upgrade() {
                inner.on_root_event(bits, relative);
            }
        });
        let mut root = inner.notifier.subscribe(root_path, EventMask::ALL, on_root);
        root.start();
        state.root = Some(root);

        if inner.settings.watch_subfolders {
            match find_latest_subfolder(root_path) {
                Some(latest) => {
                    inner.logger.info(
                        TAG,
                        &format!("Found latest subfolder on start: {}", latest.display()),
                    );
                    let pending = inner.switch_to_folder_locked(&mut state, &latest);
                    drop(state);
                    inner.backfill(&latest, pending);
                }
                None => {
                    inner.logger.info(
                        TAG,
                        &format!("No subfolders found on start in {}", root_path.display()),
                    );
                }
            }
        } else {
            drop(state);
            let pending = newest_files(root_path, inner.settings.backfill_limit);
            inner.backfill(root_path, pending);
        }
    }

    pub fn stop_watching(&self) {
        let root_path = &self.inner.settings.root_path;
        if !self.inner.shutdown() {
            self.inner.logger.warn(
                TAG,
                &format!("stopWatching called, but was not watching root: {}", root_path.display()),
            );
            return;
        }
        self.inner
            .logger
            .info(TAG, &format!("Stop watching root: {}", root_path.display()));
    }

    /// 지정한 하위 폴더로 전환합니다. 하위 폴더 모드에서 감시 중일 때만 동작합니다.
    pub fn switch_to_folder(&self, folder: &Path) -> bool {
        let mut state = self.inner.lock_state();
        if !state.watching || !self.inner.settings.watch_subfolders {
            self.inner.logger.warn(
                TAG,
                &format!(
                    "switchToFolder ignored for {}: watcher is not following subfolders",
                    folder.display()
                ),
            );
            return false;
        }
        let pending = self.inner.switch_to_folder_locked(&mut state, folder);
        drop(state);
        self.inner.backfill(folder, pending);
        true
    }
}

impl Drop for LatestFolderWatcher {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 모든 구독을 닫습니다. 감시 중이었으면 `true`.
    fn shutdown(&self) -> bool {
        let mut state = self.lock_state();
        if !state.watching {
            return false;
        }
        state.watching = false;
        if let Some(mut root) = state.root.take() {
            root.stop();
        }
        if let Some(mut current) = state.current.take() {
            current.stop();
        }
        state.current_folder = None;
        true
    }

    fn on_root_event(self: &Arc<Self>, bits: EventMask, relative: Option<&Path>) {
        let Some(relative) = relative else {
            return;
        };
        let full_path = self.settings.root_path.join(relative);
        self.logger.trace(
            TAG,
            &format!("rootObserver event={bits} path={}", relative.display()),
        );

        if !bits.intersects(NEW_ENTRY_MASK) {
            return;
        }

        let mut state = self.lock_state();
        if !state.watching {
            return;
        }

        if self.settings.watch_subfolders {
            if !full_path.is_dir() {
                return;
            }
            self.logger
                .info(TAG, &format!("New subfolder detected: {}", full_path.display()));

            if let Some(latest) = find_latest_subfolder(&self.settings.root_path) {
                if state.current_folder.as_deref() != Some(latest.as_path()) {
                    self.logger.info(
                        TAG,
                        &format!("Switching to new latest subfolder: {}", latest.display()),
                    );
                    let pending = self.switch_to_folder_locked(&mut state, &latest);
                    drop(state);
                    self.backfill(&latest, pending);
                }
            }
        } else if full_path.is_file() && !is_no_media_marker(&full_path) {
            // 진행 중인 복사는 stop_watching을 막지 않도록 락 밖에서 수행
            drop(state);
            self.copy_new_file(&full_path);
        }
    }

    /// 중첩 구독을 새 폴더로 옮기고 백필할 파일 목록을 돌려줍니다.
    ///
    /// 복사는 호출하는 쪽에서 락을 놓은 뒤 [`backfill`](Self::backfill)로 수행합니다.
    #[must_use]
    fn switch_to_folder_locked(
        self: &Arc<Self>,
        state: &mut SessionState,
        folder: &Path,
    ) -> Vec<PathBuf> {
        if let Some(mut previous) = state.current.take() {
            previous.stop();
        }
        state.current_folder = Some(folder.to_path_buf());
        self.logger
            .info(TAG, &format!("Switching to subfolder: {}", folder.display()));

        let pending = newest_files(folder, self.settings.backfill_limit);

        let weak: Weak<Inner> = Arc::downgrade(self);
        let watched = folder.to_path_buf();
        let on_file: EventCallback = Arc::new(move |bits, relative| {
            if let (Some(inner), Some(relative)) = (weak.upgrade(), relative) {
                inner.on_folder_event(&watched, bits, relative);
            }
        });

        let mut subscription = self.notifier.subscribe(folder, NEW_ENTRY_MASK, on_file);
        subscription.start();
        state.current = Some(subscription);

        self.logger.info(
            TAG,
            &format!("Started watching new subfolder: {}", folder.display()),
        );
        pending
    }

    fn on_folder_event(&self, folder: &Path, bits: EventMask, relative: &Path) {
        if !bits.intersects(NEW_ENTRY_MASK) {
            return;
        }
        let full_path = folder.join(relative);
        if is_no_media_marker(&full_path) || !full_path.is_file() {
            return;
        }

        self.logger.info(
            TAG,
            &format!("New file in latest subfolder: {}", full_path.display()),
        );
        self.copy_new_file(&full_path);
    }

    /// 백필 대상 파일을 락 없이 복사합니다.
    ///
    /// 파일마다 세션이 아직 `folder`를 대상으로 하는지 확인하고, 중지되었거나
    /// 다른 폴더로 전환되었으면 남은 파일은 건너뜁니다.
    fn backfill(&self, folder: &Path, files: Vec<PathBuf>) {
        self.logger.info(
            TAG,
            &format!("Found {} files to backfill in {}", files.len(), folder.display()),
        );

        for file in files {
            if !self.still_targets(folder) {
                self.logger.info(
                    TAG,
                    &format!("Backfill of {} abandoned, session moved on", folder.display()),
                );
                return;
            }
            self.copy_new_file(&file);
        }
    }

    fn still_targets(&self, folder: &Path) -> bool {
        let state = self.lock_state();
        if !state.watching {
            return false;
        }
        match &state.current_folder {
            Some(current) => current == folder,
            None => !self.settings.watch_subfolders,
        }
    }

    /// 파일별 복사는 독립적이며 실패해도 다음 파일 처리에 영향을 주지 않습니다.
    fn copy_new_file(&self, file: &Path) -> bool {
        self.guard.copy_into_dir(file, &self.settings.dest_dir)
    }
}

/// 이름이 사전순으로 가장 큰 하위 폴더. 하위 폴더가 없거나 루트를 읽을 수 없으면 `None`.
pub fn find_latest_subfolder(root: &Path) -> Option<PathBuf> {
    WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .max_by(|a, b| a.file_name().cmp(b.file_name()))
        .map(|e| e.into_path())
}

/// 폴더 바로 아래의 일반 파일을 이름 역순으로 최대 `limit`개 반환합니다. `.nomedia`는 제외.
pub fn newest_files(folder: &Path, limit: usize) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(folder)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.into_path())
        .filter(|p| p.is_file() && !is_no_media_marker(p))
        .collect();

    files.sort_by(|a, b| b.file_name().cmp(&a.file_name()));
    files.truncate(limit);
    files
}

fn is_no_media_marker(path: &Path) -> bool {
    path.file_name().is_some_and(|name| name == NO_MEDIA_MARKER)
}
