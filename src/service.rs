//! Tracker 감시 관리 모듈
//!
//! Tracker 목록이 바뀔 때마다 모든 감시 세션을 중지하고, 활성 Tracker마다 새 세션을 시작합니다.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::copy_guard::CopyGuard;
use crate::error_codes;
use crate::event_log::EventLogger;
use crate::latest_watcher::{LatestFolderWatcher, WatcherSettings, DEFAULT_BACKFILL_LIMIT};
use crate::notifier::DirectoryNotifier;
use crate::tracker_store::{Tracker, TrackerId};

const TAG: &str = "FileTrackerService";

/// 실행 중인 세션 하나
struct TrackerSession {
    tracker_id: TrackerId,
    watcher: LatestFolderWatcher,
}

pub struct TrackerService {
    guard: Arc<CopyGuard>,
    notifier: Arc<dyn DirectoryNotifier>,
    backfill_limit: usize,
    sessions: Mutex<Vec<TrackerSession>>,
}

impl TrackerService {
    pub fn new(guard: Arc<CopyGuard>, notifier: Arc<dyn DirectoryNotifier>) -> Self {
        Self {
            guard,
            notifier,
            backfill_limit: DEFAULT_BACKFILL_LIMIT,
            sessions: Mutex::new(Vec::new()),
        }
    }

    pub fn with_backfill_limit(mut self, backfill_limit: usize) -> Self {
        self.backfill_limit = backfill_limit;
        self
    }

    fn logger(&self) -> &Arc<EventLogger> {
        self.guard.logger()
    }

    /// 기존 세션을 모두 중지하고 활성 Tracker마다 새 세션을 시작합니다.
    ///
    /// 백필 복사 때문에 오래 걸릴 수 있으므로 async 컨텍스트에서는
    /// `spawn_blocking` 안에서 호출해야 합니다.
    pub fn apply_trackers(&self, trackers: &[Tracker]) -> usize {
        let mut sessions = self.lock_sessions();
        for session in sessions.drain(..) {
            session.watcher.stop_watching();
        }

        for tracker in trackers.iter().filter(|t| t.is_active) {
            let mut settings = WatcherSettings::new(
                tracker.source_dir.clone(),
                tracker.dest_dir.clone(),
                tracker.watch_subfolders,
            );
            settings.backfill_limit = self.backfill_limit;

            let watcher = LatestFolderWatcher::new(
                settings,
                Arc::clone(&self.guard),
                Arc::clone(&self.notifier),
            );
            watcher.start_watching();
            sessions.push(TrackerSession {
                tracker_id: tracker.id,
                watcher,
            });
        }

        let count = sessions.len();
        self.logger()
            .info(TAG, &format!("Active trackers: {count}"));
        count
    }

    pub fn stop_all(&self) {
        let mut sessions = self.lock_sessions();
        for session in sessions.drain(..) {
            session.watcher.stop_watching();
        }
    }

    pub fn session_count(&self) -> usize {
        self.lock_sessions().len()
    }

    /// 감시 중인 Tracker id 목록
    pub fn watching_trackers(&self) -> Vec<TrackerId> {
        self.lock_sessions()
            .iter()
            .filter(|s| s.watcher.is_watching())
            .map(|s| s.tracker_id)
            .collect()
    }

    /// Tracker 목록 변경을 따라가며 세션을 재구성합니다. `cancel`이 취소되면 모든 세션을 멈추고 종료합니다.
    pub async fn run(
        self: Arc<Self>,
        mut trackers: watch::Receiver<Vec<Tracker>>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let snapshot = trackers.borrow_and_update().clone();
        self.apply_in_background(snapshot).await?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = trackers.changed() => {
                    if changed.is_err() {
                        self.logger().warn(TAG, "Tracker store closed, stopping watchers");
                        break;
                    }
                    let snapshot = trackers.borrow_and_update().clone();
                    self.apply_in_background(snapshot).await?;
                }
            }
        }

        let service = Arc::clone(&self);
        tokio::task::spawn_blocking(move || service.stop_all())
            .await
            .context("stopping tracker sessions")?;
        self.logger().info(TAG, "Tracker service stopped");
        Ok(())
    }

    async fn apply_in_background(self: &Arc<Self>, snapshot: Vec<Tracker>) -> Result<()> {
        let service = Arc::clone(self);
        tokio::task::spawn_blocking(move || service.apply_trackers(&snapshot))
            .await
            .context(error_codes::ERR_WATCH_START_FAILED)?;
        Ok(())
    }

    fn lock_sessions(&self) -> MutexGuard<'_, Vec<TrackerSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for TrackerService {
    fn drop(&mut self) {
        self.stop_all();
    }
}
