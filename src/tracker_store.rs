//! Tracker configuration store.
//!
//! Trackers are kept in a YAML file and published as a live list through a
//! `tokio::sync::watch` channel. Every mutation is written to disk before the
//! new snapshot is published. Changes made by another process (the CLI) are
//! picked up by [`TrackerStore::follow_file`].

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use crate::notifier::{DirectoryNotifier, EventCallback, EventMask, Subscription};
use crate::path_validation::validate_tracker_pair;

pub type TrackerId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tracker {
    #[serde(default)]
    pub id: TrackerId,
    pub source_dir: PathBuf,
    pub dest_dir: PathBuf,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "default_true")]
    pub watch_subfolders: bool,
}

impl Tracker {
    /// New tracker, not yet stored (id 0), active and following subfolders.
    pub fn new(source_dir: impl Into<PathBuf>, dest_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: 0,
            source_dir: source_dir.into(),
            dest_dir: dest_dir.into(),
            is_active: true,
            watch_subfolders: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Tracker store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Tracker store is corrupt: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Unknown tracker id {0}")]
    UnknownTracker(TrackerId),

    #[error("Invalid tracker path: {0}")]
    InvalidPath(String),
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct TrackerFile {
    #[serde(default)]
    next_id: TrackerId,
    #[serde(default)]
    trackers: Vec<Tracker>,
}

pub struct TrackerStore {
    path: Option<PathBuf>,
    data: Mutex<TrackerFile>,
    live: watch::Sender<Vec<Tracker>>,
}

impl TrackerStore {
    /// Opens the store at `path`, starting empty if the file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let data = read_tracker_file(&path)?;
        Ok(Self::from_data(Some(path), data))
    }

    pub fn in_memory() -> Self {
        Self::from_data(None, TrackerFile::default())
    }

    fn from_data(path: Option<PathBuf>, mut data: TrackerFile) -> Self {
        let max_id = data.trackers.iter().map(|t| t.id).max().unwrap_or(0);
        data.next_id = data.next_id.max(max_id + 1).max(1);

        let (live, _) = watch::channel(data.trackers.clone());
        Self {
            path,
            data: Mutex::new(data),
            live,
        }
    }

    /// Live list of all trackers. The receiver sees every committed change.
    pub fn trackers_live(&self) -> watch::Receiver<Vec<Tracker>> {
        self.live.subscribe()
    }

    pub fn list(&self) -> Vec<Tracker> {
        self.lock().trackers.clone()
    }

    pub fn get(&self, id: TrackerId) -> Option<Tracker> {
        self.lock().trackers.iter().find(|t| t.id == id).cloned()
    }

    /// Stores `tracker`. Id 0 allocates a new id; an existing id is replaced.
    pub fn insert(&self, mut tracker: Tracker) -> Result<TrackerId, StoreError> {
        validate_tracker_pair(&tracker.source_dir, &tracker.dest_dir)
            .map_err(StoreError::InvalidPath)?;

        self.mutate(|data| {
            if tracker.id <= 0 {
                tracker.id = data.next_id;
            }
            data.next_id = data.next_id.max(tracker.id + 1);

            let id = tracker.id;
            match data.trackers.iter_mut().find(|t| t.id == id) {
                Some(existing) => *existing = tracker,
                None => data.trackers.push(tracker),
            }
            Ok(id)
        })
    }

    pub fn delete(&self, id: TrackerId) -> Result<Tracker, StoreError> {
        self.mutate(|data| {
            let index = data
                .trackers
                .iter()
                .position(|t| t.id == id)
                .ok_or(StoreError::UnknownTracker(id))?;
            Ok(data.trackers.remove(index))
        })
    }

    pub fn set_active(&self, id: TrackerId, is_active: bool) -> Result<(), StoreError> {
        self.update(id, |t| t.is_active = is_active)
    }

    pub fn set_watch_subfolders(&self, id: TrackerId, watch_subfolders: bool) -> Result<(), StoreError> {
        self.update(id, |t| t.watch_subfolders = watch_subfolders)
    }

    fn update(&self, id: TrackerId, apply: impl FnOnce(&mut Tracker)) -> Result<(), StoreError> {
        self.mutate(|data| {
            let tracker = data
                .trackers
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or(StoreError::UnknownTracker(id))?;
            apply(tracker);
            Ok(())
        })
    }

    /// Re-reads the backing file and publishes it if the tracker list changed.
    ///
    /// Returns `Ok(true)` when a new snapshot was published. In-memory stores
    /// never change.
    pub fn reload(&self) -> Result<bool, StoreError> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        let on_disk = read_tracker_file(path)?;

        let mut data = self.lock();
        let max_id = on_disk.trackers.iter().map(|t| t.id).max().unwrap_or(0);
        data.next_id = data.next_id.max(on_disk.next_id).max(max_id + 1);
        if data.trackers == on_disk.trackers {
            return Ok(false);
        }

        data.trackers = on_disk.trackers;
        self.live.send_replace(data.trackers.clone());
        Ok(true)
    }

    /// Subscribes to the directory holding the tracker file and reloads on
    /// every change to it. Events stop when the returned subscription drops.
    ///
    /// `None` for in-memory stores.
    pub fn follow_file(
        self: &Arc<Self>,
        notifier: &dyn DirectoryNotifier,
    ) -> Result<Option<Box<dyn Subscription>>, StoreError> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        let Some(file_name) = path.file_name().map(|n| n.to_os_string()) else {
            return Ok(None);
        };
        let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(parent) => parent.to_path_buf(),
            None => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;

        let weak = Arc::downgrade(self);
        let on_event: EventCallback = Arc::new(move |_, relative| {
            if relative.and_then(Path::file_name) != Some(file_name.as_os_str()) {
                return;
            }
            let Some(store) = weak.upgrade() else {
                return;
            };
            match store.reload() {
                Ok(true) => tracing::info!("tracker file changed on disk, list reloaded"),
                Ok(false) => {}
                // a half-written file; the final write triggers another event
                Err(e) => tracing::warn!(error = %e, "could not reload tracker file"),
            }
        });

        let mut subscription = notifier.subscribe(
            &dir,
            EventMask::CREATE | EventMask::MODIFY | EventMask::MOVED_TO,
            on_event,
        );
        subscription.start();
        Ok(Some(subscription))
    }

    /// Applies `change` to a copy, persists it, then commits and publishes.
    fn mutate<T>(
        &self,
        change: impl FnOnce(&mut TrackerFile) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut data = self.lock();
        let mut next = data.clone();
        let result = change(&mut next)?;

        self.persist(&next)?;
        *data = next;
        self.live.send_replace(data.trackers.clone());

        Ok(result)
    }

    fn persist(&self, data: &TrackerFile) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let io_err = |source| StoreError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let yaml = serde_yaml::to_string(data)?;
        let tmp = path.with_extension("yaml.tmp");
        fs::write(&tmp, yaml).map_err(io_err)?;
        fs::rename(&tmp, path).map_err(io_err)?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, TrackerFile> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn read_tracker_file(path: &Path) -> Result<TrackerFile, StoreError> {
    if !path.exists() {
        return Ok(TrackerFile::default());
    }
    let text = fs::read_to_string(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if text.trim().is_empty() {
        return Ok(TrackerFile::default());
    }
    Ok(serde_yaml::from_str(&text)?)
}
