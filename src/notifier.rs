//! 디렉토리 변경 알림 어댑터
//!
//! 단일 디렉토리(비재귀)에 대한 OS 알림을 하나의 인터페이스로 감쌉니다.
//! 백엔드(네이티브/폴링)는 생성 시점에 한 번 선택되며, 호출하는 쪽에서는 차이가 없습니다.

use std::fmt;
use std::fs;
use std::ops::BitOr;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};

/// 알림 이벤트 종류 비트셋
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventMask(u32);

impl EventMask {
    pub const NONE: EventMask = EventMask(0);
    pub const CREATE: EventMask = EventMask(1);
    pub const DELETE: EventMask = EventMask(1 << 1);
    pub const MODIFY: EventMask = EventMask(1 << 2);
    pub const MOVED_FROM: EventMask = EventMask(1 << 3);
    pub const MOVED_TO: EventMask = EventMask(1 << 4);
    pub const ALL: EventMask = EventMask(0b1_1111);

    pub const fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: EventMask) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn union(self, other: EventMask) -> EventMask {
        EventMask(self.0 | other.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        self.union(rhs)
    }
}

impl fmt::Debug for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(EventMask, &str); 5] = [
            (EventMask::CREATE, "CREATE"),
            (EventMask::DELETE, "DELETE"),
            (EventMask::MODIFY, "MODIFY"),
            (EventMask::MOVED_FROM, "MOVED_FROM"),
            (EventMask::MOVED_TO, "MOVED_TO"),
        ];

        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect();

        if names.is_empty() {
            f.write_str("NONE")
        } else {
            f.write_str(&names.join("|"))
        }
    }
}

/// 이벤트 콜백: (이벤트 비트, 감시 경로 기준 상대 경로). 감시 경로 자체의 이벤트는 `None`.
pub type EventCallback = Arc<dyn Fn(EventMask, Option<&Path>) + Send + Sync>;

/// 하나의 디렉토리 구독. `start`/`stop`은 반복 호출해도 안전합니다.
pub trait Subscription: Send {
    fn start(&mut self);
    fn stop(&mut self);
    fn is_active(&self) -> bool;
    fn path(&self) -> &Path;
}

pub trait DirectoryNotifier: Send + Sync {
    /// 구독 객체를 만듭니다. `start()` 전까지는 이벤트가 전달되지 않습니다.
    fn subscribe(&self, path: &Path, mask: EventMask, on_event: EventCallback)
        -> Box<dyn Subscription>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreference {
    #[default]
    Auto,
    Native,
    Poll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// inotify / FSEvents / ReadDirectoryChangesW
    Native,
    /// 주기적 디렉토리 스캔 (네트워크/FUSE 저장소용)
    Poll,
}

/// `notify` 기반 기본 어댑터
#[derive(Debug, Clone)]
pub struct NotifyAdapter {
    backend: Backend,
    poll_interval: Duration,
}

impl NotifyAdapter {
    pub fn new(preference: BackendPreference, poll_interval: Duration) -> Self {
        let backend = match preference {
            BackendPreference::Native => Backend::Native,
            BackendPreference::Poll => Backend::Poll,
            BackendPreference::Auto => Self::detect_backend(),
        };
        tracing::debug!(?backend, "directory notifier backend selected");

        Self {
            backend,
            poll_interval,
        }
    }

    /// 네이티브 watcher를 만들 수 있으면 네이티브, 아니면 폴링
    fn detect_backend() -> Backend {
        match notify::recommended_watcher(|_: notify::Result<Event>| {}) {
            Ok(_) => Backend::Native,
            Err(e) => {
                tracing::warn!(error = %e, "native directory notifications unavailable, falling back to polling");
                Backend::Poll
            }
        }
    }
}

impl DirectoryNotifier for NotifyAdapter {
    fn subscribe(
        &self,
        path: &Path,
        mask: EventMask,
        on_event: EventCallback,
    ) -> Box<dyn Subscription> {
        Box::new(NotifySubscription {
            path: path.to_path_buf(),
            mask,
            on_event,
            backend: self.backend,
            poll_interval: self.poll_interval,
            active: Arc::new(AtomicBool::new(false)),
            watcher: None,
        })
    }
}

struct NotifySubscription {
    path: PathBuf,
    mask: EventMask,
    on_event: EventCallback,
    backend: Backend,
    poll_interval: Duration,
    active: Arc<AtomicBool>,
    watcher: Option<Box<dyn Watcher + Send>>,
}

impl NotifySubscription {
    fn open(&self) -> notify::Result<Box<dyn Watcher + Send>> {
        let root = self.path.clone();
        let mask = self.mask;
        let on_event = Arc::clone(&self.on_event);
        let active = Arc::clone(&self.active);

        let handler = move |res: notify::Result<Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    tracing::debug!(path = %root.display(), error = %e, "notification error");
                    return;
                }
            };

            for (bits, relative) in translate_event(&event, &root) {
                if !active.load(Ordering::Acquire) {
                    return;
                }
                if mask.intersects(bits) {
                    on_event(bits, relative.as_deref());
                }
            }
        };

        let mut watcher: Box<dyn Watcher + Send> = match self.backend {
            Backend::Native => Box::new(RecommendedWatcher::new(handler, Config::default())?),
            Backend::Poll => Box::new(PollWatcher::new(
                handler,
                Config::default().with_poll_interval(self.poll_interval),
            )?),
        };
        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        Ok(watcher)
    }
}

impl Subscription for NotifySubscription {
    fn start(&mut self) {
        if self.active.swap(true, Ordering::AcqRel) {
            return;
        }

        // 잘못된 경로는 실패하지 않고 "이벤트가 오지 않는 구독"이 됩니다.
        match self.open() {
            Ok(watcher) => self.watcher = Some(watcher),
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "cannot watch directory, subscription will stay silent"
                );
            }
        }
    }

    fn stop(&mut self) {
        self.active.store(false, Ordering::Release);
        self.watcher = None;
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for NotifySubscription {
    fn drop(&mut self) {
        self.stop();
    }
}

/// `notify` 이벤트를 (비트, 상대 경로) 목록으로 변환합니다.
///
/// 감시 디렉토리의 직접 자식이 아닌 경로는 버립니다.
pub fn translate_event(event: &Event, root: &Path) -> Vec<(EventMask, Option<PathBuf>)> {
    event
        .paths
        .iter()
        .filter_map(|path| {
            let bits = classify(&event.kind, path);
            if bits.is_empty() {
                return None;
            }
            let relative = relative_child(root, path)?;
            Some((bits, relative))
        })
        .collect()
}

fn classify(kind: &EventKind, path: &Path) -> EventMask {
    match kind {
        EventKind::Create(_) => EventMask::CREATE,
        EventKind::Remove(_) => EventMask::DELETE,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => EventMask::MOVED_TO,
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => EventMask::MOVED_FROM,
        // inotify는 From/To를 따로 보낸 뒤 Both를 한 번 더 보냄
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => EventMask::NONE,
        EventKind::Modify(ModifyKind::Name(_)) => {
            if path.exists() {
                EventMask::MOVED_TO
            } else {
                EventMask::MOVED_FROM
            }
        }
        EventKind::Modify(_) => EventMask::MODIFY,
        _ => EventMask::NONE,
    }
}

/// `Some(None)`: 감시 경로 자체, `Some(Some(name))`: 직접 자식, `None`: 그 외
fn relative_child(root: &Path, path: &Path) -> Option<Option<PathBuf>> {
    if path == root {
        return Some(None);
    }

    match path.strip_prefix(root) {
        Ok(relative) => {
            let mut components = relative.components();
            match (components.next(), components.next()) {
                (Some(Component::Normal(name)), None) => Some(Some(PathBuf::from(name))),
                _ => None,
            }
        }
        // 심볼릭 링크 등으로 접두어가 달라진 경우 (예: macOS /private)
        Err(_) => {
            let parent = path.parent()?;
            match (fs::canonicalize(root), fs::canonicalize(parent)) {
                (Ok(root), Ok(parent)) if root == parent => {
                    path.file_name().map(|name| Some(PathBuf::from(name)))
                }
                _ => None,
            }
        }
    }
}
