//! Polling watcher
//!
//! Drivers that cannot push native change notifications get this scan-diff
//! substitute: the whole tree is indexed every `watcher-interval` seconds
//! and differences become [`WatchEvent`]s. The `ignore_own` set lets a
//! writer suppress echoes of its own changes: the sync engine registers
//! every path it is about to touch, and the first event for that path is
//! swallowed.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::{walk_files, StorageBackend};

/// Default scan interval when the storage does not set `watcher-interval`.
pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WatchEventKind {
    Create,
    Modify,
    Delete,
}

impl std::fmt::Display for WatchEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchEventKind::Create => f.write_str("create"),
            WatchEventKind::Modify => f.write_str("modify"),
            WatchEventKind::Delete => f.write_str("delete"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub path: PathBuf,
}

/// Paths whose next event should be suppressed (our own writes).
pub type IgnoreSet = Arc<Mutex<HashSet<PathBuf>>>;

/// A running scan-diff watcher. Dropping it (or calling [`stop`]) ends the
/// scan task; the event receiver is handed out once at spawn.
///
/// [`stop`]: PollingWatcher::stop
pub struct PollingWatcher {
    task: tokio::task::JoinHandle<()>,
}

impl PollingWatcher {
    /// Start watching. `pattern` filters events by glob over the storage
    /// path; `None` watches everything.
    pub fn spawn(
        backend: Arc<dyn StorageBackend>,
        pattern: Option<String>,
        interval: Duration,
        ignore_own: Option<IgnoreSet>,
    ) -> (Self, mpsc::Receiver<WatchEvent>) {
        let (tx, rx) = mpsc::channel(256);
        let task = tokio::spawn(async move {
            let mut previous: Option<HashMap<PathBuf, (u64, SystemTime)>> = None;
            loop {
                match scan(backend.as_ref()).await {
                    Ok(index) => {
                        if let Some(prev) = &previous {
                            for event in diff(prev, &index) {
                                if let Some(pattern) = &pattern {
                                    if !crate::wlpath::glob_match(
                                        pattern,
                                        &event.path.to_string_lossy(),
                                    ) {
                                        continue;
                                    }
                                }
                                if let Some(ignore) = &ignore_own {
                                    if ignore.lock().remove(&event.path) {
                                        continue;
                                    }
                                }
                                if tx.send(event).await.is_err() {
                                    return;
                                }
                            }
                        }
                        previous = Some(index);
                    }
                    Err(e) => {
                        tracing::warn!("watcher scan failed: {}", e);
                    }
                }
                tokio::time::sleep(interval).await;
            }
        });
        (PollingWatcher { task }, rx)
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for PollingWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn scan(
    backend: &dyn StorageBackend,
) -> Result<HashMap<PathBuf, (u64, SystemTime)>, super::BackendError> {
    let mut index = HashMap::new();
    for path in walk_files(backend, std::path::Path::new("/")).await? {
        match backend.stat(&path).await {
            Ok(stat) => {
                index.insert(path, (stat.size, stat.mtime));
            }
            Err(super::BackendError::NotFound(_)) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(index)
}

fn diff(
    prev: &HashMap<PathBuf, (u64, SystemTime)>,
    next: &HashMap<PathBuf, (u64, SystemTime)>,
) -> Vec<WatchEvent> {
    let mut events = Vec::new();
    for (path, meta) in next {
        match prev.get(path) {
            None => events.push(WatchEvent {
                kind: WatchEventKind::Create,
                path: path.clone(),
            }),
            Some(old) if old != meta => events.push(WatchEvent {
                kind: WatchEventKind::Modify,
                path: path.clone(),
            }),
            Some(_) => {}
        }
    }
    for path in prev.keys() {
        if !next.contains_key(path) {
            events.push(WatchEvent {
                kind: WatchEventKind::Delete,
                path: path.clone(),
            });
        }
    }
    events.sort_by(|a, b| a.path.cmp(&b.path));
    events
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::MemoryBackend;
    use std::path::Path;

    #[tokio::test]
    async fn test_diff_events() {
        let backend = MemoryBackend::new();
        backend.write(Path::new("/keep.txt"), b"0").await.unwrap();
        backend.write(Path::new("/gone.txt"), b"0").await.unwrap();
        let before = scan(&backend).await.unwrap();

        backend.write(Path::new("/keep.txt"), b"changed").await.unwrap();
        backend.write(Path::new("/new.txt"), b"n").await.unwrap();
        backend.unlink(Path::new("/gone.txt")).await.unwrap();
        let after = scan(&backend).await.unwrap();

        let events = diff(&before, &after);
        assert_eq!(
            events,
            vec![
                WatchEvent {
                    kind: WatchEventKind::Delete,
                    path: "/gone.txt".into()
                },
                WatchEvent {
                    kind: WatchEventKind::Modify,
                    path: "/keep.txt".into()
                },
                WatchEvent {
                    kind: WatchEventKind::Create,
                    path: "/new.txt".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_ignore_own_suppresses_one_event() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let ignore: IgnoreSet = Arc::new(Mutex::new(HashSet::new()));
        let (watcher, mut rx) = PollingWatcher::spawn(
            backend.clone(),
            None,
            Duration::from_millis(20),
            Some(ignore.clone()),
        );

        // let the baseline scan complete before changing anything
        tokio::time::sleep(Duration::from_millis(200)).await;

        // our own write: registered, so no event
        ignore.lock().insert("/mine.txt".into());
        backend.write(Path::new("/mine.txt"), b"1").await.unwrap();
        // a foreign write: must surface
        backend.write(Path::new("/theirs.txt"), b"1").await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.path, PathBuf::from("/theirs.txt"));
        watcher.stop();
    }
}
