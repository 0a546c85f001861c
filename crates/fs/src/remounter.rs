//! Subcontainer remounter
//!
//! A mounted storage may advertise subcontainers: manifest files matching
//! its `manifest-pattern`. This watcher turns changes to those files into
//! mount / unmount operations so the tree tracks the storage. Events are
//! coalesced per path over a short window and applied serially, so an
//! editor writing a manifest in several steps produces one remount and no
//! intermediate state is ever visible.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use common::ctx::Context;
use common::manifest::{Manifest, ObjectType};
use common::obj::{Container, ManifestPattern, StorageRef};
use common::storage::{PollingWatcher, WatchEvent, WatchEventKind, DEFAULT_WATCH_INTERVAL};

use crate::mount_table::{FsError, MountItem, MountRequest, MountTable};

/// How long to wait for follow-up events before applying a batch.
const COALESCE_WINDOW: Duration = Duration::from_millis(500);

pub struct Remounter {
    watcher: PollingWatcher,
    task: tokio::task::JoinHandle<()>,
}

impl Remounter {
    /// Watch the given mounted storage for subcontainer manifest changes.
    pub fn spawn(
        ctx: Arc<Context>,
        table: Arc<MountTable>,
        storage_id: u64,
    ) -> Result<Self, FsError> {
        let storage = table
            .get(storage_id)
            .ok_or(FsError::UnknownStorage(storage_id))?;

        let pattern = match &storage.manifest_pattern {
            Some(ManifestPattern::Glob(glob)) => Some(glob.clone()),
            Some(ManifestPattern::List(_)) | None => Some("/*.yaml".to_string()),
        };
        let interval = storage
            .watcher_interval
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_WATCH_INTERVAL);

        let (watcher, rx) = PollingWatcher::spawn(storage.backend(), pattern, interval, None);

        let state = RemountState {
            ctx,
            table,
            storage_id,
            trusted_owner: storage.trusted.then(|| storage.owner.clone()),
            mounted: Mutex::new(HashMap::new()),
        };
        let task = tokio::spawn(pump(state, rx));

        Ok(Remounter { watcher, task })
    }

    pub fn stop(self) {
        self.watcher.stop();
        self.task.abort();
    }
}

impl Drop for Remounter {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct RemountState {
    ctx: Arc<Context>,
    table: Arc<MountTable>,
    storage_id: u64,
    trusted_owner: Option<common::crypto::KeyFingerprint>,
    /// manifest path → container uuid currently mounted from it.
    mounted: Mutex<HashMap<PathBuf, Uuid>>,
}

async fn pump(state: RemountState, mut rx: mpsc::Receiver<WatchEvent>) {
    while let Some(first) = rx.recv().await {
        // coalesce: keep only the newest event per path
        let mut batch: HashMap<PathBuf, WatchEventKind> = HashMap::new();
        batch.insert(first.path.clone(), first.kind);
        loop {
            match tokio::time::timeout(COALESCE_WINDOW, rx.recv()).await {
                Ok(Some(event)) => {
                    batch.insert(event.path.clone(), event.kind);
                }
                Ok(None) => return,
                Err(_) => break,
            }
        }

        let mut paths: Vec<_> = batch.into_iter().collect();
        paths.sort();
        for (path, kind) in paths {
            if let Err(e) = apply(&state, &path, kind).await {
                tracing::warn!(
                    "subcontainer update for {} failed: {}",
                    path.display(),
                    e
                );
            }
        }
    }
}

async fn apply(state: &RemountState, path: &PathBuf, kind: WatchEventKind) -> Result<(), FsError> {
    match kind {
        WatchEventKind::Create | WatchEventKind::Modify => {
            let storage = state
                .table
                .get(state.storage_id)
                .ok_or(FsError::UnknownStorage(state.storage_id))?;
            let bytes = storage.backend().read(path).await?;

            let manifest = {
                let sig = state.ctx.sig.read();
                Manifest::from_bytes(
                    &bytes,
                    &sig,
                    Some(ObjectType::Container),
                    state.trusted_owner.as_ref(),
                    false,
                )
                .map_err(|e| FsError::BadStorage(e.to_string()))?
            };
            let container =
                Container::try_from(manifest).map_err(|e| FsError::BadStorage(e.to_string()))?;

            let Some(StorageRef::Inline(sub_storage)) = container.primary_storage() else {
                tracing::debug!(
                    "subcontainer {} has no usable inline storage",
                    container.uuid()
                );
                return Ok(());
            };

            let item = MountItem {
                paths: container.mount_paths(),
                storage: serde_json::to_value(sub_storage.to_mapping())
                    .map_err(|e| FsError::BadStorage(e.to_string()))?,
                read_only: sub_storage.read_only(),
                extra: serde_json::Value::Null,
                remount: true,
            };
            let ids = state
                .table
                .mount(MountRequest {
                    items: vec![item],
                    lazy: false,
                })
                .await?;
            tracing::info!(
                "subcontainer {} mounted as storage {:?}",
                container.uuid(),
                ids
            );
            state
                .mounted
                .lock()
                .insert(path.clone(), container.uuid());
        }
        WatchEventKind::Delete => {
            let uuid = state.mounted.lock().remove(path);
            if let Some(uuid) = uuid {
                let ids = state.table.unmount_container(uuid).await?;
                tracing::info!("subcontainer {} unmounted (storages {:?})", uuid, ids);
            }
        }
    }
    Ok(())
}
