//! Control command handlers for the mount core
//!
//! Dispatches the `fs-commands` surface over the shared control socket:
//! `mount`, `unmount`, `clear-cache`, `add-watch`,
//! `add-subcontainer-watch`, `paths`, `info`, `status`, `fileinfo`,
//! `dirinfo`, `breakpoint`, `test`.
//!
//! Watch events are buffered per watch and drained through `status`; the
//! request/response protocol carries no unsolicited lines.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};

use common::control::{decode_args, ControlError, ControlHandler};
use common::ctx::Context;
use common::storage::{PollingWatcher, WatchEvent, DEFAULT_WATCH_INTERVAL};

use crate::mount_table::{MountRequest, MountTable};
use crate::remounter::Remounter;

const EVENT_BUFFER_CAP: usize = 1024;

enum Watch {
    Plain {
        _watcher: PollingWatcher,
        task: tokio::task::JoinHandle<()>,
    },
    Subcontainer(Remounter),
}

pub struct FsControl {
    ctx: Arc<Context>,
    table: Arc<MountTable>,
    watches: Mutex<HashMap<u64, Watch>>,
    next_watch: AtomicU64,
    events: Arc<Mutex<Vec<Value>>>,
}

impl FsControl {
    pub fn new(ctx: Arc<Context>, table: Arc<MountTable>) -> Self {
        FsControl {
            ctx,
            table,
            watches: Mutex::new(HashMap::new()),
            next_watch: AtomicU64::new(1),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn push_event(events: &Mutex<Vec<Value>>, watch_id: u64, event: &WatchEvent) {
        let mut events = events.lock();
        if events.len() >= EVENT_BUFFER_CAP {
            events.remove(0);
        }
        events.push(json!({
            "watch-id": watch_id,
            "type": event.kind.to_string(),
            "path": event.path,
        }));
    }
}

#[derive(Deserialize)]
struct UnmountArgs {
    #[serde(rename = "storage-id")]
    storage_id: u64,
}

#[derive(Deserialize)]
struct ClearCacheArgs {
    #[serde(rename = "storage-id")]
    storage_id: Option<u64>,
}

#[derive(Deserialize)]
struct AddWatchArgs {
    #[serde(rename = "storage-id")]
    storage_id: u64,
    pattern: String,
    #[serde(default, rename = "ignore-own")]
    _ignore_own: bool,
}

#[derive(Deserialize)]
struct AddSubcontainerWatchArgs {
    #[serde(rename = "backend-param")]
    storage_id: u64,
    #[serde(default, rename = "ignore-own")]
    _ignore_own: bool,
}

#[derive(Deserialize)]
struct PathArgs {
    path: PathBuf,
}

#[async_trait]
impl ControlHandler for FsControl {
    async fn handle(&self, cmd: &str, args: Value) -> Result<Value, ControlError> {
        match cmd {
            "mount" => {
                let request: MountRequest = decode_args(args)?;
                let ids = self
                    .table
                    .mount(request)
                    .await
                    .map_err(ControlError::failed)?;
                Ok(json!({ "storage-ids": ids }))
            }
            "unmount" => {
                let args: UnmountArgs = decode_args(args)?;
                self.table
                    .unmount(args.storage_id)
                    .await
                    .map_err(ControlError::failed)?;
                Ok(Value::Null)
            }
            "clear-cache" => {
                let args: ClearCacheArgs = decode_args(args)?;
                self.table
                    .clear_cache(args.storage_id)
                    .map_err(ControlError::failed)?;
                Ok(Value::Null)
            }
            "add-watch" => {
                let args: AddWatchArgs = decode_args(args)?;
                let storage = self
                    .table
                    .get(args.storage_id)
                    .ok_or_else(|| ControlError::failed("unknown storage id"))?;
                let interval = storage
                    .watcher_interval
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_WATCH_INTERVAL);
                let (watcher, mut rx) = PollingWatcher::spawn(
                    storage.backend(),
                    Some(args.pattern),
                    interval,
                    None,
                );
                let watch_id = self.next_watch.fetch_add(1, Ordering::SeqCst);
                let events = self.events.clone();
                let task = tokio::spawn(async move {
                    while let Some(event) = rx.recv().await {
                        Self::push_event(&events, watch_id, &event);
                    }
                });
                self.watches.lock().insert(
                    watch_id,
                    Watch::Plain {
                        _watcher: watcher,
                        task,
                    },
                );
                Ok(json!({ "watch-id": watch_id }))
            }
            "add-subcontainer-watch" => {
                let args: AddSubcontainerWatchArgs = decode_args(args)?;
                let remounter =
                    Remounter::spawn(self.ctx.clone(), self.table.clone(), args.storage_id)
                        .map_err(ControlError::failed)?;
                let watch_id = self.next_watch.fetch_add(1, Ordering::SeqCst);
                self.watches
                    .lock()
                    .insert(watch_id, Watch::Subcontainer(remounter));
                Ok(json!({ "watch-id": watch_id }))
            }
            "paths" => Ok(json!(self.table.paths())),
            "info" => {
                let mut out = serde_json::Map::new();
                for storage in self.table.storages() {
                    out.insert(
                        storage.id.to_string(),
                        json!({
                            "type": storage.backend_type,
                            "paths": storage.paths,
                            "backend-id": storage.backend_id,
                            "container": storage.container_uuid,
                            "owner": storage.owner,
                            "read-only": storage.read_only,
                            "lazy": storage.lazy && !storage.is_open(),
                            "extra": storage.extra,
                        }),
                    );
                }
                Ok(Value::Object(out))
            }
            "status" => {
                let events: Vec<Value> = self.events.lock().drain(..).collect();
                Ok(json!({
                    "storages": self.table.storages().len(),
                    "watches": self.watches.lock().len(),
                    "events": events,
                }))
            }
            "fileinfo" => {
                let args: PathArgs = decode_args(args)?;
                let stat = self
                    .table
                    .stat(&args.path)
                    .await
                    .map_err(ControlError::failed)?;
                let mtime = stat
                    .mtime
                    .duration_since(std::time::SystemTime::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs();
                Ok(json!({
                    "size": stat.size,
                    "is-dir": stat.is_dir,
                    "mtime": mtime,
                }))
            }
            "dirinfo" => {
                let args: PathArgs = decode_args(args)?;
                let entries = self
                    .table
                    .list_dir(&args.path)
                    .await
                    .map_err(ControlError::failed)?;
                Ok(json!({ "entries": entries }))
            }
            "breakpoint" => Err(ControlError::failed(
                "breakpoint requires foreground mode",
            )),
            "test" => Ok(Value::Null),
            _ => Err(ControlError::UnknownCommand),
        }
    }
}

impl Drop for FsControl {
    fn drop(&mut self) {
        for (_, watch) in self.watches.lock().drain() {
            match watch {
                Watch::Plain { task, .. } => task.abort(),
                Watch::Subcontainer(remounter) => remounter.stop(),
            }
        }
    }
}
