//! Sync daemon: job table and control surface
//!
//! Hosts every running job and executes the `sync-commands` protocol:
//! `start`, `active-events`, `stop`, `stop-all`, `job-state`, `status`,
//! `test-error`, `shutdown`. The job table is single-writer behind a short
//! lock; job tasks own their backends.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::watch;

use common::control::{decode_args, ControlError, ControlHandler};
use common::crypto::KeyFingerprint;
use common::ctx::Context;
use common::obj::Storage;
use common::storage::WatchEventKind;

use crate::engine::{JobHandle, JobSpec};
use crate::job::JobId;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("job already exists: {0}")]
    JobAlreadyExists(JobId),
    #[error("job not found: {0}")]
    JobNotFound(String),
    #[error("bad storage definition: {0}")]
    BadStorage(String),
}

pub struct SyncDaemon {
    ctx: Arc<Context>,
    jobs: Mutex<HashMap<JobId, JobHandle>>,
    shutdown: watch::Sender<bool>,
}

impl SyncDaemon {
    pub fn new(ctx: Arc<Context>, shutdown: watch::Sender<bool>) -> Self {
        SyncDaemon {
            ctx,
            jobs: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    pub fn stop_all(&self) {
        let jobs = self.jobs.lock();
        for job in jobs.values() {
            job.stop();
        }
        tracing::info!("stop requested for {} job(s)", jobs.len());
    }
}

#[derive(Deserialize)]
struct StartArgs {
    #[serde(rename = "container-name")]
    container_name: String,
    #[serde(rename = "job-id")]
    job_id: JobId,
    source: Value,
    target: Value,
    continuous: bool,
    unidirectional: bool,
    #[serde(default, rename = "active-events")]
    active_events: Vec<WatchEventKind>,
    /// Watcher poll interval in seconds (tests shrink it).
    #[serde(default, rename = "watch-interval")]
    watch_interval: Option<u64>,
}

#[derive(Deserialize)]
struct ActiveEventsArgs {
    #[serde(rename = "job-id")]
    job_id: JobId,
    #[serde(rename = "active-events")]
    active_events: Vec<WatchEventKind>,
}

#[derive(Deserialize)]
struct JobArgs {
    #[serde(rename = "job-id")]
    job_id: JobId,
}

#[async_trait]
impl ControlHandler for SyncDaemon {
    async fn handle(&self, cmd: &str, args: Value) -> Result<Value, ControlError> {
        match cmd {
            "start" => {
                let args: StartArgs = decode_args(args)?;
                let source_storage = parse_storage(&args.source).map_err(ControlError::failed)?;
                let target_storage = parse_storage(&args.target).map_err(ControlError::failed)?;
                let watch_interval = args
                    .watch_interval
                    .or(source_storage.watcher_interval())
                    .or(target_storage.watcher_interval())
                    .unwrap_or(0);
                let source = self
                    .ctx
                    .registry
                    .instantiate(&source_storage)
                    .map_err(ControlError::failed)?;
                let target = self
                    .ctx
                    .registry
                    .instantiate(&target_storage)
                    .map_err(ControlError::failed)?;

                let mut jobs = self.jobs.lock();
                if let Some(existing) = jobs.get(&args.job_id) {
                    if !existing.state().is_terminal() {
                        return Err(ControlError::failed(DaemonError::JobAlreadyExists(
                            args.job_id,
                        )));
                    }
                }

                let spec = JobSpec {
                    id: args.job_id.clone(),
                    container_name: args.container_name,
                    source,
                    target,
                    continuous: args.continuous,
                    unidirectional: args.unidirectional,
                    watch_interval: Duration::from_secs(watch_interval),
                };
                let handle = JobHandle::spawn(spec, args.active_events.into_iter().collect());
                jobs.insert(args.job_id.clone(), handle);
                tracing::info!("sync job {} started", args.job_id);
                Ok(json!({ "job-id": args.job_id }))
            }
            "active-events" => {
                let args: ActiveEventsArgs = decode_args(args)?;
                let jobs = self.jobs.lock();
                let job = jobs.get(&args.job_id).ok_or_else(|| {
                    ControlError::failed(DaemonError::JobNotFound(args.job_id.to_string()))
                })?;
                let filter: HashSet<WatchEventKind> = args.active_events.into_iter().collect();
                *job.active_events.write() = filter;
                Ok(Value::Null)
            }
            "stop" => {
                let args: JobArgs = decode_args(args)?;
                let mut jobs = self.jobs.lock();
                let job = jobs.remove(&args.job_id).ok_or_else(|| {
                    ControlError::failed(DaemonError::JobNotFound(args.job_id.to_string()))
                })?;
                job.stop();
                Ok(Value::Null)
            }
            "stop-all" => {
                let mut jobs = self.jobs.lock();
                for (_, job) in jobs.drain() {
                    job.stop();
                }
                Ok(Value::Null)
            }
            "job-state" => {
                let args: JobArgs = decode_args(args)?;
                let jobs = self.jobs.lock();
                let job = jobs.get(&args.job_id).ok_or_else(|| {
                    ControlError::failed(DaemonError::JobNotFound(args.job_id.to_string()))
                })?;
                let status = job.status.lock();
                Ok(json!({
                    "state": status.state(),
                    "last-error": status.last_error,
                    "conflicts": status.conflicts,
                    "container-name": job.container_name,
                }))
            }
            "status" => {
                let jobs = self.jobs.lock();
                let mut out = serde_json::Map::new();
                for (id, job) in jobs.iter() {
                    out.insert(id.to_string(), json!(job.state()));
                }
                Ok(Value::Object(out))
            }
            "test-error" => {
                let args: JobArgs = decode_args(args)?;
                let jobs = self.jobs.lock();
                let job = jobs.get(&args.job_id).ok_or_else(|| {
                    ControlError::failed(DaemonError::JobNotFound(args.job_id.to_string()))
                })?;
                job.inject_error();
                Ok(Value::Null)
            }
            "shutdown" => {
                self.stop_all();
                self.jobs.lock().clear();
                let _ = self.shutdown.send(true);
                Ok(Value::Null)
            }
            _ => Err(ControlError::UnknownCommand),
        }
    }
}

/// Parse a storage mapping carried in `source` / `target` args.
fn parse_storage(raw: &Value) -> Result<Storage, DaemonError> {
    let yaml: serde_yaml::Value = serde_yaml::to_value(raw)
        .map_err(|e| DaemonError::BadStorage(format!("storage is not a mapping: {e}")))?;
    let map = yaml
        .as_mapping()
        .cloned()
        .ok_or_else(|| DaemonError::BadStorage("storage is not a mapping".into()))?;

    let owner: KeyFingerprint = map
        .get("owner")
        .and_then(serde_yaml::Value::as_str)
        .ok_or_else(|| DaemonError::BadStorage("storage needs an owner".into()))?
        .parse()
        .map_err(|_| DaemonError::BadStorage("storage owner is not a fingerprint".into()))?;
    let container_path = map
        .get("container-path")
        .and_then(serde_yaml::Value::as_str)
        .map(std::path::PathBuf::from)
        .ok_or_else(|| DaemonError::BadStorage("storage needs a container-path".into()))?;

    Storage::from_inline(map, &owner, &container_path)
        .map_err(|e| DaemonError::BadStorage(e.to_string()))
}
