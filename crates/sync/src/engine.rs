//! Replication engine: one task per job
//!
//! The task walks the state machine: scan both sides, replicate the
//! differences, then (for continuous jobs) attach watchers and replay
//! events until stopped. File transfers for distinct paths run in
//! parallel; each path is only ever touched by one action at a time
//! because actions are keyed by path.
//!
//! Transient backend failures retry with bounded exponential backoff;
//! anything else (or exhausted retries) parks the job in `ERROR` with the
//! failure retained until `stop`.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use common::storage::{
    with_timeout, BackendError, PollingWatcher, StorageBackend, WatchEvent, WatchEventKind,
    DEFAULT_WATCH_INTERVAL,
};

use crate::index::{diff, Direction, FileIndex, SyncAction};
use crate::job::{JobId, JobStatus, SyncState};

/// Backoff: 500ms, doubling, at most 5 attempts.
const RETRY_BASE: Duration = Duration::from_millis(500);
const RETRY_MAX_ATTEMPTS: u32 = 5;

/// Parallel file transfers per job.
const TRANSFER_CONCURRENCY: usize = 8;

/// Everything needed to start a job.
pub struct JobSpec {
    pub id: JobId,
    pub container_name: String,
    pub source: Arc<dyn StorageBackend>,
    pub target: Arc<dyn StorageBackend>,
    pub continuous: bool,
    pub unidirectional: bool,
    pub watch_interval: Duration,
}

impl JobSpec {
    pub fn watch_interval_or_default(mut self) -> Self {
        if self.watch_interval.is_zero() {
            self.watch_interval = DEFAULT_WATCH_INTERVAL;
        }
        self
    }
}

#[derive(Debug)]
pub enum JobCommand {
    Stop,
    InjectError,
}

/// Daemon-side handle to a running job.
pub struct JobHandle {
    pub id: JobId,
    pub container_name: String,
    pub status: Arc<Mutex<JobStatus>>,
    pub active_events: Arc<RwLock<HashSet<WatchEventKind>>>,
    commands: mpsc::UnboundedSender<JobCommand>,
    task: tokio::task::JoinHandle<()>,
}

impl JobHandle {
    pub fn spawn(spec: JobSpec, active_events: HashSet<WatchEventKind>) -> Self {
        let status = Arc::new(Mutex::new(JobStatus::default()));
        let active_events = Arc::new(RwLock::new(active_events));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let id = spec.id.clone();
        let container_name = spec.container_name.clone();
        let task = tokio::spawn(run(
            spec.watch_interval_or_default(),
            status.clone(),
            active_events.clone(),
            commands_rx,
        ));

        JobHandle {
            id,
            container_name,
            status,
            active_events,
            commands: commands_tx,
            task,
        }
    }

    /// Ask the job to stop. Refuses no one; the task transitions to
    /// `STOPPED` after in-flight transfers reach their next checkpoint.
    pub fn stop(&self) {
        let _ = self.commands.send(JobCommand::Stop);
    }

    /// Force the job into `ERROR` (the `test-error` command).
    pub fn inject_error(&self) {
        let _ = self.commands.send(JobCommand::InjectError);
    }

    pub fn state(&self) -> SyncState {
        self.status.lock().state()
    }

    pub async fn join(self) {
        self.stop();
        let _ = self.task.await;
    }
}

async fn run(
    spec: JobSpec,
    status: Arc<Mutex<JobStatus>>,
    active_events: Arc<RwLock<HashSet<WatchEventKind>>>,
    mut commands: mpsc::UnboundedReceiver<JobCommand>,
) {
    let id = spec.id.clone();
    tracing::info!("sync job {} starting ({})", id, spec.container_name);

    if let Err(e) = initial_sync(&spec, &status).await {
        status.lock().fail(e.to_string());
        // stay parked until the daemon stops us
        wait_for_stop(&mut commands).await;
        let _ = status.lock().transition(SyncState::Stopped);
        return;
    }

    if !spec.continuous {
        let mut status = status.lock();
        let _ = status.transition(SyncState::Synced);
        let _ = status.transition(SyncState::Stopped);
        tracing::info!("sync job {} finished (one-shot)", id);
        return;
    }

    // our own replication writes must not come back as foreign events
    let source_ignore = common::storage::watch::IgnoreSet::default();
    let target_ignore = common::storage::watch::IgnoreSet::default();
    let (_source_watcher, mut source_events) = PollingWatcher::spawn(
        spec.source.clone(),
        None,
        spec.watch_interval,
        Some(source_ignore.clone()),
    );
    let (_target_watcher, mut target_events) = PollingWatcher::spawn(
        spec.target.clone(),
        None,
        spec.watch_interval,
        Some(target_ignore.clone()),
    );

    // queue empty and both watchers attached
    let _ = status.lock().transition(SyncState::Synced);
    tracing::info!("sync job {} synced, watching", id);

    loop {
        let (event, direction) = tokio::select! {
            command = commands.recv() => match command {
                Some(JobCommand::Stop) | None => break,
                Some(JobCommand::InjectError) => {
                    status.lock().fail("error injected for testing");
                    wait_for_stop(&mut commands).await;
                    break;
                }
            },
            event = source_events.recv() => match event {
                Some(event) => (event, Direction::ToTarget),
                None => break,
            },
            event = target_events.recv() => match event {
                Some(event) => (event, Direction::ToSource),
                None => break,
            },
        };

        if !event_active(&active_events, event.kind) {
            continue;
        }
        if direction == Direction::ToSource && spec.unidirectional {
            continue;
        }

        let _ = status.lock().transition(SyncState::Syncing);

        let mut batch = vec![(event, direction)];
        // drain whatever else is already queued before reporting SYNCED
        loop {
            match source_events.try_recv() {
                Ok(event) => batch.push((event, Direction::ToTarget)),
                Err(_) => break,
            }
        }
        loop {
            match target_events.try_recv() {
                Ok(event) => batch.push((event, Direction::ToSource)),
                Err(_) => break,
            }
        }

        for (event, direction) in batch {
            if !event_active(&active_events, event.kind) {
                continue;
            }
            if direction == Direction::ToSource && spec.unidirectional {
                continue;
            }
            let action = action_for(&event, direction);
            if let Err(e) =
                apply_action(&spec, &action, &source_ignore, &target_ignore).await
            {
                status.lock().fail(e.to_string());
                wait_for_stop(&mut commands).await;
                let _ = status.lock().transition(SyncState::Stopped);
                return;
            }
        }

        let _ = status.lock().transition(SyncState::Synced);
    }

    let _ = status.lock().transition(SyncState::Stopped);
    tracing::info!("sync job {} stopped", id);
}

/// INIT → SCANNING → SYNCING: index both sides, replicate the differences.
async fn initial_sync(spec: &JobSpec, status: &Mutex<JobStatus>) -> Result<(), BackendError> {
    status
        .lock()
        .transition(SyncState::Scanning)
        .expect("INIT precedes SCANNING");

    with_retry(|| with_timeout(spec.source.open())).await?;
    with_retry(|| with_timeout(spec.target.open())).await?;

    let source_index = with_retry(|| FileIndex::scan(spec.source.as_ref())).await?;
    let target_index = with_retry(|| FileIndex::scan(spec.target.as_ref())).await?;

    let (actions, conflicts) = diff(&source_index, &target_index, spec.unidirectional);
    {
        let mut status = status.lock();
        status.conflicts.extend(conflicts);
        status
            .transition(SyncState::Syncing)
            .expect("SCANNING precedes SYNCING");
    }

    let failure: Mutex<Option<BackendError>> = Mutex::new(None);
    stream::iter(actions)
        .for_each_concurrent(TRANSFER_CONCURRENCY, |action| {
            let failure = &failure;
            async move {
                if failure.lock().is_some() {
                    return;
                }
                if let Err(e) = apply_action(
                    spec,
                    &action,
                    &common::storage::watch::IgnoreSet::default(),
                    &common::storage::watch::IgnoreSet::default(),
                )
                .await
                {
                    failure.lock().get_or_insert(e);
                }
            }
        })
        .await;

    match failure.into_inner() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn event_active(active: &RwLock<HashSet<WatchEventKind>>, kind: WatchEventKind) -> bool {
    let active = active.read();
    active.is_empty() || active.contains(&kind)
}

/// Deletes are only produced here, from watcher evidence.
fn action_for(event: &WatchEvent, direction: Direction) -> SyncAction {
    match event.kind {
        WatchEventKind::Create | WatchEventKind::Modify => SyncAction::Copy {
            path: event.path.clone(),
            direction,
        },
        WatchEventKind::Delete => SyncAction::Delete {
            path: event.path.clone(),
            direction,
        },
    }
}

async fn apply_action(
    spec: &JobSpec,
    action: &SyncAction,
    source_ignore: &common::storage::watch::IgnoreSet,
    target_ignore: &common::storage::watch::IgnoreSet,
) -> Result<(), BackendError> {
    let (from, to, to_ignore): (&dyn StorageBackend, &dyn StorageBackend, _) = match action {
        SyncAction::Copy {
            direction: Direction::ToTarget,
            ..
        }
        | SyncAction::Delete {
            direction: Direction::ToTarget,
            ..
        } => (spec.source.as_ref(), spec.target.as_ref(), target_ignore),
        _ => (spec.target.as_ref(), spec.source.as_ref(), source_ignore),
    };

    match action {
        SyncAction::Copy { path, .. } => {
            let data = match with_retry(|| with_timeout(from.read(path))).await {
                Ok(data) => data,
                // deleted while queued; the delete event will follow
                Err(BackendError::NotFound(_)) => return Ok(()),
                Err(e) => return Err(e),
            };
            to_ignore.lock().insert(path.clone());
            with_retry(|| with_timeout(to.write(path, &data))).await?;
            tracing::debug!("replicated {} ({} bytes)", path.display(), data.len());
        }
        SyncAction::Delete { path, .. } => {
            to_ignore.lock().insert(path.clone());
            match with_retry(|| with_timeout(to.unlink(path))).await {
                Ok(()) | Err(BackendError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
            tracing::debug!("propagated delete of {}", path.display());
        }
    }
    Ok(())
}

/// Bounded exponential backoff over transient failures.
async fn with_retry<T, F, Fut>(mut op: F) -> Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let mut delay = RETRY_BASE;
    for attempt in 1..=RETRY_MAX_ATTEMPTS {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < RETRY_MAX_ATTEMPTS => {
                tracing::warn!("transient backend failure (attempt {}): {}", attempt, e);
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
    unreachable!("retry loop always returns")
}

async fn wait_for_stop(commands: &mut mpsc::UnboundedReceiver<JobCommand>) {
    while let Some(command) = commands.recv().await {
        if matches!(command, JobCommand::Stop) {
            return;
        }
    }
}

/// Verify convergence: both sides hold the same `{path → hash}` map. Used
/// by the test suites.
pub async fn converged(
    source: &dyn StorageBackend,
    target: &dyn StorageBackend,
) -> Result<bool, BackendError> {
    let source_index = FileIndex::scan(source).await?;
    let target_index = FileIndex::scan(target).await?;
    Ok(source_index.content_map() == target_index.content_map())
}
