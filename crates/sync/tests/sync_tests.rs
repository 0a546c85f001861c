//! Integration tests for the sync daemon: convergence, last-writer-wins,
//! watcher-gated deletes, event filtering, error injection and the control
//! protocol.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use common::config::Config;
use common::ctx::Context;
use common::storage::{MemoryBackend, StorageBackend, WatchEventKind};
use wildland_sync::daemon::SyncDaemon;
use wildland_sync::engine::{converged, JobHandle, JobSpec};
use wildland_sync::job::{JobId, SyncState};

const OWNER: &str = "0x6f776e65726f776e65726f776e65726f776e65726f776e65726f776e65726f77";
const CONTAINER: &str = "5c34712e-e0a8-4b67-9317-9c3dbb1a4282";

fn job_id() -> JobId {
    format!("{OWNER}|{CONTAINER}").parse().unwrap()
}

fn spec(source: &MemoryBackend, target: &MemoryBackend, continuous: bool, unidirectional: bool) -> JobSpec {
    JobSpec {
        id: job_id(),
        container_name: "test".to_string(),
        source: Arc::new(source.clone()),
        target: Arc::new(target.clone()),
        continuous,
        unidirectional,
        watch_interval: Duration::from_millis(50),
    }
}

async fn wait_for_state(handle: &JobHandle, state: SyncState) {
    for _ in 0..200 {
        if handle.state() == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("job never reached {state}, stuck in {}", handle.state());
}

async fn wait_until<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_one_shot_convergence() {
    let source = MemoryBackend::new();
    let target = MemoryBackend::new();
    source.write(Path::new("/a.txt"), b"1").await.unwrap();
    source.write(Path::new("/sub/b.txt"), b"2").await.unwrap();
    target.write(Path::new("/only-here.txt"), b"3").await.unwrap();

    let handle = JobHandle::spawn(spec(&source, &target, false, false), HashSet::new());
    wait_for_state(&handle, SyncState::Stopped).await;

    // bidirectional: both sides hold the union
    assert!(converged(&source, &target).await.unwrap());
    assert_eq!(target.read(Path::new("/sub/b.txt")).await.unwrap(), b"2");
    assert_eq!(source.read(Path::new("/only-here.txt")).await.unwrap(), b"3");
}

#[tokio::test]
async fn test_one_shot_unidirectional_leaves_source_alone() {
    let source = MemoryBackend::new();
    let target = MemoryBackend::new();
    source.write(Path::new("/a.txt"), b"1").await.unwrap();
    target.write(Path::new("/extra.txt"), b"t").await.unwrap();

    let handle = JobHandle::spawn(spec(&source, &target, false, true), HashSet::new());
    wait_for_state(&handle, SyncState::Stopped).await;

    assert_eq!(target.read(Path::new("/a.txt")).await.unwrap(), b"1");
    // target extras are not copied back and not deleted
    assert!(source.read(Path::new("/extra.txt")).await.is_err());
    assert!(target.read(Path::new("/extra.txt")).await.is_ok());
}

#[tokio::test]
async fn test_bidirectional_last_writer_wins() {
    let source = MemoryBackend::new();
    let target = MemoryBackend::new();

    let handle = JobHandle::spawn(spec(&source, &target, true, false), HashSet::new());
    wait_for_state(&handle, SyncState::Synced).await;

    source.write(Path::new("/x"), b"1").await.unwrap();
    wait_until("x to reach target", || {
        futures::executor::block_on(target.read(Path::new("/x"))).is_ok()
    })
    .await;

    // a later write on the target side must flow back to the source
    tokio::time::sleep(Duration::from_millis(20)).await;
    target.write(Path::new("/x"), b"2").await.unwrap();
    wait_until("newer x to reach source", || {
        futures::executor::block_on(source.read(Path::new("/x"))).as_deref() == Ok(b"2".as_slice())
    })
    .await;

    wait_for_state(&handle, SyncState::Synced).await;
    assert!(converged(&source, &target).await.unwrap());
    handle.join().await;
}

#[tokio::test]
async fn test_watched_delete_propagates() {
    let source = MemoryBackend::new();
    let target = MemoryBackend::new();
    source.write(Path::new("/doomed.txt"), b"x").await.unwrap();

    let handle = JobHandle::spawn(spec(&source, &target, true, false), HashSet::new());
    wait_for_state(&handle, SyncState::Synced).await;
    wait_until("initial copy", || {
        futures::executor::block_on(target.read(Path::new("/doomed.txt"))).is_ok()
    })
    .await;

    // the watcher reports this delete, so it propagates
    source.unlink(Path::new("/doomed.txt")).await.unwrap();
    wait_until("delete to propagate", || {
        futures::executor::block_on(target.read(Path::new("/doomed.txt"))).is_err()
    })
    .await;
    handle.join().await;
}

#[tokio::test]
async fn test_event_filter_drops_deletes() {
    let source = MemoryBackend::new();
    let target = MemoryBackend::new();
    source.write(Path::new("/kept.txt"), b"x").await.unwrap();

    let filter: HashSet<WatchEventKind> =
        [WatchEventKind::Create, WatchEventKind::Modify].into_iter().collect();
    let handle = JobHandle::spawn(spec(&source, &target, true, false), filter);
    wait_for_state(&handle, SyncState::Synced).await;
    wait_until("initial copy", || {
        futures::executor::block_on(target.read(Path::new("/kept.txt"))).is_ok()
    })
    .await;

    source.unlink(Path::new("/kept.txt")).await.unwrap();
    // give the watcher several scan cycles: the delete must be dropped
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(target.read(Path::new("/kept.txt")).await.is_ok());
    handle.join().await;
}

#[tokio::test]
async fn test_error_injection_and_stop() {
    let source = MemoryBackend::new();
    let target = MemoryBackend::new();

    let handle = JobHandle::spawn(spec(&source, &target, true, false), HashSet::new());
    wait_for_state(&handle, SyncState::Synced).await;

    handle.inject_error();
    wait_for_state(&handle, SyncState::Error).await;
    assert!(handle
        .status
        .lock()
        .last_error
        .as_deref()
        .unwrap()
        .contains("injected"));

    handle.stop();
    wait_for_state(&handle, SyncState::Stopped).await;
}

#[tokio::test]
async fn test_control_protocol_round_trip() {
    let dir = TempDir::new().unwrap();
    let ctx = Context::with_config(Config::new(dir.path()));
    let socket = dir.path().join("sync.sock");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let daemon = Arc::new(SyncDaemon::new(ctx, shutdown_tx));
    let server = tokio::spawn({
        let socket = socket.clone();
        let daemon = daemon.clone();
        async move { common::control::serve(&socket, daemon, shutdown_rx).await }
    });
    wait_until("socket to appear", || socket.exists()).await;

    let source_pool = format!("ctl-src-{}", uuid::Uuid::new_v4());
    let target_pool = format!("ctl-tgt-{}", uuid::Uuid::new_v4());
    MemoryBackend::named(&source_pool)
        .write(Path::new("/f.txt"), b"payload")
        .await
        .unwrap();

    let storage = |location: &str| {
        json!({
            "type": "memory",
            "owner": OWNER,
            "container-path": format!("/.uuid/{CONTAINER}"),
            "location": location,
        })
    };
    let start_args = json!({
        "container-name": "demo",
        "job-id": format!("{OWNER}|{CONTAINER}"),
        "source": storage(&source_pool),
        "target": storage(&target_pool),
        "continuous": false,
        "unidirectional": true,
    });

    let response = common::control::request(&socket, "start", 1, start_args.clone())
        .await
        .unwrap();
    assert!(response.error.is_none(), "start failed: {response:?}");

    let mut finished = false;
    for _ in 0..200 {
        let response = common::control::request(
            &socket,
            "job-state",
            2,
            json!({"job-id": format!("{OWNER}|{CONTAINER}")}),
        )
        .await
        .unwrap();
        if response.result.map(|r| r["state"] == "STOPPED").unwrap_or(false) {
            finished = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(finished, "one-shot job never reached STOPPED");

    assert_eq!(
        MemoryBackend::named(&target_pool)
            .read(Path::new("/f.txt"))
            .await
            .unwrap(),
        b"payload"
    );

    let response = common::control::request(&socket, "status", 3, json!({}))
        .await
        .unwrap();
    assert!(response.result.unwrap().as_object().unwrap().len() == 1);

    let response = common::control::request(&socket, "bogus", 4, json!({}))
        .await
        .unwrap();
    assert_eq!(response.error.as_deref(), Some("unknown-command"));

    let response = common::control::request(&socket, "stop", 5, json!({"job-id": "garbage"}))
        .await
        .unwrap();
    assert_eq!(response.error.as_deref(), Some("bad-args"));

    let response = common::control::request(&socket, "shutdown", 6, json!({}))
        .await
        .unwrap();
    assert!(response.error.is_none());
    server.await.unwrap().unwrap();
}
