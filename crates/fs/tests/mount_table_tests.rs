//! Integration tests for the mount table: union listings, primary
//! fallback, lazy mounts, remount identity and pseudo-manifests.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use common::config::Config;
use common::ctx::Context;
use common::storage::{MemoryBackend, StorageBackend};
use wildland_fs::mount_table::{
    FsError, MountItem, MountRequest, MountTable, PSEUDO_MANIFEST_NAME,
};

const OWNER: &str = "0x6f776e65726f776e65726f776e65726f776e65726f776e65726f776e65726f77";
const CONTAINER: &str = "5c34712e-e0a8-4b67-9317-9c3dbb1a4282";
const OTHER_CONTAINER: &str = "99999999-8888-4777-8666-555555555544";

fn table() -> (TempDir, Arc<MountTable>) {
    let dir = TempDir::new().unwrap();
    let ctx = Context::with_config(Config::new(dir.path()));
    (dir, Arc::new(MountTable::new(ctx)))
}

fn pool(tag: &str) -> String {
    format!("{tag}-{}", uuid::Uuid::new_v4())
}

fn storage_json(container: &str, location: &str, primary: bool) -> serde_json::Value {
    json!({
        "type": "memory",
        "owner": OWNER,
        "container-path": format!("/.uuid/{container}"),
        "backend-id": uuid::Uuid::new_v4().to_string(),
        "location": location,
        "primary": primary,
    })
}

fn item(paths: &[&str], storage: serde_json::Value) -> MountItem {
    MountItem {
        paths: paths.iter().map(PathBuf::from).collect(),
        storage,
        read_only: false,
        extra: serde_json::Value::Null,
        remount: false,
    }
}

async fn mount_one(table: &MountTable, item: MountItem, lazy: bool) -> u64 {
    table
        .mount(MountRequest {
            items: vec![item],
            lazy,
        })
        .await
        .unwrap()[0]
}

#[tokio::test]
async fn test_union_listing_and_synthetic_dirs() {
    let (_dir, table) = table();
    let pool_a = pool("a");
    let pool_b = pool("b");
    MemoryBackend::named(&pool_a)
        .write(Path::new("/x.txt"), b"x")
        .await
        .unwrap();

    mount_one(&table, item(&["/data/a"], storage_json(CONTAINER, &pool_a, false)), false).await;
    mount_one(
        &table,
        item(&["/data/b"], storage_json(OTHER_CONTAINER, &pool_b, false)),
        false,
    )
    .await;

    let root = table.list_dir(Path::new("/")).await.unwrap();
    assert_eq!(root.len(), 1);
    assert_eq!(root[0].name, "data");
    assert!(root[0].is_dir);

    let data: Vec<String> = table
        .list_dir(Path::new("/data"))
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(data, ["a", "b"]);

    // the container root unions backend content with the pseudo-manifest
    let a: Vec<String> = table
        .list_dir(Path::new("/data/a"))
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(a, [PSEUDO_MANIFEST_NAME.to_string(), "x.txt".to_string()]);

    assert!(table.stat(Path::new("/data")).await.unwrap().is_dir);
    assert!(matches!(
        table.list_dir(Path::new("/nope")).await,
        Err(FsError::NotMounted(_))
    ));
}

#[tokio::test]
async fn test_primary_fallback_on_read_error() {
    let (_dir, table) = table();
    let pool_primary = pool("primary");
    let pool_backup = pool("backup");

    let primary = MemoryBackend::named(&pool_primary);
    let backup = MemoryBackend::named(&pool_backup);
    primary.write(Path::new("/a.txt"), b"from-primary").await.unwrap();
    backup.write(Path::new("/a.txt"), b"from-backup").await.unwrap();

    mount_one(
        &table,
        item(&["/c"], storage_json(CONTAINER, &pool_primary, true)),
        false,
    )
    .await;
    mount_one(
        &table,
        item(&["/c"], storage_json(CONTAINER, &pool_backup, false)),
        false,
    )
    .await;

    // healthy primary serves the read
    assert_eq!(table.read(Path::new("/c/a.txt")).await.unwrap(), b"from-primary");

    // primary failing falls back to the other storage of the container
    primary.inject_read_fault("/a.txt");
    assert_eq!(table.read(Path::new("/c/a.txt")).await.unwrap(), b"from-backup");

    // no storage can serve: the first (primary) error surfaces as EIO
    backup.inject_read_fault("/a.txt");
    let err = table.read(Path::new("/c/a.txt")).await.unwrap_err();
    assert_eq!(err.errno(), libc::EIO);
}

#[tokio::test]
async fn test_unmount_restores_identity() {
    let (_dir, table) = table();
    let id = mount_one(
        &table,
        item(&["/data/a"], storage_json(CONTAINER, &pool("x"), false)),
        false,
    )
    .await;

    assert!(table.paths().contains_key("/data/a"));
    table.unmount(id).await.unwrap();
    assert!(table.paths().is_empty());
    assert!(matches!(
        table.unmount(id).await,
        Err(FsError::UnknownStorage(_))
    ));
}

#[tokio::test]
async fn test_lazy_mount_defers_open() {
    let (_dir, table) = table();
    let lazy_pool = pool("lazy");
    MemoryBackend::named(&lazy_pool)
        .write(Path::new("/f.txt"), b"later")
        .await
        .unwrap();

    let id = mount_one(
        &table,
        item(&["/lazy"], storage_json(CONTAINER, &lazy_pool, false)),
        true,
    )
    .await;
    assert!(!table.get(id).unwrap().is_open());

    // parent listing shows the stub directory without opening
    let root = table.list_dir(Path::new("/")).await.unwrap();
    assert_eq!(root[0].name, "lazy");

    // first access into the subtree opens the backend
    assert_eq!(table.read(Path::new("/lazy/f.txt")).await.unwrap(), b"later");
    assert!(table.get(id).unwrap().is_open());
}

#[tokio::test]
async fn test_remount_reuses_id_for_same_backend() {
    let (_dir, table) = table();
    let storage = storage_json(CONTAINER, &pool("r"), false);

    let id = mount_one(&table, item(&["/c"], storage.clone()), false).await;

    // same backend-id: storage id survives the remount
    let mut remount = item(&["/c"], storage.clone());
    remount.remount = true;
    let same = mount_one(&table, remount, false).await;
    assert_eq!(same, id);

    // different backend-id at the same path: a fresh id replaces the old
    let mut replace = item(&["/c"], storage_json(CONTAINER, &pool("r2"), false));
    replace.remount = true;
    let fresh = mount_one(&table, replace, false).await;
    assert_ne!(fresh, id);
    assert!(table.get(id).is_none());
    assert!(table.get(fresh).is_some());
}

#[tokio::test]
async fn test_pseudo_manifest_is_read_only() {
    let (_dir, table) = table();
    mount_one(
        &table,
        item(&["/c"], storage_json(CONTAINER, &pool("p"), false)),
        false,
    )
    .await;

    let path = PathBuf::from("/c").join(PSEUDO_MANIFEST_NAME);
    let bytes = table.read(&path).await.unwrap();
    let text = String::from_utf8(bytes).unwrap();
    assert!(text.contains("object: container"));
    assert!(text.contains(OWNER));

    let err = table.write(&path, b"nope").await.unwrap_err();
    assert_eq!(err.errno(), libc::EROFS);

    let stat = table.stat(&path).await.unwrap();
    assert_eq!(stat.size as usize, text.len());
}

#[tokio::test]
async fn test_writes_route_to_primary_and_respect_read_only() {
    let (_dir, table) = table();
    let pool_w = pool("w");

    let mut read_only_item = item(&["/ro"], storage_json(CONTAINER, &pool("ro"), false));
    read_only_item.read_only = true;
    mount_one(&table, read_only_item, false).await;
    let err = table.write(Path::new("/ro/f.txt"), b"x").await.unwrap_err();
    assert_eq!(err.errno(), libc::EROFS);

    mount_one(
        &table,
        item(&["/rw"], storage_json(OTHER_CONTAINER, &pool_w, true)),
        false,
    )
    .await;
    table.write(Path::new("/rw/f.txt"), b"hello").await.unwrap();
    assert_eq!(
        MemoryBackend::named(&pool_w)
            .read(Path::new("/f.txt"))
            .await
            .unwrap(),
        b"hello"
    );
}
