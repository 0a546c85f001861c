//! Mount table: path → storage multiplexing
//!
//! The table maps process-local storage ids (monotonic integers) to live
//! backends and the virtual paths they are visible under. Everything the
//! FUSE layer shows is derived from it:
//!
//! - directory listings are the union of synthetic intermediate directories
//!   (prefixes of mounted paths) and the contents of backends mounted at or
//!   above the listed path
//! - file operations resolve to the primary-owning storage; reads fall back
//!   to the next storage of the same container on backend errors
//! - every mounted container root carries the `.manifest.wildland.yaml`
//!   pseudo-file serving the manifest bytes from memory
//!
//! Path-affecting commands (`mount`, `unmount`, remounts) are serialized on
//! one async lock; lookups only take the short table read lock.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use common::crypto::KeyFingerprint;
use common::ctx::Context;
use common::obj::Storage;
use common::storage::{with_timeout, BackendError, FileStat, StorageBackend};

/// Name of the virtual manifest file inside every mounted container root.
pub const PSEUDO_MANIFEST_NAME: &str = ".manifest.wildland.yaml";

#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("no storage mounted under {0}")]
    NotMounted(PathBuf),
    #[error("not found: {0}")]
    NotFound(PathBuf),
    #[error("storage is read-only")]
    ReadOnly,
    #[error("unknown storage id: {0}")]
    UnknownStorage(u64),
    #[error("bad storage definition: {0}")]
    BadStorage(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl FsError {
    /// Closest POSIX errno for the FUSE layer.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotMounted(_) | FsError::NotFound(_) => libc::ENOENT,
            FsError::ReadOnly => libc::EROFS,
            FsError::UnknownStorage(_) => libc::ENOENT,
            FsError::BadStorage(_) => libc::EINVAL,
            FsError::Backend(BackendError::NotFound(_)) => libc::ENOENT,
            FsError::Backend(BackendError::ReadOnly) => libc::EROFS,
            FsError::Backend(BackendError::Timeout(_)) => libc::ETIMEDOUT,
            FsError::Backend(BackendError::Unsupported(_)) => libc::ENOSYS,
            FsError::Backend(_) => libc::EIO,
        }
    }
}

/// One entry of a `mount` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountItem {
    pub paths: Vec<PathBuf>,
    /// Storage manifest fields (type, owner, container-path, params...).
    pub storage: serde_json::Value,
    #[serde(default, rename = "read-only")]
    pub read_only: bool,
    #[serde(default)]
    pub extra: serde_json::Value,
    #[serde(default)]
    pub remount: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountRequest {
    pub items: Vec<MountItem>,
    #[serde(default)]
    pub lazy: bool,
}

/// A live mounted storage.
pub struct MountedStorage {
    pub id: u64,
    pub backend_id: Uuid,
    pub container_uuid: Uuid,
    pub owner: KeyFingerprint,
    pub paths: Vec<PathBuf>,
    pub primary: bool,
    pub read_only: bool,
    pub lazy: bool,
    pub trusted: bool,
    pub backend_type: String,
    pub manifest_pattern: Option<common::obj::ManifestPattern>,
    pub watcher_interval: Option<u64>,
    pub extra: serde_json::Value,
    /// Bytes served by the pseudo-manifest file.
    pub manifest_bytes: Vec<u8>,
    backend: Arc<dyn StorageBackend>,
    opened: AtomicBool,
    open_lock: tokio::sync::Mutex<()>,
    attr_cache: RwLock<HashMap<PathBuf, FileStat>>,
}

impl std::fmt::Debug for MountedStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountedStorage")
            .field("id", &self.id)
            .field("backend_id", &self.backend_id)
            .field("paths", &self.paths)
            .field("lazy", &self.lazy)
            .field("opened", &self.opened.load(Ordering::Relaxed))
            .finish()
    }
}

impl MountedStorage {
    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    pub fn backend(&self) -> Arc<dyn StorageBackend> {
        self.backend.clone()
    }

    /// Open the backend if it has not been opened yet. Lazy mounts land
    /// here on the first operation into their subtree; a failed open stays
    /// retryable on the next access.
    async fn ensure_open(&self) -> Result<(), FsError> {
        if self.is_open() {
            return Ok(());
        }
        let _guard = self.open_lock.lock().await;
        if self.is_open() {
            return Ok(());
        }
        with_timeout(self.backend.open()).await?;
        self.opened.store(true, Ordering::Release);
        tracing::debug!("storage {} opened", self.id);
        Ok(())
    }

    /// The relative path inside this storage, if `path` falls under one of
    /// its mount paths.
    fn relative(&self, path: &Path) -> Option<PathBuf> {
        self.paths
            .iter()
            .filter_map(|mount| path.strip_prefix(mount).ok())
            .map(|rel| PathBuf::from("/").join(rel))
            .next()
    }

    fn invalidate(&self, path: &Path) {
        self.attr_cache.write().remove(path);
    }

    pub fn clear_cache(&self) {
        self.attr_cache.write().clear();
    }

    async fn stat_cached(&self, rel: &Path) -> Result<FileStat, FsError> {
        if let Some(stat) = self.attr_cache.read().get(rel) {
            return Ok(stat.clone());
        }
        self.ensure_open().await?;
        let stat = with_timeout(self.backend.stat(rel)).await?;
        self.attr_cache
            .write()
            .insert(rel.to_path_buf(), stat.clone());
        Ok(stat)
    }
}

/// A directory entry as the FUSE layer sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    /// Backing storage, `None` for synthetic path directories.
    pub storage_id: Option<u64>,
}

#[derive(Default)]
struct TableInner {
    storages: BTreeMap<u64, Arc<MountedStorage>>,
    next_id: u64,
}

pub struct MountTable {
    ctx: Arc<Context>,
    inner: RwLock<TableInner>,
    /// Serializes mount / unmount / remount.
    mutate_lock: tokio::sync::Mutex<()>,
}

impl MountTable {
    pub fn new(ctx: Arc<Context>) -> Self {
        MountTable {
            ctx,
            inner: RwLock::new(TableInner::default()),
            mutate_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Mount every item of a request, returning the storage ids in order.
    pub async fn mount(&self, request: MountRequest) -> Result<Vec<u64>, FsError> {
        let _guard = self.mutate_lock.lock().await;
        let mut ids = Vec::with_capacity(request.items.len());
        for item in request.items {
            ids.push(self.mount_item(item, request.lazy).await?);
        }
        Ok(ids)
    }

    async fn mount_item(&self, item: MountItem, lazy: bool) -> Result<u64, FsError> {
        if item.paths.is_empty() {
            return Err(FsError::BadStorage("mount item needs paths".into()));
        }
        let storage = parse_storage(&item.storage)?;
        let backend = self.ctx.registry.instantiate(&storage)?;

        let container_uuid = container_uuid_of(&storage)?;
        let manifest_bytes = manifest_bytes_for(&item, &storage);

        let mounted = MountedStorage {
            id: 0,
            backend_id: storage.backend_id(),
            container_uuid,
            owner: storage.owner().clone(),
            paths: item.paths.clone(),
            primary: storage.primary(),
            read_only: item.read_only || storage.read_only(),
            lazy,
            trusted: storage.trusted(),
            backend_type: storage.backend_type().to_string(),
            manifest_pattern: storage.manifest_pattern().cloned(),
            watcher_interval: storage.watcher_interval(),
            extra: item.extra,
            manifest_bytes,
            backend,
            opened: AtomicBool::new(false),
            open_lock: tokio::sync::Mutex::new(()),
            attr_cache: RwLock::new(HashMap::new()),
        };

        if !lazy {
            mounted.ensure_open().await?;
        }

        let mut inner = self.inner.write();
        if item.remount {
            let existing = inner
                .storages
                .values()
                .find(|s| s.paths.first() == item.paths.first())
                .map(|s| (s.id, s.backend_id));
            if let Some((old_id, old_backend_id)) = existing {
                let mut mounted = mounted;
                if old_backend_id == mounted.backend_id {
                    // same identity: keep the storage id
                    mounted.id = old_id;
                    inner.storages.insert(old_id, Arc::new(mounted));
                    tracing::info!("storage {} remounted in place", old_id);
                    return Ok(old_id);
                }
                // different identity: replace under the same write lock so
                // no lookup ever sees the path unmounted
                inner.storages.remove(&old_id);
                inner.next_id += 1;
                let id = inner.next_id;
                mounted.id = id;
                let paths = mounted.paths.clone();
                inner.storages.insert(id, Arc::new(mounted));
                tracing::info!("storage {} replaced {} at {:?}", id, old_id, paths);
                return Ok(id);
            }
        }

        inner.next_id += 1;
        let id = inner.next_id;
        let mut mounted = mounted;
        mounted.id = id;
        tracing::info!(
            "storage {} mounted at {:?} (lazy: {})",
            id,
            mounted.paths,
            lazy
        );
        inner.storages.insert(id, Arc::new(mounted));
        Ok(id)
    }

    pub async fn unmount(&self, storage_id: u64) -> Result<(), FsError> {
        let _guard = self.mutate_lock.lock().await;
        let removed = self.inner.write().storages.remove(&storage_id);
        match removed {
            Some(storage) => {
                if storage.is_open() {
                    let _ = storage.backend.close().await;
                }
                tracing::info!("storage {} unmounted", storage_id);
                Ok(())
            }
            None => Err(FsError::UnknownStorage(storage_id)),
        }
    }

    /// Unmount every storage of a container (subcontainer removal).
    pub async fn unmount_container(&self, container_uuid: Uuid) -> Result<Vec<u64>, FsError> {
        let ids: Vec<u64> = self
            .inner
            .read()
            .storages
            .values()
            .filter(|s| s.container_uuid == container_uuid)
            .map(|s| s.id)
            .collect();
        for id in &ids {
            self.unmount(*id).await?;
        }
        Ok(ids)
    }

    pub fn clear_cache(&self, storage_id: Option<u64>) -> Result<(), FsError> {
        let inner = self.inner.read();
        match storage_id {
            Some(id) => inner
                .storages
                .get(&id)
                .ok_or(FsError::UnknownStorage(id))?
                .clear_cache(),
            None => inner.storages.values().for_each(|s| s.clear_cache()),
        }
        Ok(())
    }

    pub fn get(&self, storage_id: u64) -> Option<Arc<MountedStorage>> {
        self.inner.read().storages.get(&storage_id).cloned()
    }

    pub fn storages(&self) -> Vec<Arc<MountedStorage>> {
        self.inner.read().storages.values().cloned().collect()
    }

    /// Map of visible path → storage ids, the `paths` control command.
    pub fn paths(&self) -> BTreeMap<String, Vec<u64>> {
        let mut out: BTreeMap<String, Vec<u64>> = BTreeMap::new();
        for storage in self.inner.read().storages.values() {
            for path in &storage.paths {
                out.entry(path.to_string_lossy().into_owned())
                    .or_default()
                    .push(storage.id);
            }
        }
        out
    }

    /// Storages covering `path`, primary-owning first. All returned entries
    /// share the relative path within their storage.
    fn owners_of(&self, path: &Path) -> Vec<(Arc<MountedStorage>, PathBuf)> {
        let mut owners: Vec<(Arc<MountedStorage>, PathBuf)> = self
            .inner
            .read()
            .storages
            .values()
            .filter_map(|s| s.relative(path).map(|rel| (s.clone(), rel)))
            .collect();
        owners.sort_by_key(|(s, _)| (std::cmp::Reverse(s.primary), s.id));
        owners
    }

    /// Whether `path` is an intermediate directory synthesized from mounted
    /// paths (or the root).
    fn is_synthetic_dir(&self, path: &Path) -> bool {
        if path == Path::new("/") {
            return true;
        }
        self.inner
            .read()
            .storages
            .values()
            .flat_map(|s| s.paths.iter())
            .any(|mount| mount.starts_with(path))
    }

    /// The pseudo-manifest owner, if `path` names one.
    fn pseudo_owner(&self, path: &Path) -> Option<Arc<MountedStorage>> {
        if path.file_name()?.to_str()? != PSEUDO_MANIFEST_NAME {
            return None;
        }
        let parent = path.parent()?;
        self.inner
            .read()
            .storages
            .values()
            .find(|s| s.paths.iter().any(|p| p == parent))
            .cloned()
    }

    /// Union directory listing.
    pub async fn list_dir(&self, path: &Path) -> Result<Vec<DirEntry>, FsError> {
        let mut entries: BTreeMap<String, DirEntry> = BTreeMap::new();
        let mut any_source = false;

        // synthetic directories from mounted paths
        {
            let inner = self.inner.read();
            for storage in inner.storages.values() {
                for mount in &storage.paths {
                    if let Ok(rest) = mount.strip_prefix(path) {
                        if let Some(first) = rest.components().next() {
                            let name = first.as_os_str().to_string_lossy().into_owned();
                            entries.entry(name.clone()).or_insert(DirEntry {
                                name,
                                is_dir: true,
                                storage_id: None,
                            });
                            any_source = true;
                        } else {
                            // path IS a container mount root
                            entries.insert(
                                PSEUDO_MANIFEST_NAME.to_string(),
                                DirEntry {
                                    name: PSEUDO_MANIFEST_NAME.to_string(),
                                    is_dir: false,
                                    storage_id: Some(storage.id),
                                },
                            );
                            any_source = true;
                        }
                    }
                }
            }
        }

        // backend contents of storages mounted at or above `path`
        for (storage, rel) in self.owners_of(path) {
            match storage.ensure_open().await {
                Ok(()) => {}
                Err(e) => {
                    tracing::debug!("cannot open storage {} for listing: {}", storage.id, e);
                    continue;
                }
            }
            any_source = true;
            let names = match with_timeout(storage.backend.readdir(&rel)).await {
                Ok(names) => names,
                Err(BackendError::NotFound(_)) => continue,
                Err(e) => {
                    tracing::debug!("listing via storage {} failed: {}", storage.id, e);
                    continue;
                }
            };
            for name in names {
                let stat = storage.stat_cached(&rel.join(&name)).await;
                let is_dir = stat.map(|s| s.is_dir).unwrap_or(false);
                entries.entry(name.clone()).or_insert(DirEntry {
                    name,
                    is_dir,
                    storage_id: Some(storage.id),
                });
            }
        }

        if !any_source && !self.is_synthetic_dir(path) {
            return Err(FsError::NotMounted(path.to_path_buf()));
        }
        Ok(entries.into_values().collect())
    }

    /// Stat a virtual path: pseudo-manifest, synthetic directory, or a file
    /// inside a mounted storage.
    pub async fn stat(&self, path: &Path) -> Result<FileStat, FsError> {
        if let Some(storage) = self.pseudo_owner(path) {
            return Ok(FileStat {
                size: storage.manifest_bytes.len() as u64,
                mtime: SystemTime::UNIX_EPOCH,
                is_dir: false,
            });
        }
        if self.is_synthetic_dir(path) {
            return Ok(FileStat {
                size: 0,
                mtime: SystemTime::UNIX_EPOCH,
                is_dir: true,
            });
        }

        let owners = self.owners_of(path);
        if owners.is_empty() {
            return Err(FsError::NotMounted(path.to_path_buf()));
        }
        let mut last = None;
        for (storage, rel) in owners {
            match storage.stat_cached(&rel).await {
                Ok(stat) => return Ok(stat),
                Err(e) => last = Some(e),
            }
        }
        Err(last.unwrap_or_else(|| FsError::NotFound(path.to_path_buf())))
    }

    /// Read a file. The primary-owning storage is tried first; on error the
    /// read falls back to the next storage of the *same container*.
    pub async fn read(&self, path: &Path) -> Result<Vec<u8>, FsError> {
        if let Some(storage) = self.pseudo_owner(path) {
            return Ok(storage.manifest_bytes.clone());
        }

        let owners = self.owners_of(path);
        if owners.is_empty() {
            return Err(FsError::NotMounted(path.to_path_buf()));
        }
        let container = owners[0].0.container_uuid;

        let mut first_error: Option<FsError> = None;
        for (storage, rel) in owners {
            if storage.container_uuid != container {
                continue;
            }
            match storage.ensure_open().await {
                Ok(()) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                    continue;
                }
            }
            match with_timeout(storage.backend.read(&rel)).await {
                Ok(data) => return Ok(data),
                Err(e) => {
                    tracing::debug!(
                        "read {:?} via storage {} failed: {}, trying fallback",
                        path,
                        storage.id,
                        e
                    );
                    first_error.get_or_insert(e.into());
                }
            }
        }
        Err(first_error.unwrap_or_else(|| FsError::NotFound(path.to_path_buf())))
    }

    /// Pick the storage that owns writes for `path`.
    fn write_owner(&self, path: &Path) -> Result<(Arc<MountedStorage>, PathBuf), FsError> {
        if self.pseudo_owner(path).is_some() {
            // pseudo-manifests are read-only
            return Err(FsError::ReadOnly);
        }
        let owners = self.owners_of(path);
        let (storage, rel) = owners
            .into_iter()
            .next()
            .ok_or_else(|| FsError::NotMounted(path.to_path_buf()))?;
        if storage.read_only {
            return Err(FsError::ReadOnly);
        }
        Ok((storage, rel))
    }

    pub async fn write(&self, path: &Path, data: &[u8]) -> Result<(), FsError> {
        let (storage, rel) = self.write_owner(path)?;
        storage.ensure_open().await?;
        with_timeout(storage.backend.write(&rel, data)).await?;
        storage.invalidate(&rel);
        Ok(())
    }

    pub async fn create(&self, path: &Path) -> Result<(), FsError> {
        let (storage, rel) = self.write_owner(path)?;
        storage.ensure_open().await?;
        with_timeout(storage.backend.create(&rel)).await?;
        storage.invalidate(&rel);
        Ok(())
    }

    pub async fn truncate(&self, path: &Path, size: u64) -> Result<(), FsError> {
        let (storage, rel) = self.write_owner(path)?;
        storage.ensure_open().await?;
        with_timeout(storage.backend.truncate(&rel, size)).await?;
        storage.invalidate(&rel);
        Ok(())
    }

    pub async fn unlink(&self, path: &Path) -> Result<(), FsError> {
        let (storage, rel) = self.write_owner(path)?;
        storage.ensure_open().await?;
        with_timeout(storage.backend.unlink(&rel)).await?;
        storage.invalidate(&rel);
        Ok(())
    }

    pub async fn mkdir(&self, path: &Path) -> Result<(), FsError> {
        let (storage, rel) = self.write_owner(path)?;
        storage.ensure_open().await?;
        with_timeout(storage.backend.mkdir(&rel)).await?;
        Ok(())
    }

    pub async fn rmdir(&self, path: &Path) -> Result<(), FsError> {
        let (storage, rel) = self.write_owner(path)?;
        storage.ensure_open().await?;
        with_timeout(storage.backend.rmdir(&rel)).await?;
        storage.invalidate(&rel);
        Ok(())
    }

    pub async fn rename(&self, from: &Path, to: &Path) -> Result<(), FsError> {
        let (storage, rel_from) = self.write_owner(from)?;
        let (to_storage, rel_to) = self.write_owner(to)?;
        if storage.id != to_storage.id {
            return Err(FsError::Backend(BackendError::Unsupported(
                "rename across storages",
            )));
        }
        storage.ensure_open().await?;
        with_timeout(storage.backend.rename(&rel_from, &rel_to)).await?;
        storage.invalidate(&rel_from);
        storage.invalidate(&rel_to);
        Ok(())
    }
}

/// Parse the `storage` field of a mount item into a typed storage.
fn parse_storage(raw: &serde_json::Value) -> Result<Storage, FsError> {
    let yaml: serde_yaml::Value = serde_yaml::to_value(raw)
        .map_err(|e| FsError::BadStorage(format!("storage is not a mapping: {e}")))?;
    let map = yaml
        .as_mapping()
        .cloned()
        .ok_or_else(|| FsError::BadStorage("storage is not a mapping".into()))?;

    let owner: KeyFingerprint = map
        .get("owner")
        .and_then(serde_yaml::Value::as_str)
        .ok_or_else(|| FsError::BadStorage("storage needs an owner".into()))?
        .parse()
        .map_err(|_| FsError::BadStorage("storage owner is not a fingerprint".into()))?;
    let container_path = map
        .get("container-path")
        .and_then(serde_yaml::Value::as_str)
        .map(PathBuf::from)
        .ok_or_else(|| FsError::BadStorage("storage needs a container-path".into()))?;

    Storage::from_inline(map, &owner, &container_path)
        .map_err(|e| FsError::BadStorage(e.to_string()))
}

fn container_uuid_of(storage: &Storage) -> Result<Uuid, FsError> {
    storage
        .container_path()
        .strip_prefix("/.uuid/")
        .ok()
        .and_then(|rest| rest.to_str())
        .and_then(|raw| Uuid::parse_str(raw).ok())
        .ok_or_else(|| {
            FsError::BadStorage(format!(
                "container-path is not a uuid path: {:?}",
                storage.container_path()
            ))
        })
}

/// Bytes the pseudo-manifest file serves: the manifest text carried in
/// `extra.manifest` when present, otherwise a rendering of the storage
/// definition the mount was made from.
fn manifest_bytes_for(item: &MountItem, storage: &Storage) -> Vec<u8> {
    if let Some(text) = item.extra.get("manifest").and_then(serde_json::Value::as_str) {
        return text.as_bytes().to_vec();
    }
    let mut doc = serde_yaml::Mapping::new();
    doc.insert("object".into(), "container".into());
    doc.insert("owner".into(), storage.owner().to_string().into());
    doc.insert(
        "paths".into(),
        serde_yaml::Value::Sequence(
            item.paths
                .iter()
                .map(|p| serde_yaml::Value::String(p.to_string_lossy().into_owned()))
                .collect(),
        ),
    );
    doc.insert("version".into(), "1".into());
    serde_yaml::to_string(&doc)
        .map(String::into_bytes)
        .unwrap_or_default()
}
