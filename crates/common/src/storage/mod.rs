//! Storage backend contract
//!
//! Every driver exposes the same async file/dir surface; the mount core and
//! the sync daemon never see anything more specific than `dyn
//! StorageBackend`. Drivers are looked up in a [`BackendRegistry`] keyed by
//! the manifest `type` string and instantiated from the storage's
//! type-specific params.
//!
//! Drivers without a native watcher get the polling substitute in
//! [`watch`], driven by the storage's `watcher-interval`.

mod local;
mod memory;
pub mod watch;

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;

use crate::obj::{ManifestPattern, Storage};
use crate::wlpath::glob_match;

pub use local::LocalBackend;
pub use memory::MemoryBackend;
pub use watch::{PollingWatcher, WatchEvent, WatchEventKind, DEFAULT_WATCH_INTERVAL};

/// Default per-call timeout for backend operations.
pub const BACKEND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum BackendError {
    #[error("not found: {0}")]
    NotFound(PathBuf),
    #[error("storage is read-only")]
    ReadOnly,
    #[error("backend I/O error: {0}")]
    Io(String),
    #[error("backend call timed out after {0:?}")]
    Timeout(Duration),
    #[error("operation not supported by this backend: {0}")]
    Unsupported(&'static str),
    #[error("bad backend parameters: {0}")]
    BadParams(String),
    #[error("unknown storage type: {0}")]
    UnknownType(String),
}

impl BackendError {
    /// Whether retrying the call can help (sync layer backoff policy).
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Timeout(_) | BackendError::Io(_))
    }
}

/// What a driver can and cannot do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub read_only: bool,
    pub native_watcher: bool,
    pub random_writes: bool,
}

/// Metadata for a single file or directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub mtime: SystemTime,
    pub is_dir: bool,
}

/// The uniform driver contract.
///
/// Paths are absolute within the storage (`/a/b.txt`); drivers translate
/// them to whatever their medium uses. All calls are expected to be wrapped
/// in [`with_timeout`] by the caller.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn backend_type(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// Bring the backend up. Called once before first use; lazy mounts
    /// defer this until the first operation lands in their subtree.
    async fn open(&self) -> Result<(), BackendError> {
        Ok(())
    }

    /// Tear the backend down. Pending operations may still complete.
    async fn close(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>, BackendError>;

    async fn write(&self, path: &Path, data: &[u8]) -> Result<(), BackendError>;

    async fn create(&self, path: &Path) -> Result<(), BackendError> {
        self.write(path, &[]).await
    }

    async fn truncate(&self, path: &Path, size: u64) -> Result<(), BackendError>;

    async fn unlink(&self, path: &Path) -> Result<(), BackendError>;

    async fn readdir(&self, path: &Path) -> Result<Vec<String>, BackendError>;

    async fn mkdir(&self, path: &Path) -> Result<(), BackendError>;

    async fn rmdir(&self, path: &Path) -> Result<(), BackendError>;

    async fn rename(&self, from: &Path, to: &Path) -> Result<(), BackendError>;

    async fn stat(&self, path: &Path) -> Result<FileStat, BackendError>;
}

/// Apply the driver timeout to a backend call.
pub async fn with_timeout<T, F>(fut: F) -> Result<T, BackendError>
where
    F: Future<Output = Result<T, BackendError>>,
{
    match tokio::time::timeout(BACKEND_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Timeout(BACKEND_TIMEOUT)),
    }
}

/// Recursively collect files under `dir` (absolute storage paths).
pub async fn walk_files(
    backend: &dyn StorageBackend,
    dir: &Path,
) -> Result<Vec<PathBuf>, BackendError> {
    let mut out = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let names = match backend.readdir(&current).await {
            Ok(names) => names,
            Err(BackendError::NotFound(_)) => continue,
            Err(e) => return Err(e),
        };
        for name in names {
            let path = current.join(&name);
            match backend.stat(&path).await {
                Ok(stat) if stat.is_dir => pending.push(path),
                Ok(_) => out.push(path),
                // raced with a concurrent delete
                Err(BackendError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    }
    out.sort();
    Ok(out)
}

/// Find manifest files a storage advertises through its `manifest-pattern`.
/// Returns `(path, bytes)` pairs; unreadable entries are skipped.
pub async fn find_manifests(
    backend: &dyn StorageBackend,
    pattern: Option<&ManifestPattern>,
) -> Result<Vec<(PathBuf, Vec<u8>)>, BackendError> {
    let default = ManifestPattern::Glob("/*.yaml".to_string());
    let pattern = pattern.unwrap_or(&default);

    let candidates: Vec<PathBuf> = match pattern {
        ManifestPattern::List(paths) => paths.clone(),
        ManifestPattern::Glob(glob) => walk_files(backend, Path::new("/"))
            .await?
            .into_iter()
            .filter(|p| glob_match(glob, &p.to_string_lossy()))
            .collect(),
    };

    let mut out = Vec::new();
    for path in candidates {
        match backend.read(&path).await {
            Ok(bytes) => out.push((path, bytes)),
            Err(e) => tracing::debug!("skipping manifest candidate {}: {}", path.display(), e),
        }
    }
    Ok(out)
}

type Factory =
    Box<dyn Fn(&Storage) -> Result<Arc<dyn StorageBackend>, BackendError> + Send + Sync>;

/// Registry of driver factories keyed by the manifest `type` string.
///
/// Populated at startup; replaces the original's runtime plugin loading
/// with explicit registration.
pub struct BackendRegistry {
    factories: HashMap<String, Factory>,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.factories.keys().collect();
        types.sort();
        f.debug_struct("BackendRegistry").field("types", &types).finish()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl BackendRegistry {
    pub fn empty() -> Self {
        BackendRegistry {
            factories: HashMap::new(),
        }
    }

    /// The built-in drivers: `local` and `memory`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("local", |storage| {
            Ok(Arc::new(LocalBackend::from_storage(storage)?) as Arc<dyn StorageBackend>)
        });
        registry.register("memory", |storage| {
            Ok(Arc::new(MemoryBackend::from_storage(storage)) as Arc<dyn StorageBackend>)
        });
        registry
    }

    pub fn register<F>(&mut self, backend_type: &str, factory: F)
    where
        F: Fn(&Storage) -> Result<Arc<dyn StorageBackend>, BackendError> + Send + Sync + 'static,
    {
        self.factories
            .insert(backend_type.to_string(), Box::new(factory));
    }

    pub fn supports(&self, backend_type: &str) -> bool {
        self.factories.contains_key(backend_type)
    }

    /// Instantiate a backend for a storage definition. The backend is *not*
    /// opened yet.
    pub fn instantiate(&self, storage: &Storage) -> Result<Arc<dyn StorageBackend>, BackendError> {
        let factory = self
            .factories
            .get(storage.backend_type())
            .ok_or_else(|| BackendError::UnknownType(storage.backend_type().to_string()))?;
        factory(storage)
    }
}
