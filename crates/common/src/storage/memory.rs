//! The `memory` driver: an in-process tree
//!
//! Used by the test suites and by dummy-mode setups that need a storage
//! with no host footprint. Supports injecting read faults so failover
//! paths can be exercised.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::obj::Storage;

use super::{BackendError, Capabilities, FileStat, StorageBackend};

#[derive(Debug, Clone)]
enum Entry {
    File { data: Vec<u8>, mtime: SystemTime },
    Dir,
}

#[derive(Debug, Default)]
struct Tree {
    entries: BTreeMap<PathBuf, Entry>,
    fail_reads: HashSet<PathBuf>,
}

/// In-memory backend. Cloning shares the tree.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    tree: Arc<RwLock<Tree>>,
    read_only: bool,
}

impl MemoryBackend {
    /// A private tree, not visible to other instances.
    pub fn new() -> Self {
        Self::default()
    }

    /// A tree from the process-wide pool: every instance created with the
    /// same name shares content. Manifest-driven instantiation goes through
    /// here (keyed by the `location` param), so a storage definition keeps
    /// addressing the same tree no matter how often it is re-instantiated.
    pub fn named(name: &str) -> Self {
        static POOL: std::sync::OnceLock<parking_lot::Mutex<HashMap<String, Arc<RwLock<Tree>>>>> =
            std::sync::OnceLock::new();
        let pool = POOL.get_or_init(Default::default);
        let tree = pool
            .lock()
            .entry(name.to_string())
            .or_insert_with(Default::default)
            .clone();
        MemoryBackend {
            tree,
            read_only: false,
        }
    }

    pub fn from_storage(storage: &Storage) -> Self {
        let name = storage
            .params()
            .get("location")
            .and_then(serde_yaml::Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| storage.backend_id().to_string());
        MemoryBackend {
            read_only: storage.read_only(),
            ..Self::named(&name)
        }
    }

    /// Make subsequent reads of `path` fail with a backend I/O error.
    pub fn inject_read_fault(&self, path: impl Into<PathBuf>) {
        self.tree.write().fail_reads.insert(path.into());
    }

    pub fn clear_read_faults(&self) {
        self.tree.write().fail_reads.clear();
    }

    /// Drop everything, including injected faults.
    pub fn clear(&self) {
        let mut tree = self.tree.write();
        tree.entries.clear();
        tree.fail_reads.clear();
    }

    fn check_writable(&self) -> Result<(), BackendError> {
        if self.read_only {
            return Err(BackendError::ReadOnly);
        }
        Ok(())
    }
}

fn normalized(path: &Path) -> PathBuf {
    PathBuf::from("/").join(path.strip_prefix("/").unwrap_or(path))
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn backend_type(&self) -> &'static str {
        "memory"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            read_only: self.read_only,
            native_watcher: false,
            random_writes: true,
        }
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>, BackendError> {
        let path = normalized(path);
        let tree = self.tree.read();
        if tree.fail_reads.contains(&path) {
            return Err(BackendError::Io(format!(
                "injected read fault: {}",
                path.display()
            )));
        }
        match tree.entries.get(&path) {
            Some(Entry::File { data, .. }) => Ok(data.clone()),
            _ => Err(BackendError::NotFound(path)),
        }
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<(), BackendError> {
        self.check_writable()?;
        let path = normalized(path);
        let mut tree = self.tree.write();
        // implicit parent directories, like object stores behave
        let mut parent = path.parent();
        while let Some(dir) = parent {
            if dir != Path::new("/") {
                tree.entries.insert(dir.to_path_buf(), Entry::Dir);
            }
            parent = dir.parent();
        }
        tree.entries.insert(
            path,
            Entry::File {
                data: data.to_vec(),
                mtime: SystemTime::now(),
            },
        );
        Ok(())
    }

    async fn truncate(&self, path: &Path, size: u64) -> Result<(), BackendError> {
        self.check_writable()?;
        let path = normalized(path);
        let mut tree = self.tree.write();
        match tree.entries.get_mut(&path) {
            Some(Entry::File { data, mtime }) => {
                data.resize(size as usize, 0);
                *mtime = SystemTime::now();
                Ok(())
            }
            _ => Err(BackendError::NotFound(path)),
        }
    }

    async fn unlink(&self, path: &Path) -> Result<(), BackendError> {
        self.check_writable()?;
        let path = normalized(path);
        let mut tree = self.tree.write();
        match tree.entries.remove(&path) {
            Some(Entry::File { .. }) => Ok(()),
            Some(dir) => {
                tree.entries.insert(path.clone(), dir);
                Err(BackendError::Io(format!("not a file: {}", path.display())))
            }
            None => Err(BackendError::NotFound(path)),
        }
    }

    async fn readdir(&self, path: &Path) -> Result<Vec<String>, BackendError> {
        let path = normalized(path);
        let tree = self.tree.read();
        if path != Path::new("/") && !matches!(tree.entries.get(&path), Some(Entry::Dir)) {
            return Err(BackendError::NotFound(path));
        }
        let mut names: Vec<String> = tree
            .entries
            .keys()
            .filter(|p| p.parent() == Some(path.as_path()))
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn mkdir(&self, path: &Path) -> Result<(), BackendError> {
        self.check_writable()?;
        let path = normalized(path);
        self.tree.write().entries.insert(path, Entry::Dir);
        Ok(())
    }

    async fn rmdir(&self, path: &Path) -> Result<(), BackendError> {
        self.check_writable()?;
        let path = normalized(path);
        let mut tree = self.tree.write();
        let occupied = tree
            .entries
            .keys()
            .any(|p| p.parent() == Some(path.as_path()));
        if occupied {
            return Err(BackendError::Io(format!(
                "directory not empty: {}",
                path.display()
            )));
        }
        match tree.entries.remove(&path) {
            Some(Entry::Dir) => Ok(()),
            Some(entry) => {
                tree.entries.insert(path.clone(), entry);
                Err(BackendError::Io(format!("not a directory: {}", path.display())))
            }
            None => Err(BackendError::NotFound(path)),
        }
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<(), BackendError> {
        self.check_writable()?;
        let from = normalized(from);
        let to = normalized(to);
        let mut tree = self.tree.write();
        let entry = tree
            .entries
            .remove(&from)
            .ok_or(BackendError::NotFound(from))?;
        tree.entries.insert(to, entry);
        Ok(())
    }

    async fn stat(&self, path: &Path) -> Result<FileStat, BackendError> {
        let path = normalized(path);
        let tree = self.tree.read();
        if path == Path::new("/") {
            return Ok(FileStat {
                size: 0,
                mtime: SystemTime::UNIX_EPOCH,
                is_dir: true,
            });
        }
        match tree.entries.get(&path) {
            Some(Entry::File { data, mtime }) => Ok(FileStat {
                size: data.len() as u64,
                mtime: *mtime,
                is_dir: false,
            }),
            Some(Entry::Dir) => Ok(FileStat {
                size: 0,
                mtime: SystemTime::UNIX_EPOCH,
                is_dir: true,
            }),
            None => Err(BackendError::NotFound(path)),
        }
    }
}
