//! The `local` driver: a directory on the local filesystem
//!
//! Params: `location` (absolute host path the storage is rooted at).
//! Virtual storage paths map 1:1 under the root; traversal outside the root
//! is rejected.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde_yaml::Value;

use crate::obj::Storage;

use super::{BackendError, Capabilities, FileStat, StorageBackend};

#[derive(Debug)]
pub struct LocalBackend {
    root: PathBuf,
    read_only: bool,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>, read_only: bool) -> Self {
        LocalBackend {
            root: root.into(),
            read_only,
        }
    }

    pub fn from_storage(storage: &Storage) -> Result<Self, BackendError> {
        let location = storage
            .params()
            .get("location")
            .and_then(Value::as_str)
            .ok_or_else(|| BackendError::BadParams("local storage needs a location".into()))?;
        Ok(LocalBackend::new(location, storage.read_only()))
    }

    /// Translate a virtual absolute path to a host path under the root.
    fn host_path(&self, path: &Path) -> Result<PathBuf, BackendError> {
        let mut out = self.root.clone();
        for component in path.components() {
            match component {
                Component::RootDir => {}
                Component::Normal(part) => out.push(part),
                Component::CurDir => {}
                _ => return Err(BackendError::BadParams(format!("bad path: {path:?}"))),
            }
        }
        Ok(out)
    }

    fn check_writable(&self) -> Result<(), BackendError> {
        if self.read_only {
            return Err(BackendError::ReadOnly);
        }
        Ok(())
    }

    fn map_err(path: &Path, e: std::io::Error) -> BackendError {
        if e.kind() == ErrorKind::NotFound {
            BackendError::NotFound(path.to_path_buf())
        } else {
            BackendError::Io(e.to_string())
        }
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn backend_type(&self) -> &'static str {
        "local"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            read_only: self.read_only,
            native_watcher: false,
            random_writes: true,
        }
    }

    async fn open(&self) -> Result<(), BackendError> {
        if !self.root.is_dir() {
            return Err(BackendError::BadParams(format!(
                "location is not a directory: {}",
                self.root.display()
            )));
        }
        Ok(())
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>, BackendError> {
        let host = self.host_path(path)?;
        tokio::fs::read(&host).await.map_err(|e| Self::map_err(path, e))
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<(), BackendError> {
        self.check_writable()?;
        let host = self.host_path(path)?;
        if let Some(parent) = host.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::map_err(path, e))?;
        }
        tokio::fs::write(&host, data)
            .await
            .map_err(|e| Self::map_err(path, e))
    }

    async fn truncate(&self, path: &Path, size: u64) -> Result<(), BackendError> {
        self.check_writable()?;
        let host = self.host_path(path)?;
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&host)
            .await
            .map_err(|e| Self::map_err(path, e))?;
        file.set_len(size).await.map_err(|e| Self::map_err(path, e))
    }

    async fn unlink(&self, path: &Path) -> Result<(), BackendError> {
        self.check_writable()?;
        let host = self.host_path(path)?;
        tokio::fs::remove_file(&host)
            .await
            .map_err(|e| Self::map_err(path, e))
    }

    async fn readdir(&self, path: &Path) -> Result<Vec<String>, BackendError> {
        let host = self.host_path(path)?;
        let mut entries = tokio::fs::read_dir(&host)
            .await
            .map_err(|e| Self::map_err(path, e))?;
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Self::map_err(path, e))?
        {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    async fn mkdir(&self, path: &Path) -> Result<(), BackendError> {
        self.check_writable()?;
        let host = self.host_path(path)?;
        tokio::fs::create_dir_all(&host)
            .await
            .map_err(|e| Self::map_err(path, e))
    }

    async fn rmdir(&self, path: &Path) -> Result<(), BackendError> {
        self.check_writable()?;
        let host = self.host_path(path)?;
        tokio::fs::remove_dir(&host)
            .await
            .map_err(|e| Self::map_err(path, e))
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<(), BackendError> {
        self.check_writable()?;
        let host_from = self.host_path(from)?;
        let host_to = self.host_path(to)?;
        tokio::fs::rename(&host_from, &host_to)
            .await
            .map_err(|e| Self::map_err(from, e))
    }

    async fn stat(&self, path: &Path) -> Result<FileStat, BackendError> {
        let host = self.host_path(path)?;
        let meta = tokio::fs::metadata(&host)
            .await
            .map_err(|e| Self::map_err(path, e))?;
        Ok(FileStat {
            size: meta.len(),
            mtime: meta.modified().map_err(|e| BackendError::Io(e.to_string()))?,
            is_dir: meta.is_dir(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path(), false);
        backend.open().await.unwrap();

        backend.write(Path::new("/a/b.txt"), b"hi").await.unwrap();
        assert_eq!(backend.read(Path::new("/a/b.txt")).await.unwrap(), b"hi");
        assert_eq!(backend.readdir(Path::new("/a")).await.unwrap(), ["b.txt"]);

        backend.unlink(Path::new("/a/b.txt")).await.unwrap();
        assert!(matches!(
            backend.read(Path::new("/a/b.txt")).await,
            Err(BackendError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_read_only_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path(), true);
        assert!(matches!(
            backend.write(Path::new("/x"), b"data").await,
            Err(BackendError::ReadOnly)
        ));
    }

    #[tokio::test]
    async fn test_traversal_rejected() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path(), false);
        assert!(backend.read(Path::new("/../etc/passwd")).await.is_err());
    }
}
