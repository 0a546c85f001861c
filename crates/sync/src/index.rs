//! File indexes and difference computation
//!
//! Both sides of a job are reduced to a map `path → (content hash, mtime)`.
//! The hash is BLAKE3 over the file bytes, so two sides agree exactly when
//! their index maps agree. Differences become [`SyncAction`]s; scan-time
//! diffs never delete (a file missing on one side is re-created from the
//! other), deletes only happen on watcher evidence.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use common::storage::{walk_files, with_timeout, BackendError, StorageBackend};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub hash: String,
    pub mtime: SystemTime,
    pub size: u64,
}

/// Index of one side: path → content hash + mtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileIndex(pub BTreeMap<PathBuf, FileMeta>);

impl FileIndex {
    /// Scan a backend into an index. Files that vanish mid-scan are
    /// skipped.
    pub async fn scan(backend: &dyn StorageBackend) -> Result<Self, BackendError> {
        let mut index = BTreeMap::new();
        for path in walk_files(backend, Path::new("/")).await? {
            let stat = match with_timeout(backend.stat(&path)).await {
                Ok(stat) => stat,
                Err(BackendError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            let data = match with_timeout(backend.read(&path)).await {
                Ok(data) => data,
                Err(BackendError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            index.insert(
                path,
                FileMeta {
                    hash: blake3::hash(&data).to_hex().to_string(),
                    mtime: stat.mtime,
                    size: stat.size,
                },
            );
        }
        Ok(FileIndex(index))
    }

    /// The convergence check: do both sides hold identical content?
    pub fn content_map(&self) -> BTreeMap<&Path, &str> {
        self.0
            .iter()
            .map(|(path, meta)| (path.as_path(), meta.hash.as_str()))
            .collect()
    }
}

/// Which side a file travels to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// source → target
    ToTarget,
    /// target → source
    ToSource,
}

/// One unit of replication work, always about exactly one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    Copy { path: PathBuf, direction: Direction },
    Delete { path: PathBuf, direction: Direction },
}

impl SyncAction {
    pub fn path(&self) -> &Path {
        match self {
            SyncAction::Copy { path, .. } | SyncAction::Delete { path, .. } => path,
        }
    }
}

/// A conflict observed while diffing (kept on the job, visible through
/// `job-state`). Resolution is last-writer-wins; the record is for the
/// operator.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Conflict {
    pub path: PathBuf,
    pub reason: String,
}

/// Compute scan-time actions. No deletes: absence on one side re-creates
/// from the other, which keeps a startup scan from destroying data.
pub fn diff(
    source: &FileIndex,
    target: &FileIndex,
    unidirectional: bool,
) -> (Vec<SyncAction>, Vec<Conflict>) {
    let mut actions = Vec::new();
    let mut conflicts = Vec::new();

    for (path, source_meta) in &source.0 {
        match target.0.get(path) {
            None => actions.push(SyncAction::Copy {
                path: path.clone(),
                direction: Direction::ToTarget,
            }),
            Some(target_meta) if target_meta.hash == source_meta.hash => {}
            Some(target_meta) => {
                let direction = match resolve_writer(source_meta, target_meta) {
                    Direction::ToTarget => Direction::ToTarget,
                    Direction::ToSource if unidirectional => {
                        // source always wins a one-way job
                        Direction::ToTarget
                    }
                    Direction::ToSource => Direction::ToSource,
                };
                conflicts.push(Conflict {
                    path: path.clone(),
                    reason: format!(
                        "both sides modified; keeping {}",
                        match direction {
                            Direction::ToTarget => "source",
                            Direction::ToSource => "target",
                        }
                    ),
                });
                actions.push(SyncAction::Copy {
                    path: path.clone(),
                    direction,
                });
            }
        }
    }

    for path in target.0.keys() {
        if !source.0.contains_key(path) && !unidirectional {
            actions.push(SyncAction::Copy {
                path: path.clone(),
                direction: Direction::ToSource,
            });
        }
    }

    (actions, conflicts)
}

/// Last-writer-wins by mtime; ties break on lexicographic hash order (the
/// greater hash wins, so both sides pick the same winner).
fn resolve_writer(source: &FileMeta, target: &FileMeta) -> Direction {
    match source.mtime.cmp(&target.mtime) {
        std::cmp::Ordering::Greater => Direction::ToTarget,
        std::cmp::Ordering::Less => Direction::ToSource,
        std::cmp::Ordering::Equal => {
            if source.hash >= target.hash {
                Direction::ToTarget
            } else {
                Direction::ToSource
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    fn meta(hash: &str, mtime_offset: u64) -> FileMeta {
        FileMeta {
            hash: hash.to_string(),
            mtime: SystemTime::UNIX_EPOCH + Duration::from_secs(mtime_offset),
            size: 1,
        }
    }

    fn index(entries: &[(&str, FileMeta)]) -> FileIndex {
        FileIndex(
            entries
                .iter()
                .map(|(path, meta)| (PathBuf::from(path), meta.clone()))
                .collect(),
        )
    }

    #[test]
    fn test_missing_files_are_recreated_not_deleted() {
        let source = index(&[("/only-src", meta("a", 1))]);
        let target = index(&[("/only-tgt", meta("b", 1))]);

        let (actions, conflicts) = diff(&source, &target, false);
        assert!(conflicts.is_empty());
        assert_eq!(
            actions,
            vec![
                SyncAction::Copy {
                    path: "/only-src".into(),
                    direction: Direction::ToTarget
                },
                SyncAction::Copy {
                    path: "/only-tgt".into(),
                    direction: Direction::ToSource
                },
            ]
        );
    }

    #[test]
    fn test_newer_mtime_wins() {
        let source = index(&[("/x", meta("a", 10))]);
        let target = index(&[("/x", meta("b", 20))]);

        let (actions, conflicts) = diff(&source, &target, false);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(
            actions,
            vec![SyncAction::Copy {
                path: "/x".into(),
                direction: Direction::ToSource
            }]
        );
    }

    #[test]
    fn test_mtime_tie_breaks_on_hash() {
        let source = index(&[("/x", meta("bbb", 10))]);
        let target = index(&[("/x", meta("aaa", 10))]);
        let (actions, _) = diff(&source, &target, false);
        assert_eq!(
            actions,
            vec![SyncAction::Copy {
                path: "/x".into(),
                direction: Direction::ToTarget
            }]
        );
    }

    #[test]
    fn test_unidirectional_never_writes_source() {
        let source = index(&[("/x", meta("a", 10))]);
        let target = index(&[("/x", meta("b", 20)), ("/extra", meta("c", 5))]);

        let (actions, _) = diff(&source, &target, true);
        assert_eq!(
            actions,
            vec![SyncAction::Copy {
                path: "/x".into(),
                direction: Direction::ToTarget
            }]
        );
    }
}
