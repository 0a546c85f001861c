//! Inode ↔ virtual path mapping
//!
//! FUSE addresses files by inode; the mount table addresses them by path.
//! Inodes are handed out on first sight of a path and survive until the
//! path is unlinked or renamed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub struct InodeTable {
    path_to_inode: HashMap<PathBuf, u64>,
    inode_to_path: HashMap<u64, PathBuf>,
    next_inode: u64,
}

impl InodeTable {
    pub const ROOT_INODE: u64 = 1;

    pub fn new() -> Self {
        let mut table = InodeTable {
            path_to_inode: HashMap::new(),
            inode_to_path: HashMap::new(),
            next_inode: 2,
        };
        let root = PathBuf::from("/");
        table.path_to_inode.insert(root.clone(), Self::ROOT_INODE);
        table.inode_to_path.insert(Self::ROOT_INODE, root);
        table
    }

    pub fn get_or_create(&mut self, path: &Path) -> u64 {
        if let Some(&ino) = self.path_to_inode.get(path) {
            return ino;
        }
        let ino = self.next_inode;
        self.next_inode += 1;
        self.path_to_inode.insert(path.to_path_buf(), ino);
        self.inode_to_path.insert(ino, path.to_path_buf());
        ino
    }

    pub fn get_path(&self, inode: u64) -> Option<&Path> {
        self.inode_to_path.get(&inode).map(PathBuf::as_path)
    }

    pub fn remove_path(&mut self, path: &Path) {
        if let Some(ino) = self.path_to_inode.remove(path) {
            self.inode_to_path.remove(&ino);
        }
    }

    pub fn rename(&mut self, from: &Path, to: &Path) {
        if let Some(ino) = self.path_to_inode.remove(from) {
            self.path_to_inode.insert(to.to_path_buf(), ino);
            self.inode_to_path.insert(ino, to.to_path_buf());
        }
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_root_is_stable() {
        let mut table = InodeTable::new();
        assert_eq!(table.get_or_create(Path::new("/")), InodeTable::ROOT_INODE);
        assert_eq!(table.get_path(InodeTable::ROOT_INODE), Some(Path::new("/")));
    }

    #[test]
    fn test_rename_keeps_inode() {
        let mut table = InodeTable::new();
        let ino = table.get_or_create(Path::new("/a.txt"));
        table.rename(Path::new("/a.txt"), Path::new("/b.txt"));
        assert_eq!(table.get_or_create(Path::new("/b.txt")), ino);
        assert_ne!(table.get_or_create(Path::new("/a.txt")), ino);
    }
}
