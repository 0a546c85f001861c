//! FUSE frontend over the mount table
//!
//! Implements `fuser::Filesystem`, translating inode-based callbacks into
//! path operations on [`MountTable`]. FUSE upcalls arrive on kernel-supplied
//! threads; async mount-table calls are bridged with a runtime handle.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use parking_lot::RwLock;
use tokio::runtime::Handle;

use common::storage::FileStat;

use crate::inode::InodeTable;
use crate::mount_table::{FsError, MountTable};

/// In-flight write buffer for an open file handle.
struct WriteBuffer {
    path: PathBuf,
    data: Vec<u8>,
    dirty: bool,
}

pub struct WildlandFs {
    rt: Handle,
    table: Arc<MountTable>,
    inodes: RwLock<InodeTable>,
    write_buffers: RwLock<HashMap<u64, WriteBuffer>>,
    next_fh: std::sync::atomic::AtomicU64,
}

impl WildlandFs {
    const ATTR_TTL: Duration = Duration::from_secs(1);
    const BLOCK_SIZE: u32 = 512;

    pub fn new(rt: Handle, table: Arc<MountTable>) -> Self {
        WildlandFs {
            rt,
            table,
            inodes: RwLock::new(InodeTable::new()),
            write_buffers: RwLock::new(HashMap::new()),
            next_fh: std::sync::atomic::AtomicU64::new(1),
        }
    }

    fn next_handle(&self) -> u64 {
        self.next_fh
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
    }

    fn path_of(&self, ino: u64) -> Option<PathBuf> {
        self.inodes.read().get_path(ino).map(Path::to_path_buf)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        let name = name.to_str()?;
        Some(self.path_of(parent)?.join(name))
    }

    fn make_attr(inode: u64, stat: &FileStat) -> FileAttr {
        let kind = if stat.is_dir {
            FileType::Directory
        } else {
            FileType::RegularFile
        };
        let mtime = if stat.mtime == SystemTime::UNIX_EPOCH {
            SystemTime::now()
        } else {
            stat.mtime
        };
        let perm = if stat.is_dir { 0o755 } else { 0o644 };

        FileAttr {
            ino: inode,
            size: stat.size,
            blocks: stat.size.div_ceil(Self::BLOCK_SIZE as u64),
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind,
            perm,
            nlink: 1,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            rdev: 0,
            blksize: Self::BLOCK_SIZE,
            flags: 0,
        }
    }

    fn stat_path(&self, path: &Path) -> Result<FileStat, FsError> {
        let table = self.table.clone();
        let path = path.to_path_buf();
        self.rt.block_on(async move { table.stat(&path).await })
    }

    fn flush_buffer(&self, fh: u64) -> Result<(), FsError> {
        let buffer = {
            let mut buffers = self.write_buffers.write();
            match buffers.get_mut(&fh) {
                Some(buffer) if buffer.dirty => {
                    buffer.dirty = false;
                    Some((buffer.path.clone(), buffer.data.clone()))
                }
                _ => None,
            }
        };
        if let Some((path, data)) = buffer {
            let table = self.table.clone();
            self.rt
                .block_on(async move { table.write(&path, &data).await })?;
        }
        Ok(())
    }
}

impl Filesystem for WildlandFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.stat_path(&path) {
            Ok(stat) => {
                let ino = self.inodes.write().get_or_create(&path);
                reply.entry(&Self::ATTR_TTL, &Self::make_attr(ino, &stat), 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.stat_path(&path) {
            Ok(stat) => reply.attr(&Self::ATTR_TTL, &Self::make_attr(ino, &stat)),
            Err(e) => reply.error(e.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        if let Some(new_size) = size {
            // an open write buffer absorbs the truncate
            let buffered = {
                let mut buffers = self.write_buffers.write();
                fh.and_then(|fh| buffers.get_mut(&fh)).map(|buffer| {
                    buffer.data.resize(new_size as usize, 0);
                    buffer.dirty = true;
                })
            };
            if buffered.is_none() {
                let table = self.table.clone();
                let target = path.clone();
                let result = self
                    .rt
                    .block_on(async move { table.truncate(&target, new_size).await });
                if let Err(e) = result {
                    reply.error(e.errno());
                    return;
                }
            }
        }

        match self.stat_path(&path) {
            Ok(stat) => reply.attr(&Self::ATTR_TTL, &Self::make_attr(ino, &stat)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        let table = self.table.clone();
        let list_path = path.clone();
        let entries = match self
            .rt
            .block_on(async move { table.list_dir(&list_path).await })
        {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };

        let mut all: Vec<(u64, FileType, String)> = Vec::with_capacity(entries.len() + 2);
        all.push((ino, FileType::Directory, ".".to_string()));
        let parent_ino = match path.parent() {
            Some(parent) => self.inodes.write().get_or_create(parent),
            None => InodeTable::ROOT_INODE,
        };
        all.push((parent_ino, FileType::Directory, "..".to_string()));

        for entry in entries {
            let entry_ino = self.inodes.write().get_or_create(&path.join(&entry.name));
            let kind = if entry.is_dir {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            all.push((entry_ino, kind, entry.name));
        }

        for (i, (ino, kind, name)) in all.into_iter().enumerate().skip(offset as usize) {
            if reply.add(ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        let write_access = flags & libc::O_ACCMODE != libc::O_RDONLY;
        let fh = self.next_handle();

        if write_access {
            let table = self.table.clone();
            let read_path = path.clone();
            let data = match self
                .rt
                .block_on(async move { table.read(&read_path).await })
            {
                Ok(data) => data,
                Err(ref e) if e.errno() == libc::ENOENT => Vec::new(),
                Err(e) => {
                    reply.error(e.errno());
                    return;
                }
            };
            self.write_buffers.write().insert(
                fh,
                WriteBuffer {
                    path,
                    data,
                    dirty: false,
                },
            );
        }

        reply.opened(fh, 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        // serve from the write buffer when one is open for this handle
        {
            let buffers = self.write_buffers.read();
            if let Some(buffer) = buffers.get(&fh) {
                let start = offset as usize;
                let end = (start + size as usize).min(buffer.data.len());
                reply.data(buffer.data.get(start..end).unwrap_or(&[]));
                return;
            }
        }

        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let table = self.table.clone();
        match self.rt.block_on(async move { table.read(&path).await }) {
            Ok(data) => {
                let start = offset as usize;
                let end = (start + size as usize).min(data.len());
                reply.data(data.get(start..end).unwrap_or(&[]));
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let mut buffers = self.write_buffers.write();
        let Some(buffer) = buffers.get_mut(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let end = offset as usize + data.len();
        if buffer.data.len() < end {
            buffer.data.resize(end, 0);
        }
        buffer.data[offset as usize..end].copy_from_slice(data);
        buffer.dirty = true;
        reply.written(data.len() as u32);
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        match self.flush_buffer(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let result = self.flush_buffer(fh);
        self.write_buffers.write().remove(&fh);
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };

        let table = self.table.clone();
        let create_path = path.clone();
        if let Err(e) = self
            .rt
            .block_on(async move { table.create(&create_path).await })
        {
            reply.error(e.errno());
            return;
        }

        let ino = self.inodes.write().get_or_create(&path);
        let fh = self.next_handle();
        self.write_buffers.write().insert(
            fh,
            WriteBuffer {
                path,
                data: Vec::new(),
                dirty: false,
            },
        );
        let stat = FileStat {
            size: 0,
            mtime: SystemTime::now(),
            is_dir: false,
        };
        reply.created(&Self::ATTR_TTL, &Self::make_attr(ino, &stat), 0, fh, 0);
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let table = self.table.clone();
        let mkdir_path = path.clone();
        match self
            .rt
            .block_on(async move { table.mkdir(&mkdir_path).await })
        {
            Ok(()) => {
                let ino = self.inodes.write().get_or_create(&path);
                let stat = FileStat {
                    size: 0,
                    mtime: SystemTime::now(),
                    is_dir: true,
                };
                reply.entry(&Self::ATTR_TTL, &Self::make_attr(ino, &stat), 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let table = self.table.clone();
        let unlink_path = path.clone();
        match self
            .rt
            .block_on(async move { table.unlink(&unlink_path).await })
        {
            Ok(()) => {
                self.inodes.write().remove_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let table = self.table.clone();
        let rmdir_path = path.clone();
        match self
            .rt
            .block_on(async move { table.rmdir(&rmdir_path).await })
        {
            Ok(()) => {
                self.inodes.write().remove_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(from), Some(to)) = (
            self.child_path(parent, name),
            self.child_path(newparent, newname),
        ) else {
            reply.error(libc::ENOENT);
            return;
        };
        let table = self.table.clone();
        let (rename_from, rename_to) = (from.clone(), to.clone());
        match self
            .rt
            .block_on(async move { table.rename(&rename_from, &rename_to).await })
        {
            Ok(()) => {
                self.inodes.write().rename(&from, &to);
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }
}
