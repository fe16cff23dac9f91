//! LayoutFS FUSE adapter implementation
//!
//! Maps FUSE operations to LayoutFs calls. Once a file is open its I/O goes
//! straight to the real file descriptor.

#[cfg(not(feature = "fuse"))]
compile_error!("This module requires the 'fuse' feature to be enabled");

use crate::errno::{errno, flags_to_options};
use crate::inodes::{child_path, parent_path, InodeTable};
use layoutfs_core::{FileAttributes, FileKind, FsError, LayoutFs};
use fuser::{
    FileAttr, FileType, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use libc::{c_int, EBADF, EINVAL, ENOENT};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::File;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// LayoutFS FUSE filesystem adapter
pub struct LayoutFsFuse {
    fs: Arc<LayoutFs>,
    inodes: InodeTable,
    handles: HashMap<u64, File>,
    next_fh: u64,
    attr_ttl: Duration,
    entry_ttl: Duration,
}

impl LayoutFsFuse {
    pub fn new(fs: Arc<LayoutFs>) -> Self {
        let cache = fs.config().cache.clone();
        Self {
            fs,
            inodes: InodeTable::new(),
            handles: HashMap::new(),
            next_fh: 1,
            attr_ttl: Duration::from_millis(cache.attr_ttl_ms.into()),
            entry_ttl: Duration::from_millis(cache.entry_ttl_ms.into()),
        }
    }

    fn path(&self, ino: u64) -> Result<String, c_int> {
        self.inodes.path(ino).map(str::to_string).ok_or(ENOENT)
    }

    fn child(&self, parent: u64, name: &OsStr) -> Result<String, c_int> {
        let name = name.to_str().ok_or(EINVAL)?;
        Ok(child_path(&self.path(parent)?, name))
    }

    fn add_handle(&mut self, file: File) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        self.handles.insert(fh, file);
        fh
    }

    /// Convert FileAttributes to FUSE FileAttr
    fn attr_to_fuse(attr: &FileAttributes, ino: u64) -> FileAttr {
        FileAttr {
            ino,
            size: attr.size,
            blocks: attr.blocks,
            atime: attr.atime,
            mtime: attr.mtime,
            ctime: attr.ctime,
            crtime: attr.ctime,
            kind: file_type(attr.kind),
            perm: attr.perm,
            nlink: attr.nlink,
            uid: attr.uid,
            gid: attr.gid,
            rdev: attr.rdev,
            blksize: attr.blksize,
            flags: 0,
        }
    }

    fn reply_entry(&mut self, path: &str, attr: &FileAttributes, reply: ReplyEntry) {
        let ino = self.inodes.lookup(path);
        reply.entry(&self.entry_ttl, &Self::attr_to_fuse(attr, ino), 0);
    }
}

fn file_type(kind: FileKind) -> FileType {
    match kind {
        FileKind::File => FileType::RegularFile,
        FileKind::Directory => FileType::Directory,
        FileKind::Symlink => FileType::Symlink,
    }
}

fn time_of(time: TimeOrNow) -> SystemTime {
    match time {
        TimeOrNow::SpecificTime(time) => time,
        TimeOrNow::Now => SystemTime::now(),
    }
}

macro_rules! try_reply {
    ($reply:expr, $result:expr) => {
        match $result {
            Ok(value) => value,
            Err(code) => {
                $reply.error(code);
                return;
            }
        }
    };
}

fn fs_err(op: &str, path: &str, err: FsError) -> c_int {
    match err {
        FsError::NotFound | FsError::Unmatched => debug!("{} {}: {}", op, path, err),
        _ => warn!("{} {}: {}", op, path, err),
    }
    errno(&err)
}

impl fuser::Filesystem for LayoutFsFuse {
    fn init(&mut self, _req: &Request, _config: &mut KernelConfig) -> Result<(), c_int> {
        info!("LayoutFS mounted over {}", self.fs.workspace().display());
        Ok(())
    }

    fn destroy(&mut self) {
        info!("LayoutFS unmounted ({} open handles dropped)", self.handles.len());
        self.handles.clear();
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = try_reply!(reply, self.child(parent, name));
        let attr = try_reply!(reply, self.fs.getattr(&path).map_err(|e| fs_err("lookup", &path, e)));
        self.reply_entry(&path, &attr, reply);
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let path = try_reply!(reply, self.path(ino));
        let attr = try_reply!(reply, self.fs.getattr(&path).map_err(|e| fs_err("getattr", &path, e)));
        reply.attr(&self.attr_ttl, &Self::attr_to_fuse(&attr, ino));
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = try_reply!(reply, self.path(ino));

        if let Some(size) = size {
            try_reply!(reply, self.fs.truncate(&path, size).map_err(|e| fs_err("truncate", &path, e)));
        }
        if let Some(mode) = mode {
            try_reply!(reply, self.fs.chmod(&path, mode).map_err(|e| fs_err("chmod", &path, e)));
        }
        if atime.is_some() || mtime.is_some() {
            try_reply!(
                reply,
                self.fs
                    .set_times(&path, atime.map(time_of), mtime.map(time_of))
                    .map_err(|e| fs_err("utimens", &path, e))
            );
        }

        let attr = try_reply!(reply, self.fs.getattr(&path).map_err(|e| fs_err("setattr", &path, e)));
        reply.attr(&self.attr_ttl, &Self::attr_to_fuse(&attr, ino));
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        let path = try_reply!(reply, self.path(ino));
        let target = try_reply!(reply, self.fs.readlink(&path).map_err(|e| fs_err("readlink", &path, e)));
        reply.data(target.as_os_str().as_bytes());
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let path = try_reply!(reply, self.child(parent, name));
        let attr = try_reply!(
            reply,
            self.fs.mkdir(&path, mode & !umask & 0o7777).map_err(|e| fs_err("mkdir", &path, e))
        );
        self.reply_entry(&path, &attr, reply);
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = try_reply!(reply, self.child(parent, name));
        try_reply!(reply, self.fs.unlink(&path).map_err(|e| fs_err("unlink", &path, e)));
        self.inodes.forget_subtree(&path);
        reply.ok();
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = try_reply!(reply, self.child(parent, name));
        try_reply!(reply, self.fs.rmdir(&path).map_err(|e| fs_err("rmdir", &path, e)));
        self.inodes.forget_subtree(&path);
        reply.ok();
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        if flags != 0 {
            reply.error(EINVAL);
            return;
        }
        let from = try_reply!(reply, self.child(parent, name));
        let to = try_reply!(reply, self.child(newparent, newname));
        try_reply!(reply, self.fs.rename(&from, &to).map_err(|e| fs_err("rename", &from, e)));
        self.inodes.forget_subtree(&from);
        self.inodes.forget_subtree(&to);
        reply.ok();
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = try_reply!(reply, self.path(ino));
        let mut options = flags_to_options(flags);
        options.create = false;
        options.create_new = false;

        let file = try_reply!(reply, self.fs.open(&path, &options).map_err(|e| fs_err("open", &path, e)));
        let fh = self.add_handle(file);
        reply.opened(fh, 0);
    }

    fn read(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let file = try_reply!(reply, self.handles.get(&fh).ok_or(EBADF));
        let mut buf = vec![0u8; size as usize];
        let read = try_reply!(
            reply,
            file.read_at(&mut buf, offset.max(0) as u64).map_err(|e| errno(&FsError::Io(e)))
        );
        buf.truncate(read);
        reply.data(&buf);
    }

    fn write(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let file = try_reply!(reply, self.handles.get(&fh).ok_or(EBADF));
        try_reply!(
            reply,
            file.write_all_at(data, offset.max(0) as u64).map_err(|e| errno(&FsError::Io(e)))
        );
        reply.written(data.len() as u32);
    }

    fn flush(&mut self, _req: &Request, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        let file = try_reply!(reply, self.handles.get(&fh).ok_or(EBADF));
        let result = if datasync { file.sync_data() } else { file.sync_all() };
        try_reply!(reply, result.map_err(|e| errno(&FsError::Io(e))));
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.handles.remove(&fh);
        reply.ok();
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = try_reply!(reply, self.path(ino));
        let listing = try_reply!(reply, self.fs.readdir(&path).map_err(|e| fs_err("readdir", &path, e)));

        let parent_ino = self.inodes.ino_for(parent_path(&path));
        let mut entries = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        for entry in listing {
            let entry_ino = self.inodes.ino_for(&child_path(&path, &entry.name));
            entries.push((entry_ino, file_type(entry.kind), entry.name));
        }

        for (i, (entry_ino, kind, name)) in entries.into_iter().enumerate().skip(offset.max(0) as usize) {
            if reply.add(entry_ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn access(&mut self, _req: &Request, ino: u64, _mask: i32, reply: ReplyEmpty) {
        let path = try_reply!(reply, self.path(ino));
        try_reply!(reply, self.fs.access(&path).map_err(|e| fs_err("access", &path, e)));
        reply.ok();
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let path = try_reply!(reply, self.child(parent, name));
        let options = flags_to_options(flags);

        let (file, attr) = try_reply!(
            reply,
            self.fs
                .create(&path, &options, mode & !umask & 0o7777)
                .map_err(|e| fs_err("create", &path, e))
        );
        let ino = self.inodes.lookup(&path);
        let fh = self.add_handle(file);
        reply.created(&self.entry_ttl, &Self::attr_to_fuse(&attr, ino), 0, fh, 0);
    }
}
