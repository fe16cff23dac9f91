//! Core type definitions for LayoutFS

use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Write permission bits for user, group and other.
pub const WRITE_BITS: u16 = 0o222;

/// Kind of entry behind a virtual node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
    Symlink,
}

/// File attributes as reported through the mount
#[derive(Clone, Debug, PartialEq)]
pub struct FileAttributes {
    pub kind: FileKind,
    /// Permission bits (lower 12 bits of the mode).
    pub perm: u16,
    pub size: u64,
    pub blocks: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl FileAttributes {
    /// Attributes of a directory that has no real backing.
    pub fn synthetic_dir() -> Self {
        Self {
            kind: FileKind::Directory,
            perm: 0o755,
            size: 0,
            blocks: 0,
            nlink: 2,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: 512,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
        }
    }

    /// Convert lstat-style metadata.
    pub fn from_metadata(metadata: &Metadata) -> Self {
        let file_type = metadata.file_type();
        let kind = if file_type.is_symlink() {
            FileKind::Symlink
        } else if file_type.is_dir() {
            FileKind::Directory
        } else {
            FileKind::File
        };

        Self {
            kind,
            perm: (metadata.mode() & 0o7777) as u16,
            size: metadata.size(),
            blocks: metadata.blocks(),
            nlink: metadata.nlink() as u32,
            uid: metadata.uid(),
            gid: metadata.gid(),
            rdev: metadata.rdev() as u32,
            blksize: metadata.blksize() as u32,
            atime: unix_time(metadata.atime(), metadata.atime_nsec()),
            mtime: unix_time(metadata.mtime(), metadata.mtime_nsec()),
            ctime: unix_time(metadata.ctime(), metadata.ctime_nsec()),
        }
    }

    /// Clear the write bits for user, group and other.
    pub fn without_write(mut self) -> Self {
        self.perm &= !WRITE_BITS;
        self
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

fn unix_time(secs: i64, nsecs: i64) -> SystemTime {
    if secs < 0 {
        return UNIX_EPOCH;
    }
    UNIX_EPOCH + Duration::new(secs as u64, nsecs.clamp(0, 999_999_999) as u32)
}

/// Directory entry information
#[derive(Clone, Debug, PartialEq)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileKind,
    pub perm: u16,
}

/// Requested access for opening a real file
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OpenOptions {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub truncate: bool,
    pub create: bool,
    pub create_new: bool,
}

impl OpenOptions {
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Default::default()
        }
    }

    /// Whether the request could modify the file.
    pub fn wants_write(&self) -> bool {
        self.write || self.append || self.truncate
    }

    pub(crate) fn to_std(&self) -> std::fs::OpenOptions {
        let mut options = std::fs::OpenOptions::new();
        options
            .read(self.read)
            .write(self.write)
            .append(self.append)
            .truncate(self.truncate)
            .create(self.create)
            .create_new(self.create_new);
        options
    }
}
