//! Real filesystem access behind the virtual tree
//!
//! Every operation that touches the disk on behalf of the tree or the
//! protocol adapter goes through [`RealFs`], so tests can swap in a backend
//! that fails on demand.

use std::fs::{self, File, FileTimes, Permissions};
use std::io;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::types::{FileAttributes, OpenOptions};

/// Real filesystem operations used by LayoutFS
pub trait RealFs: Send + Sync {
    /// Attributes of `path` without following a final symlink.
    fn stat(&self, path: &Path) -> io::Result<FileAttributes>;
    fn open(&self, path: &Path, options: &OpenOptions) -> io::Result<File>;
    /// Create a new file with the given permission bits.
    fn create(&self, path: &Path, options: &OpenOptions, mode: u32) -> io::Result<File>;
    fn mkdir_all(&self, path: &Path) -> io::Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    /// Remove a file, symlink or empty directory.
    fn remove(&self, path: &Path) -> io::Result<()>;
    fn read_link(&self, path: &Path) -> io::Result<PathBuf>;
    fn set_len(&self, path: &Path, size: u64) -> io::Result<()>;
    fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()>;
    /// Set access and modification times; `None` leaves a time unchanged.
    fn set_times(&self, path: &Path, atime: Option<SystemTime>, mtime: Option<SystemTime>) -> io::Result<()>;
}

/// [`RealFs`] backed by the operating system
#[derive(Clone, Copy, Debug, Default)]
pub struct OsFs;

impl RealFs for OsFs {
    fn stat(&self, path: &Path) -> io::Result<FileAttributes> {
        fs::symlink_metadata(path).map(|m| FileAttributes::from_metadata(&m))
    }

    fn open(&self, path: &Path, options: &OpenOptions) -> io::Result<File> {
        options.to_std().open(path)
    }

    fn create(&self, path: &Path, options: &OpenOptions, mode: u32) -> io::Result<File> {
        let mut std_options = options.to_std();
        std_options.write(true).create(true).mode(mode);
        std_options.open(path)
    }

    fn mkdir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        if fs::symlink_metadata(path)?.is_dir() {
            fs::remove_dir(path)
        } else {
            fs::remove_file(path)
        }
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        fs::read_link(path)
    }

    fn set_len(&self, path: &Path, size: u64) -> io::Result<()> {
        fs::OpenOptions::new().write(true).open(path)?.set_len(size)
    }

    fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()> {
        fs::set_permissions(path, Permissions::from_mode(mode & 0o7777))
    }

    fn set_times(&self, path: &Path, atime: Option<SystemTime>, mtime: Option<SystemTime>) -> io::Result<()> {
        let mut times = FileTimes::new();
        if let Some(atime) = atime {
            times = times.set_accessed(atime);
        }
        if let Some(mtime) = mtime {
            times = times.set_modified(mtime);
        }
        File::open(path)?.set_times(times)
    }
}
