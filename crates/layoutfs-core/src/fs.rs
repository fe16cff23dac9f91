//! Path-level filesystem operations over the virtual tree
//!
//! [`LayoutFs`] is what a mount adapter calls into. Every request reads the
//! tree's state at call time; real I/O is delegated to the [`RealFs`] backend.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, info, warn};

use crate::config::LayoutConfig;
use crate::error::{FsError, FsResult};
use crate::mapping::Mapper;
use crate::realfs::{OsFs, RealFs};
use crate::scan::{scan, ScanReport};
use crate::tree::{split_virtual, Node, VirtualTree};
use crate::types::{DirEntry, FileAttributes, OpenOptions};

/// The virtual workspace layout
pub struct LayoutFs {
    config: Arc<LayoutConfig>,
    mapper: Mapper,
    tree: VirtualTree,
}

impl LayoutFs {
    pub fn new(config: LayoutConfig) -> FsResult<Self> {
        Self::with_real_fs(config, Arc::new(OsFs))
    }

    /// Build the mapper and an empty tree on top of the given backend.
    pub fn with_real_fs(config: LayoutConfig, real_fs: Arc<dyn RealFs>) -> FsResult<Self> {
        let mapper = Mapper::new(&config)?;
        Ok(Self {
            config: Arc::new(config),
            mapper,
            tree: VirtualTree::new(real_fs),
        })
    }

    pub fn config(&self) -> &Arc<LayoutConfig> {
        &self.config
    }

    pub fn workspace(&self) -> &Path {
        &self.config.workspace
    }

    pub fn mapper(&self) -> &Mapper {
        &self.mapper
    }

    pub fn tree(&self) -> &VirtualTree {
        &self.tree
    }

    fn real_fs(&self) -> &Arc<dyn RealFs> {
        self.tree.real_fs()
    }

    /// Walk the whole workspace and track everything the rules map.
    pub fn populate(&self) -> ScanReport {
        info!("populating from {}", self.workspace().display());
        let report = self.rescan(self.workspace());
        info!(
            "tracked {} paths ({} excluded, {} unmatched, {} errors)",
            report.tracked, report.excluded, report.unmatched, report.errors
        );
        debug!("virtual tree:\n{}", self.tree);
        report
    }

    /// Walk the real subtree at `actual` and track every mapped entry.
    pub fn rescan(&self, actual: &Path) -> ScanReport {
        scan(self.workspace(), actual, &self.mapper, &self.tree)
    }

    pub fn getattr(&self, path: &str) -> FsResult<FileAttributes> {
        let node = self.tree.lookup(path)?;
        self.tree.attr(&node)
    }

    pub fn readdir(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        let node = self.tree.lookup(path)?;
        Ok(self.tree.children(&node))
    }

    /// Real path behind `path`. Directories with no real backing have none.
    pub fn resolve_actual(&self, path: &str) -> FsResult<PathBuf> {
        self.tree.lookup(path)?.actual().ok_or(FsError::NotFound)
    }

    /// Open the real file behind `path`. Read-only nodes are always opened
    /// for reading only, whatever was requested.
    pub fn open(&self, path: &str, options: &OpenOptions) -> FsResult<File> {
        let node = self.tree.lookup(path)?;
        let actual = node.actual().ok_or(FsError::InvalidArgument)?;

        let effective = if node.is_readonly() {
            if options.wants_write() {
                debug!("{} is read-only, opening for reading", path);
            }
            OpenOptions::read_only()
        } else {
            options.clone()
        };
        debug!("open {} => {} ({:?})", path, actual.display(), effective);

        Ok(self.real_fs().open(&actual, &effective)?)
    }

    /// Create a new file; its parent must exist and be backed by a real directory.
    pub fn create(&self, path: &str, options: &OpenOptions, mode: u32) -> FsResult<(File, FileAttributes)> {
        let (parent, remaining) = self.tree.match_path(path);
        let name = match remaining.as_slice() {
            [] => return Err(FsError::AlreadyExists),
            [name] => name,
            _ => return Err(FsError::InvalidArgument),
        };
        let parent_actual = writable_actual(&parent)?;

        let actual = parent_actual.join(name);
        debug!("create {} => {}", path, actual.display());
        let file = self.real_fs().create(&actual, options, mode)?;

        let node = self.tree.track(path, actual, false);
        let attr = self.tree.attr(&node)?;
        Ok((file, attr))
    }

    /// Create a directory and any missing real parents below the deepest
    /// tracked ancestor.
    pub fn mkdir(&self, path: &str, mode: u32) -> FsResult<FileAttributes> {
        let (parent, remaining) = self.tree.match_path(path);
        if remaining.is_empty() {
            return Err(FsError::AlreadyExists);
        }
        let parent_actual = writable_actual(&parent)?;

        let actual = remaining.iter().fold(parent_actual.clone(), |acc, s| acc.join(s));
        debug!("mkdir {} => {}", path, actual.display());
        self.real_fs().mkdir_all(&actual)?;
        self.real_fs().set_mode(&actual, mode)?;

        let segments = split_virtual(path);
        let base = segments.len() - remaining.len();
        let mut node = parent;
        for depth in 1..=remaining.len() {
            let virtual_path = segments[..base + depth].join("/");
            let real = remaining[..depth].iter().fold(parent_actual.clone(), |acc, s| acc.join(s));
            node = self.tree.track(&virtual_path, real, false);
        }
        self.tree.attr(&node)
    }

    /// Remove a file.
    pub fn unlink(&self, path: &str) -> FsResult<()> {
        let node = self.tree.lookup(path)?;
        if node.is_readonly() {
            return Err(FsError::ReadOnly);
        }
        self.tree.untrack(path)
    }

    /// Remove a directory. Emptiness is left to the real filesystem and
    /// tracked descendants are not removed one by one.
    pub fn rmdir(&self, path: &str) -> FsResult<()> {
        let node = self.tree.lookup(path)?;
        if node.is_readonly() {
            return Err(FsError::ReadOnly);
        }
        self.tree.untrack(path)
    }

    /// Move `from` to `to` on disk, then drop the source node and rescan the
    /// destination through the mapping rules.
    pub fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        let source = self.tree.lookup(from)?;
        if source.is_readonly() {
            return Err(FsError::ReadOnly);
        }
        let source_actual = source.actual().ok_or(FsError::InvalidArgument)?;

        let (target, remaining) = self.tree.match_path(to);
        let target_actual = writable_actual(&target)?;
        let dest = remaining.iter().fold(target_actual, |acc, s| acc.join(s));

        debug!("rename {} => {} ({} => {})", from, to, source_actual.display(), dest.display());
        self.real_fs().rename(&source_actual, &dest)?;

        self.tree.untrack(from)?;

        let report = self.rescan(&dest);
        if report.tracked == 0 {
            warn!("{} is not mapped by any rule after rename", dest.display());
        }
        Ok(())
    }

    pub fn readlink(&self, path: &str) -> FsResult<PathBuf> {
        let actual = self.resolve_actual(path)?;
        Ok(self.real_fs().read_link(&actual)?)
    }

    pub fn truncate(&self, path: &str, size: u64) -> FsResult<FileAttributes> {
        let node = self.tree.lookup(path)?;
        let actual = writable_actual(&node)?;
        self.real_fs().set_len(&actual, size)?;
        self.tree.attr(&node)
    }

    pub fn chmod(&self, path: &str, mode: u32) -> FsResult<FileAttributes> {
        let node = self.tree.lookup(path)?;
        let actual = writable_actual(&node)?;
        self.real_fs().set_mode(&actual, mode)?;
        self.tree.attr(&node)
    }

    /// Set access and modification times; `None` leaves a time unchanged.
    pub fn set_times(&self, path: &str, atime: Option<SystemTime>, mtime: Option<SystemTime>) -> FsResult<FileAttributes> {
        let node = self.tree.lookup(path)?;
        let actual = writable_actual(&node)?;
        self.real_fs().set_times(&actual, atime, mtime)?;
        self.tree.attr(&node)
    }

    /// Permission checks are left to the real filesystem; any tracked path is accessible.
    pub fn access(&self, path: &str) -> FsResult<()> {
        self.tree.lookup(path).map(|_| ())
    }
}

/// Real path of a node that may be modified.
fn writable_actual(node: &Node) -> FsResult<PathBuf> {
    if node.is_readonly() {
        return Err(FsError::ReadOnly);
    }
    node.actual().ok_or(FsError::ReadOnly)
}
