//! Virtual directory tree holding the live virtual ↔ real association
//!
//! Each node guards only its own children with a reader/writer lock. Lookups
//! and mutations take those locks one node at a time while descending, so
//! work in unrelated subtrees never contends.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{FsError, FsResult};
use crate::realfs::RealFs;
use crate::types::{DirEntry, FileAttributes};

/// Top-level directories that exist for the lifetime of the tree.
pub const SYNTHETIC_DIRS: [&str; 3] = ["bin", "pkg", "src"];

/// Split a virtual path into its segments. Empty and `.` segments are dropped,
/// so `""`, `"."` and `"/"` all denote the root.
pub fn split_virtual(virtual_path: &str) -> Vec<&str> {
    virtual_path
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect()
}

/// One virtual path segment
pub struct Node {
    name: String,
    actual: RwLock<Option<PathBuf>>,
    readonly: bool,
    parent: RwLock<Weak<Node>>,
    children: RwLock<HashMap<String, Arc<Node>>>,
}

impl Node {
    fn new(name: &str, actual: Option<PathBuf>, readonly: bool, parent: Weak<Node>) -> Self {
        Self {
            name: name.to_string(),
            actual: RwLock::new(actual),
            readonly,
            parent: RwLock::new(parent),
            children: RwLock::new(HashMap::new()),
        }
    }

    /// The node's own segment (not the full virtual path).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Real path behind this node; `None` for synthetic directories.
    pub fn actual(&self) -> Option<PathBuf> {
        self.actual.read().clone()
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn parent(&self) -> Option<Arc<Node>> {
        self.parent.read().upgrade()
    }

    pub fn child(&self, name: &str) -> Option<Arc<Node>> {
        self.children.read().get(name).cloned()
    }

    pub fn child_names(&self) -> Vec<String> {
        self.children.read().keys().cloned().collect()
    }

    fn is_root(&self) -> bool {
        self.parent.read().strong_count() == 0 && self.name.is_empty()
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("actual", &self.actual())
            .field("readonly", &self.readonly)
            .field("children", &self.children.read().len())
            .finish()
    }
}

/// Path-indexed tree of virtual nodes
pub struct VirtualTree {
    root: Arc<Node>,
    real_fs: Arc<dyn RealFs>,
}

impl VirtualTree {
    /// Create an empty tree carrying the synthetic top-level directories.
    pub fn new(real_fs: Arc<dyn RealFs>) -> Self {
        let root = Arc::new(Node::new("", None, false, Weak::new()));
        {
            let mut children = root.children.write();
            for name in SYNTHETIC_DIRS {
                let node = Node::new(name, None, false, Arc::downgrade(&root));
                children.insert(name.to_string(), Arc::new(node));
            }
        }
        Self { root, real_fs }
    }

    pub fn root(&self) -> Arc<Node> {
        Arc::clone(&self.root)
    }

    /// Find the deepest existing node along `virtual_path`, returning it with
    /// the segments that were not found.
    pub fn match_path(&self, virtual_path: &str) -> (Arc<Node>, Vec<String>) {
        let segments = split_virtual(virtual_path);
        let mut current = Arc::clone(&self.root);

        for (idx, segment) in segments.iter().enumerate() {
            match current.child(segment) {
                Some(child) => current = child,
                None => {
                    let remaining = segments[idx..].iter().map(|s| s.to_string()).collect();
                    return (current, remaining);
                }
            }
        }
        (current, Vec::new())
    }

    /// Resolve `virtual_path` exactly, failing with `NotFound` on any remainder.
    pub fn lookup(&self, virtual_path: &str) -> FsResult<Arc<Node>> {
        let (node, remaining) = self.match_path(virtual_path);
        if remaining.is_empty() {
            Ok(node)
        } else {
            Err(FsError::NotFound)
        }
    }

    /// Register `virtual_path` as backed by `actual`.
    ///
    /// Missing ancestors are created as directories with no real backing and
    /// the leaf's read-only flag. Tracking an existing leaf updates its real
    /// path in place; if the read-only flag differs the leaf is replaced by a
    /// fresh node that keeps the old children.
    pub fn track(&self, virtual_path: &str, actual: impl Into<PathBuf>, readonly: bool) -> Arc<Node> {
        let actual = actual.into();
        debug!("track {} => {}", virtual_path, actual.display());

        let segments = split_virtual(virtual_path);
        let Some((leaf, ancestors)) = segments.split_last() else {
            return self.root();
        };

        let mut parent = Arc::clone(&self.root);
        for segment in ancestors {
            let next = match parent.child(segment) {
                Some(child) => child,
                None => {
                    let mut children = parent.children.write();
                    let child = children.entry(segment.to_string()).or_insert_with(|| {
                        Arc::new(Node::new(segment, None, readonly, Arc::downgrade(&parent)))
                    });
                    Arc::clone(child)
                }
            };
            parent = next;
        }

        let mut children = parent.children.write();
        let existing = children.get(*leaf).cloned();
        match existing {
            Some(existing) if parent.is_root() && SYNTHETIC_DIRS.contains(leaf) => {
                debug!("{} stays synthetic, not backing it with {}", leaf, actual.display());
                existing
            }
            Some(existing) if existing.readonly == readonly => {
                *existing.actual.write() = Some(actual);
                existing
            }
            Some(existing) => {
                let replacement = Arc::new(Node::new(
                    leaf,
                    Some(actual),
                    readonly,
                    Arc::downgrade(&parent),
                ));
                let adopted = std::mem::take(&mut *existing.children.write());
                for child in adopted.values() {
                    *child.parent.write() = Arc::downgrade(&replacement);
                }
                *replacement.children.write() = adopted;
                children.insert(leaf.to_string(), Arc::clone(&replacement));
                replacement
            }
            None => {
                let node = Arc::new(Node::new(
                    leaf,
                    Some(actual),
                    readonly,
                    Arc::downgrade(&parent),
                ));
                children.insert(leaf.to_string(), Arc::clone(&node));
                node
            }
        }
    }

    /// Delete the real resource behind `virtual_path` and drop its node.
    ///
    /// Files are unlinked and directories removed non-recursively; a real path
    /// that is already gone is not an error. Descendant nodes leave the tree
    /// with their parent without being deleted one by one.
    pub fn untrack(&self, virtual_path: &str) -> FsResult<()> {
        debug!("untrack {}", virtual_path);

        let node = self.lookup(virtual_path)?;
        if node.is_root() {
            return Err(FsError::InvalidArgument);
        }
        let parent = node.parent().ok_or(FsError::NotFound)?;
        if parent.is_root() && SYNTHETIC_DIRS.contains(&node.name()) {
            return Err(FsError::InvalidArgument);
        }

        if let Some(actual) = node.actual() {
            match self.real_fs.remove(&actual) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(FsError::Io(e)),
            }
        }

        parent.children.write().remove(node.name());
        Ok(())
    }

    /// Attributes of `node`, with write bits cleared on read-only nodes.
    pub fn attr(&self, node: &Node) -> FsResult<FileAttributes> {
        let attr = match node.actual() {
            None => FileAttributes::synthetic_dir(),
            Some(actual) => self.real_fs.stat(&actual)?,
        };
        if node.readonly {
            Ok(attr.without_write())
        } else {
            Ok(attr)
        }
    }

    /// Snapshot of `node`'s children, sorted by name. Children whose attributes
    /// cannot be read are left out.
    pub fn children(&self, node: &Node) -> Vec<DirEntry> {
        let mut snapshot: Vec<Arc<Node>> = node.children.read().values().cloned().collect();
        snapshot.sort_by(|a, b| a.name.cmp(&b.name));

        snapshot
            .into_iter()
            .filter_map(|child| match self.attr(&child) {
                Ok(attr) => Some(DirEntry {
                    name: child.name.clone(),
                    kind: attr.kind,
                    perm: attr.perm,
                }),
                Err(e) => {
                    warn!("skipping {} in listing: {}", child.name, e);
                    None
                }
            })
            .collect()
    }

    pub fn real_fs(&self) -> &Arc<dyn RealFs> {
        &self.real_fs
    }

    fn render(&self, node: &Node, prefix: &str, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = if node.name.is_empty() { "TOP" } else { node.name.as_str() };
        let kind = match self.attr(node) {
            Ok(attr) if !attr.is_dir() => "F",
            _ => "D",
        };
        let actual = node.actual().unwrap_or_default();
        writeln!(f, "{}[{}] {} => {}", prefix, kind, name, actual.display())?;

        let mut children: Vec<Arc<Node>> = node.children.read().values().cloned().collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        let prefix = format!("{}    ", prefix);
        for child in children {
            self.render(&child, &prefix, f)?;
        }
        Ok(())
    }
}

impl fmt::Display for VirtualTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render(&self.root, "", f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realfs::OsFs;
    use crate::types::{FileKind, OpenOptions};
    use std::fs::{self, File};
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::sync::mpsc;
    use std::thread;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn os_tree() -> VirtualTree {
        VirtualTree::new(Arc::new(OsFs))
    }

    /// Fails every removal, delegating everything else to the OS.
    struct StuckRemoval;

    impl RealFs for StuckRemoval {
        fn stat(&self, path: &Path) -> io::Result<FileAttributes> {
            OsFs.stat(path)
        }
        fn open(&self, path: &Path, options: &OpenOptions) -> io::Result<File> {
            OsFs.open(path, options)
        }
        fn create(&self, path: &Path, options: &OpenOptions, mode: u32) -> io::Result<File> {
            OsFs.create(path, options, mode)
        }
        fn mkdir_all(&self, path: &Path) -> io::Result<()> {
            OsFs.mkdir_all(path)
        }
        fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
            OsFs.rename(from, to)
        }
        fn remove(&self, _path: &Path) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "device busy"))
        }
        fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
            OsFs.read_link(path)
        }
        fn set_len(&self, path: &Path, size: u64) -> io::Result<()> {
            OsFs.set_len(path, size)
        }
        fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()> {
            OsFs.set_mode(path, mode)
        }
        fn set_times(&self, path: &Path, atime: Option<SystemTime>, mtime: Option<SystemTime>) -> io::Result<()> {
            OsFs.set_times(path, atime, mtime)
        }
    }

    #[test]
    fn test_new_tree_has_synthetic_dirs() {
        let tree = os_tree();
        let mut names = tree.root().child_names();
        names.sort();
        assert_eq!(names, vec!["bin", "pkg", "src"]);

        let (node, remaining) = tree.match_path("");
        assert!(node.is_root());
        assert!(remaining.is_empty());
        let (node, remaining) = tree.match_path("/");
        assert!(node.is_root());
        assert!(remaining.is_empty());
    }

    #[test]
    fn test_match_path_returns_deepest_node_and_rest() {
        let tree = os_tree();
        tree.track("src/example.com/repo/foo", "/work/foo", false);

        let (node, remaining) = tree.match_path("src/example.com/repo/foo/bar/baz.go");
        assert_eq!(node.name(), "foo");
        assert_eq!(remaining, vec!["bar".to_string(), "baz.go".to_string()]);

        let (node, remaining) = tree.match_path("pkg/linux_amd64");
        assert_eq!(node.name(), "pkg");
        assert_eq!(remaining, vec!["linux_amd64".to_string()]);
    }

    #[test]
    fn test_track_then_match() {
        let tree = os_tree();
        tree.track("pkg/linux_amd64/example.com/repo/foo/bar.a", "/work/plz-out/gen/foo/bar.a", true);

        let (node, remaining) = tree.match_path("pkg/linux_amd64/example.com/repo/foo/bar.a");
        assert!(remaining.is_empty());
        assert_eq!(node.actual(), Some(PathBuf::from("/work/plz-out/gen/foo/bar.a")));
        assert!(node.is_readonly());

        // Intermediate directories have no backing and carry the leaf's flag.
        let intermediate = tree.lookup("pkg/linux_amd64/example.com").unwrap();
        assert_eq!(intermediate.actual(), None);
        assert!(intermediate.is_readonly());
        assert_eq!(intermediate.parent().unwrap().name(), "linux_amd64");
    }

    #[test]
    fn test_retrack_updates_in_place() {
        let tree = os_tree();
        let first = tree.track("src/r/a.go", "/work/a.go", false);
        let second = tree.track("src/r/a.go", "/work/moved/a.go", false);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.actual(), Some(PathBuf::from("/work/moved/a.go")));
    }

    #[test]
    fn test_retrack_with_other_flag_keeps_children() {
        let tree = os_tree();
        tree.track("src/r/dir/child.go", "/work/dir/child.go", false);
        let dir = tree.track("src/r/dir", "/work/dir", true);

        assert!(dir.is_readonly());
        let child = tree.lookup("src/r/dir/child.go").unwrap();
        assert!(Arc::ptr_eq(&child.parent().unwrap(), &dir));
        assert!(!child.is_readonly());
    }

    #[test]
    fn test_untrack_removes_node_and_real_file() {
        let ws = TempDir::new().unwrap();
        let file = ws.path().join("a.go");
        fs::write(&file, "package a").unwrap();

        let tree = os_tree();
        tree.track("src/r/a.go", &file, false);
        tree.untrack("src/r/a.go").unwrap();

        let (_, remaining) = tree.match_path("src/r/a.go");
        assert!(!remaining.is_empty());
        assert!(!file.exists());
    }

    #[test]
    fn test_untrack_missing_path_is_not_found() {
        let tree = os_tree();
        assert!(matches!(tree.untrack("src/nothing"), Err(FsError::NotFound)));
    }

    #[test]
    fn test_untrack_tolerates_vanished_real_path() {
        let ws = TempDir::new().unwrap();
        let tree = os_tree();
        tree.track("src/r/gone.go", ws.path().join("gone.go"), false);

        tree.untrack("src/r/gone.go").unwrap();
        assert!(tree.lookup("src/r/gone.go").is_err());
    }

    #[test]
    fn test_untrack_refuses_root_and_synthetic_dirs() {
        let tree = os_tree();
        assert!(matches!(tree.untrack(""), Err(FsError::InvalidArgument)));
        for name in SYNTHETIC_DIRS {
            assert!(matches!(tree.untrack(name), Err(FsError::InvalidArgument)));
        }
        assert_eq!(tree.root().child_names().len(), 3);
    }

    #[test]
    fn test_track_leaves_synthetic_dirs_unbacked() {
        let tree = os_tree();
        let src = tree.root().child("src").unwrap();

        let tracked = tree.track("src", "/work/plz-out/gen/third_party/go/src", false);
        assert!(Arc::ptr_eq(&tracked, &src));
        assert_eq!(src.actual(), None);

        let pkg = tree.track("pkg", "/work/plz-out/gen/third_party/go/pkg", true);
        assert_eq!(pkg.actual(), None);
        assert!(!pkg.is_readonly());
        assert!(!tree.lookup("pkg").unwrap().is_readonly());

        // Deeper paths are tracked as usual.
        let nested = tree.track("src/github.com/dep", "/work/dep", false);
        assert_eq!(nested.actual(), Some(PathBuf::from("/work/dep")));
    }

    #[test]
    fn test_children_are_sorted_by_name() {
        let ws = TempDir::new().unwrap();
        let tree = os_tree();
        for name in ["zeta.go", "alpha.go", "mid.go", "beta.go"] {
            fs::write(ws.path().join(name), "package r").unwrap();
            tree.track(&format!("src/r/{}", name), ws.path().join(name), false);
        }

        let names: Vec<String> = tree
            .children(&tree.lookup("src/r").unwrap())
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["alpha.go", "beta.go", "mid.go", "zeta.go"]);
    }

    #[test]
    fn test_untrack_keeps_node_when_removal_fails() {
        let ws = TempDir::new().unwrap();
        let file = ws.path().join("a.go");
        fs::write(&file, "package a").unwrap();

        let tree = VirtualTree::new(Arc::new(StuckRemoval));
        tree.track("src/r/a.go", &file, false);

        assert!(matches!(tree.untrack("src/r/a.go"), Err(FsError::Io(_))));
        assert!(tree.lookup("src/r/a.go").is_ok());
        assert!(file.exists());
    }

    #[test]
    fn test_untrack_does_not_cascade_into_descendants() {
        let ws = TempDir::new().unwrap();
        let dir = ws.path().join("foo");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("a.go"), "package foo").unwrap();

        let tree = os_tree();
        tree.track("src/r/foo", &dir, false);
        tree.track("src/r/foo/a.go", dir.join("a.go"), false);
        // A second view of the same real file elsewhere in the tree.
        tree.track("src/mirror/a.go", dir.join("a.go"), true);

        // A non-empty real directory is never removed recursively.
        assert!(matches!(tree.untrack("src/r/foo"), Err(FsError::Io(_))));
        assert!(tree.lookup("src/r/foo/a.go").is_ok());

        // Once the real directory is empty the subtree leaves with its root.
        fs::remove_file(dir.join("a.go")).unwrap();
        tree.untrack("src/r/foo").unwrap();
        assert!(tree.lookup("src/r/foo/a.go").is_err());
        assert!(!dir.exists());

        // Other nodes backed by the removed paths stay until untracked themselves.
        let stale = tree.lookup("src/mirror/a.go").unwrap();
        assert!(tree.attr(&stale).is_err());
        let mirror = tree.lookup("src/mirror").unwrap();
        assert!(tree.children(&mirror).is_empty());
    }

    #[test]
    fn test_attr_masks_write_bits_for_readonly() {
        let ws = TempDir::new().unwrap();
        let file = ws.path().join("bar.a");
        fs::write(&file, "archive").unwrap();
        fs::set_permissions(&file, fs::Permissions::from_mode(0o666)).unwrap();

        let tree = os_tree();
        let ro = tree.track("pkg/bar.a", &file, true);
        let rw = tree.track("src/bar.a", &file, false);

        assert_eq!(tree.attr(&ro).unwrap().perm, 0o444);
        assert_eq!(tree.attr(&rw).unwrap().perm, 0o666);

        fs::set_permissions(&file, fs::Permissions::from_mode(0o400)).unwrap();
        assert_eq!(tree.attr(&ro).unwrap().perm, 0o400);
        assert_eq!(tree.attr(&rw).unwrap().perm, 0o400);
    }

    #[test]
    fn test_attr_of_synthetic_dir() {
        let tree = os_tree();
        tree.track("pkg/linux_amd64/x.a", "/nonexistent/x.a", true);

        let attr = tree.attr(&tree.lookup("pkg").unwrap()).unwrap();
        assert_eq!(attr.kind, FileKind::Directory);
        assert_eq!(attr.perm, 0o755);

        let attr = tree.attr(&tree.lookup("pkg/linux_amd64").unwrap()).unwrap();
        assert_eq!(attr.perm, 0o555);
    }

    #[test]
    fn test_children_skips_unreadable_entries() {
        let ws = TempDir::new().unwrap();
        fs::write(ws.path().join("a.go"), "package a").unwrap();

        let tree = os_tree();
        tree.track("src/r/a.go", ws.path().join("a.go"), false);
        tree.track("src/r/missing.go", ws.path().join("missing.go"), false);

        let entries = tree.children(&tree.lookup("src/r").unwrap());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a.go");
        assert_eq!(entries[0].kind, FileKind::File);
    }

    #[test]
    fn test_display_renders_tree() {
        let tree = os_tree();
        tree.track("pkg/x.a", "/nonexistent/x.a", true);

        let rendered = tree.to_string();
        assert!(rendered.starts_with("[D] TOP => \n"));
        assert!(rendered.contains("    [D] pkg => \n"));
        assert!(rendered.contains("        [D] x.a => /nonexistent/x.a\n"));
    }

    #[test]
    fn test_disjoint_subtrees_do_not_block_each_other() {
        let tree = Arc::new(os_tree());
        let a = tree.track("src/a", "/work/a", false);
        tree.track("src/b", "/work/b", false);

        // Hold src/a's children lock for the whole test; src/b must stay writable.
        let guard = a.children.write();

        let (tx, rx) = mpsc::channel();
        let worker = {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                for i in 0..100 {
                    tree.track(&format!("src/b/pkg{}/f.go", i), format!("/work/b/pkg{}/f.go", i), false);
                }
                tx.send(()).unwrap();
            })
        };

        rx.recv_timeout(Duration::from_secs(10))
            .expect("tracking under src/b blocked on src/a");
        drop(guard);
        worker.join().unwrap();

        assert_eq!(tree.lookup("src/b").unwrap().child_names().len(), 100);
    }

    #[test]
    fn test_concurrent_track_in_disjoint_subtrees() {
        let tree = Arc::new(os_tree());
        let handles: Vec<_> = ["a", "b", "c", "d"]
            .into_iter()
            .map(|dir| {
                let tree = Arc::clone(&tree);
                thread::spawn(move || {
                    for i in 0..200 {
                        tree.track(
                            &format!("src/{}/sub{}/f{}.go", dir, i % 7, i),
                            format!("/work/{}/f{}.go", dir, i),
                            false,
                        );
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for dir in ["a", "b", "c", "d"] {
            let node = tree.lookup(&format!("src/{}", dir)).unwrap();
            assert_eq!(node.child_names().len(), 7);
            for i in 0..200 {
                assert!(tree.lookup(&format!("src/{}/sub{}/f{}.go", dir, i % 7, i)).is_ok());
            }
        }
    }
}
