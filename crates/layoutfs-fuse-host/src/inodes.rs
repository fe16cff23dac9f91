//! Inode numbers for virtual paths
//!
//! The kernel addresses entries by inode while the layout is addressed by
//! virtual path. Numbers are handed out on first use and stay stable until
//! the path is removed or renamed away, or the kernel forgets every lookup
//! it was given for it. Numbers that only ever appeared in a directory
//! listing carry no lookups and stay until their path goes away.

use std::collections::HashMap;

/// Inode of the mount root (the empty virtual path).
pub const ROOT_INO: u64 = 1;

/// Join a virtual directory path and an entry name.
pub fn child_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Virtual path of the directory containing `path`.
pub fn parent_path(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(parent, _)| parent)
}

#[derive(Debug)]
struct Entry {
    path: String,
    lookups: u64,
}

#[derive(Debug)]
pub struct InodeTable {
    entries: HashMap<u64, Entry>,
    inos: HashMap<String, u64>,
    next: u64,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    pub fn new() -> Self {
        let mut table = Self {
            entries: HashMap::new(),
            inos: HashMap::new(),
            next: ROOT_INO + 1,
        };
        table.entries.insert(
            ROOT_INO,
            Entry {
                path: String::new(),
                lookups: 0,
            },
        );
        table.inos.insert(String::new(), ROOT_INO);
        table
    }

    pub fn path(&self, ino: u64) -> Option<&str> {
        self.entries.get(&ino).map(|entry| entry.path.as_str())
    }

    /// Inode for `path`, allocating one on first use. Does not count as a
    /// lookup.
    pub fn ino_for(&mut self, path: &str) -> u64 {
        if let Some(ino) = self.inos.get(path) {
            return *ino;
        }
        let ino = self.next;
        self.next += 1;
        self.entries.insert(
            ino,
            Entry {
                path: path.to_string(),
                lookups: 0,
            },
        );
        self.inos.insert(path.to_string(), ino);
        ino
    }

    /// Inode for `path` handed to the kernel in an entry reply.
    pub fn lookup(&mut self, path: &str) -> u64 {
        let ino = self.ino_for(path);
        if let Some(entry) = self.entries.get_mut(&ino) {
            entry.lookups += 1;
        }
        ino
    }

    /// The kernel dropped `nlookup` references to `ino`. The number is
    /// released once none remain. The root is never released.
    pub fn forget(&mut self, ino: u64, nlookup: u64) {
        let Some(entry) = self.entries.get_mut(&ino) else {
            return;
        };
        entry.lookups = entry.lookups.saturating_sub(nlookup);
        if entry.lookups == 0 && ino != ROOT_INO {
            if let Some(entry) = self.entries.remove(&ino) {
                self.inos.remove(&entry.path);
            }
        }
    }

    /// Drop `path` and everything below it. The root is never dropped.
    pub fn forget_subtree(&mut self, path: &str) {
        if path.is_empty() {
            return;
        }
        let prefix = format!("{}/", path);
        let stale: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| e.path == path || e.path.starts_with(&prefix))
            .map(|(ino, _)| *ino)
            .collect();
        for ino in stale {
            if let Some(entry) = self.entries.remove(&ino) {
                self.inos.remove(&entry.path);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        assert_eq!(child_path("", "src"), "src");
        assert_eq!(child_path("src/example.com", "repo"), "src/example.com/repo");
        assert_eq!(parent_path("src/example.com/repo"), "src/example.com");
        assert_eq!(parent_path("src"), "");
        assert_eq!(parent_path(""), "");
    }

    #[test]
    fn test_allocation_is_stable() {
        let mut table = InodeTable::new();
        assert_eq!(table.path(ROOT_INO), Some(""));
        assert_eq!(table.ino_for(""), ROOT_INO);

        let src = table.ino_for("src");
        let pkg = table.ino_for("pkg");
        assert_ne!(src, pkg);
        assert_ne!(src, ROOT_INO);
        assert_eq!(table.ino_for("src"), src);
        assert_eq!(table.path(pkg), Some("pkg"));
    }

    #[test]
    fn test_forget_subtree() {
        let mut table = InodeTable::new();
        let a = table.ino_for("src/a");
        let file = table.ino_for("src/a/x.go");
        let sibling = table.ino_for("src/ab");

        table.forget_subtree("src/a");

        assert_eq!(table.path(a), None);
        assert_eq!(table.path(file), None);
        assert_eq!(table.path(sibling), Some("src/ab"));
        // a re-created path gets a fresh number
        assert_ne!(table.ino_for("src/a"), a);

        table.forget_subtree("");
        assert_eq!(table.path(ROOT_INO), Some(""));
        assert!(!table.is_empty());
    }

    #[test]
    fn test_forget_releases_after_last_lookup() {
        let mut table = InodeTable::new();
        let ino = table.lookup("src/a.go");
        assert_eq!(table.lookup("src/a.go"), ino);

        table.forget(ino, 1);
        assert_eq!(table.path(ino), Some("src/a.go"));
        table.forget(ino, 1);
        assert_eq!(table.path(ino), None);
        assert_eq!(table.len(), 1);

        // unknown numbers and the root are ignored
        table.forget(ino, 1);
        table.forget(ROOT_INO, 5);
        assert_eq!(table.path(ROOT_INO), Some(""));
    }

    #[test]
    fn test_forget_saturates() {
        let mut table = InodeTable::new();
        let listed = table.ino_for("src/b.go");
        let ino = table.lookup("src/b.go");
        assert_eq!(listed, ino);

        table.forget(ino, 3);
        assert_eq!(table.path(ino), None);
        assert_ne!(table.lookup("src/b.go"), ino);
    }
}
