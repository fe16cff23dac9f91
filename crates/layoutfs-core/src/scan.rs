//! Real-directory walks feeding the virtual tree

use std::path::{Component, Path};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::mapping::{MapOutcome, Mapper};
use crate::tree::VirtualTree;

/// Counters from one walk
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub tracked: usize,
    pub excluded: usize,
    pub unmatched: usize,
    pub errors: usize,
}

/// `path` relative to `workspace` as a `/`-separated string, `.` for the
/// workspace itself. `None` when `path` lies outside the workspace.
pub fn workspace_relative(workspace: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(workspace).ok()?;
    let mut segments = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(segment) => segments.push(segment.to_string_lossy()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if segments.is_empty() {
        Some(".".to_string())
    } else {
        Some(segments.join("/"))
    }
}

/// Walk the real tree rooted at `start` (inside `workspace`) and track every
/// mapped entry. Excluded directories are not descended into; walk errors are
/// logged and counted.
pub fn scan(workspace: &Path, start: &Path, mapper: &Mapper, tree: &VirtualTree) -> ScanReport {
    let mut report = ScanReport::default();
    let mut walker = WalkDir::new(start).follow_links(false).into_iter();

    while let Some(entry) = walker.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("walk error under {}: {}", start.display(), e);
                report.errors += 1;
                continue;
            }
        };

        let Some(relative) = workspace_relative(workspace, entry.path()) else {
            warn!("{} is outside {}", entry.path().display(), workspace.display());
            report.errors += 1;
            continue;
        };

        match mapper.map(&relative) {
            MapOutcome::Excluded => {
                debug!("excluded {}", relative);
                report.excluded += 1;
                if entry.file_type().is_dir() {
                    walker.skip_current_dir();
                }
            }
            MapOutcome::Unmatched => report.unmatched += 1,
            MapOutcome::Matched(mapping) => {
                tree.track(&mapping.virtual_path, entry.path(), mapping.readonly);
                report.tracked += 1;
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LayoutConfig;
    use crate::realfs::OsFs;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_workspace_relative() {
        let ws = Path::new("/work/repo");
        assert_eq!(workspace_relative(ws, ws).as_deref(), Some("."));
        assert_eq!(workspace_relative(ws, Path::new("/work/repo/a/b.go")).as_deref(), Some("a/b.go"));
        assert_eq!(workspace_relative(ws, Path::new("/work/other")), None);
        assert_eq!(workspace_relative(ws, Path::new("/work/repo/../x")), None);
    }

    #[test]
    fn test_scan_tracks_sources_and_prunes_excludes() {
        let dir = TempDir::new().unwrap();
        let ws = dir.path();
        fs::create_dir_all(ws.join("foo")).unwrap();
        fs::write(ws.join("foo/x.go"), "package foo").unwrap();
        fs::create_dir_all(ws.join(".git/objects")).unwrap();
        fs::write(ws.join(".git/HEAD"), "ref").unwrap();
        fs::create_dir_all(ws.join("plz-out/gen/foo")).unwrap();
        fs::write(ws.join("plz-out/gen/foo/foo.a"), "!<arch>").unwrap();
        fs::write(ws.join("plz-out/gen/foo/foo.go"), "package foo").unwrap();

        let config = LayoutConfig::for_workspace(ws, "example.com/repo");
        let mapper = Mapper::new(&config).unwrap();
        let tree = VirtualTree::new(Arc::new(OsFs));

        let report = scan(ws, ws, &mapper, &tree);

        let root = tree.lookup("src/example.com/repo").unwrap();
        assert_eq!(root.actual().as_deref(), Some(ws));
        let file = tree.lookup("src/example.com/repo/foo/x.go").unwrap();
        assert_eq!(file.actual(), Some(ws.join("foo/x.go")));
        let archive = tree.lookup("pkg/linux_amd64/example.com/repo/foo/foo.a").unwrap();
        assert!(archive.is_readonly());

        assert!(tree.lookup("src/example.com/repo/.git").is_err());
        assert!(tree.lookup("src/example.com/repo/plz-out").is_err());
        // only the .git directory itself is visited
        assert_eq!(report.excluded, 1);
        assert!(report.unmatched >= 4);
        assert_eq!(report.errors, 0);
    }

    #[test]
    fn test_scan_subtree() {
        let dir = TempDir::new().unwrap();
        let ws = dir.path();
        fs::create_dir_all(ws.join("a/b")).unwrap();
        fs::write(ws.join("a/b/c.go"), "package b").unwrap();
        fs::write(ws.join("top.go"), "package top").unwrap();

        let config = LayoutConfig::for_workspace(ws, "example.com/repo");
        let mapper = Mapper::new(&config).unwrap();
        let tree = VirtualTree::new(Arc::new(OsFs));

        let report = scan(ws, &ws.join("a"), &mapper, &tree);
        assert_eq!(report.tracked, 3);
        assert!(tree.lookup("src/example.com/repo/a/b/c.go").is_ok());
        assert!(tree.lookup("src/example.com/repo/top.go").is_err());
    }

    #[test]
    fn test_scan_missing_start_is_logged() {
        let dir = TempDir::new().unwrap();
        let config = LayoutConfig::for_workspace(dir.path(), "example.com/repo");
        let mapper = Mapper::new(&config).unwrap();
        let tree = VirtualTree::new(Arc::new(OsFs));

        let report = scan(dir.path(), &dir.path().join("gone"), &mapper, &tree);
        assert_eq!(report.tracked, 0);
        assert_eq!(report.errors, 1);
    }
}
