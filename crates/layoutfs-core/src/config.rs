//! Configuration types for LayoutFS Core

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One rule inside a mapping group.
///
/// A filter applies when `pattern` matches the workspace-relative real path
/// and none of `exclude_regexp` do. The virtual path is built as
/// `{to_virtual_dir}/{prepend}/{path without strip}`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FilterConfig {
    #[serde(rename = "match")]
    pub pattern: String,
    pub exclude_regexp: Vec<String>,
    pub to_virtual_dir: String,
    pub strip: String,
    pub prepend: String,
    pub readonly: bool,
}

/// Mapping group restricted to real paths under `from_actual_dir`
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MappingGroupConfig {
    pub from_actual_dir: String,
    pub exclude: Vec<String>,
    pub filter: Vec<FilterConfig>,
}

/// Kernel cache settings handed to the mount
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CachePolicy {
    pub attr_ttl_ms: u32,
    pub entry_ttl_ms: u32,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            attr_ttl_ms: 1000,
            entry_ttl_ms: 1000,
        }
    }
}

/// What the change watcher does when its queue is full
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// The notification thread waits until the consumer catches up.
    #[default]
    Block,
    /// The event is discarded and counted.
    Drop,
}

/// Change watcher settings
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WatcherPolicy {
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for WatcherPolicy {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            overflow: OverflowPolicy::Block,
        }
    }
}

/// Main LayoutFS configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LayoutConfig {
    /// Root of the build workspace; every real path is relative to it.
    pub workspace: PathBuf,
    /// Import path substituted into `prepend` templates.
    pub import_path: String,
    /// Global exclude list, matched as whole path segments.
    pub exclude: Vec<String>,
    /// Ordered mapping groups. The catch-all group is appended by the mapper.
    pub source_mapping: Vec<MappingGroupConfig>,
    pub cache: CachePolicy,
    pub watcher: WatcherPolicy,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from("."),
            import_path: String::new(),
            exclude: Vec::new(),
            source_mapping: Vec::new(),
            cache: CachePolicy::default(),
            watcher: WatcherPolicy::default(),
        }
    }
}

impl LayoutConfig {
    /// Stock rules for a Please workspace producing Go output under `plz-out/gen`.
    pub fn for_workspace(workspace: impl Into<PathBuf>, import_path: impl Into<String>) -> Self {
        Self {
            workspace: workspace.into(),
            import_path: import_path.into(),
            exclude: vec![".git".to_string()],
            source_mapping: vec![MappingGroupConfig {
                from_actual_dir: "plz-out/gen".to_string(),
                exclude: Vec::new(),
                filter: vec![
                    FilterConfig {
                        pattern: "plz-out/gen/third_party/go/pkg".to_string(),
                        to_virtual_dir: "pkg".to_string(),
                        strip: "plz-out/gen/third_party/go/pkg".to_string(),
                        readonly: true,
                        ..Default::default()
                    },
                    FilterConfig {
                        pattern: "plz-out/gen/third_party/go/src".to_string(),
                        to_virtual_dir: "src".to_string(),
                        strip: "plz-out/gen/third_party/go/src".to_string(),
                        ..Default::default()
                    },
                    FilterConfig {
                        pattern: r".*\.a$".to_string(),
                        exclude_regexp: vec!["^third_party/.*".to_string()],
                        to_virtual_dir: "pkg".to_string(),
                        strip: "plz-out/gen".to_string(),
                        prepend: "linux_amd64/{import-path}".to_string(),
                        readonly: true,
                    },
                    FilterConfig {
                        pattern: r".*\.pb.go$".to_string(),
                        exclude_regexp: vec!["^plz-out/gen/third_party/.*".to_string()],
                        to_virtual_dir: "src".to_string(),
                        strip: "plz-out/gen".to_string(),
                        prepend: "{import-path}".to_string(),
                        readonly: true,
                    },
                ],
            }],
            cache: CachePolicy::default(),
            watcher: WatcherPolicy::default(),
        }
    }

    /// Parse a configuration from its JSON form.
    pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }
}
