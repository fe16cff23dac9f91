//! Rule-based mapping from real workspace paths to virtual paths
//!
//! Evaluation is first-match-wins at every stage: the global exclude list,
//! then mapping groups in declared order, then each group's filters in
//! declared order. A catch-all group is always evaluated last.

use std::path::Path;

use regex::Regex;

use crate::config::{FilterConfig, LayoutConfig, MappingGroupConfig};
use crate::error::{FsError, FsResult};

/// Virtual directory the catch-all group maps into.
pub const DEFAULT_VIRTUAL_DIR: &str = "src";

/// Segments the catch-all group declines, so build output never lands in `src`.
pub const CATCH_ALL_EXCLUDES: [&str; 1] = ["plz-out"];

const IMPORT_PATH_PLACEHOLDERS: [&str; 2] = ["{import-path}", "{{.GoImportPath}}"];

/// Result status of a mapping, without the payload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchStatus {
    Excluded,
    Matched,
    Unmatched,
}

/// Where a real path appears in the virtual tree
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub virtual_path: String,
    pub readonly: bool,
}

/// Outcome of running a real path through the rules
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MapOutcome {
    /// A global exclude entry names a segment of the path; walks prune here.
    Excluded,
    Matched(Mapping),
    /// Every group declined the path.
    Unmatched,
}

impl MapOutcome {
    pub fn status(&self) -> MatchStatus {
        match self {
            MapOutcome::Excluded => MatchStatus::Excluded,
            MapOutcome::Matched(_) => MatchStatus::Matched,
            MapOutcome::Unmatched => MatchStatus::Unmatched,
        }
    }

    pub fn into_result(self) -> FsResult<Mapping> {
        match self {
            MapOutcome::Matched(mapping) => Ok(mapping),
            MapOutcome::Excluded | MapOutcome::Unmatched => Err(FsError::Unmatched),
        }
    }
}

/// True when `dir` (one or more segments) appears as a run of whole segments in `path`.
pub fn contains_dir(path: &str, dir: &str) -> bool {
    let needle: Vec<&str> = dir.split('/').filter(|s| !s.is_empty()).collect();
    if needle.is_empty() {
        return false;
    }
    let haystack: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    haystack.windows(needle.len()).any(|window| window == needle.as_slice())
}

/// `path` relative to `prefix`, compared segment by segment. `None` when
/// `path` is not under `prefix`.
pub fn relative_to(path: &str, prefix: &str) -> Option<String> {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return Some(path.to_string());
    }
    if path == prefix {
        return Some(".".to_string());
    }
    path.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('/'))
        .map(str::to_string)
}

/// Join virtual path parts, dropping empty and `.` segments.
pub fn join_virtual(parts: &[&str]) -> String {
    parts
        .iter()
        .flat_map(|part| part.split('/'))
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Expand the import-path placeholder in a prepend template.
pub fn render_prepend(template: &str, import_path: &str) -> String {
    IMPORT_PATH_PLACEHOLDERS
        .iter()
        .fold(template.to_string(), |rendered, placeholder| {
            rendered.replace(placeholder, import_path)
        })
}

fn compile(pattern: &str) -> FsResult<Regex> {
    Regex::new(pattern).map_err(|source| FsError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

struct Filter {
    pattern: Regex,
    excludes: Vec<Regex>,
    to_virtual_dir: String,
    strip: String,
    prepend: String,
    readonly: bool,
}

impl Filter {
    fn new(config: &FilterConfig, import_path: &str) -> FsResult<Self> {
        Ok(Self {
            pattern: compile(&config.pattern)?,
            excludes: config
                .exclude_regexp
                .iter()
                .map(|e| compile(e))
                .collect::<FsResult<_>>()?,
            to_virtual_dir: config.to_virtual_dir.clone(),
            strip: config.strip.clone(),
            prepend: render_prepend(&config.prepend, import_path),
            readonly: config.readonly,
        })
    }

    fn map(&self, actual: &str) -> Option<Mapping> {
        if !self.pattern.is_match(actual) || self.excludes.iter().any(|e| e.is_match(actual)) {
            return None;
        }
        let remainder = relative_to(actual, &self.strip)?;
        Some(Mapping {
            virtual_path: join_virtual(&[&self.to_virtual_dir, &self.prepend, &remainder]),
            readonly: self.readonly,
        })
    }
}

struct Group {
    actual_dir: String,
    excludes: Vec<String>,
    filters: Vec<Filter>,
}

impl Group {
    fn new(config: &MappingGroupConfig, import_path: &str) -> FsResult<Self> {
        Ok(Self {
            actual_dir: config.from_actual_dir.clone(),
            excludes: config.exclude.clone(),
            filters: config
                .filter
                .iter()
                .map(|f| Filter::new(f, import_path))
                .collect::<FsResult<_>>()?,
        })
    }

    fn catch_all(import_path: &str) -> FsResult<Self> {
        let config = MappingGroupConfig {
            from_actual_dir: String::new(),
            exclude: CATCH_ALL_EXCLUDES.iter().map(|e| e.to_string()).collect(),
            filter: vec![FilterConfig {
                pattern: ".*".to_string(),
                to_virtual_dir: DEFAULT_VIRTUAL_DIR.to_string(),
                prepend: IMPORT_PATH_PLACEHOLDERS[0].to_string(),
                ..Default::default()
            }],
        };
        Self::new(&config, import_path)
    }

    fn map(&self, actual: &str) -> Option<Mapping> {
        if self.excludes.iter().any(|e| contains_dir(actual, e)) {
            return None;
        }
        relative_to(actual, &self.actual_dir)?;
        self.filters.iter().find_map(|filter| filter.map(actual))
    }
}

/// Compiled mapping rules
pub struct Mapper {
    excludes: Vec<String>,
    groups: Vec<Group>,
}

impl Mapper {
    /// Compile the configured groups and append the catch-all group.
    pub fn new(config: &LayoutConfig) -> FsResult<Self> {
        let mut groups = config
            .source_mapping
            .iter()
            .map(|g| Group::new(g, &config.import_path))
            .collect::<FsResult<Vec<_>>>()?;
        groups.push(Group::catch_all(&config.import_path)?);

        Ok(Self {
            excludes: config.exclude.clone(),
            groups,
        })
    }

    /// Map a workspace-relative real path (`/`-separated, `.` for the root).
    pub fn map(&self, actual: &str) -> MapOutcome {
        if self.excludes.iter().any(|e| contains_dir(actual, e)) {
            return MapOutcome::Excluded;
        }
        self.groups
            .iter()
            .find_map(|group| group.map(actual))
            .map_or(MapOutcome::Unmatched, MapOutcome::Matched)
    }

    /// Map a workspace-relative [`Path`]; the empty path is the workspace root.
    pub fn map_path(&self, relative: &Path) -> MapOutcome {
        let actual = relative.to_string_lossy();
        if actual.is_empty() {
            self.map(".")
        } else {
            self.map(&actual)
        }
    }
}
