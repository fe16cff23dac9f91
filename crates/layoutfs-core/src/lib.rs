//! LayoutFS Core — virtual GOPATH layout over a Please workspace
//!
//! This crate keeps the virtual tree, the rules that map real workspace
//! paths into it, the path-level operations a mount adapter calls, and the
//! watcher that keeps the tree in step with the real files.

pub mod config;
pub mod error;
pub mod fs;
pub mod mapping;
pub mod realfs;
pub mod scan;
pub mod tree;
pub mod types;
pub mod watcher;

// Re-export key types for convenience
pub use config::{CachePolicy, FilterConfig, LayoutConfig, MappingGroupConfig, OverflowPolicy, WatcherPolicy};
pub use error::{FsError, FsResult};
pub use fs::LayoutFs;
pub use mapping::{MapOutcome, Mapper, Mapping, MatchStatus};
pub use realfs::{OsFs, RealFs};
pub use scan::ScanReport;
pub use tree::{Node, VirtualTree};
pub use types::*;
pub use watcher::{ChangeEvent, ChangeKind, ChangeWatcher};
