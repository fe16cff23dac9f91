//! Change watcher keeping the tree in step with the real workspace
//!
//! Notifications from the OS arrive on the `notify` thread, are turned into
//! workspace-relative [`ChangeEvent`]s and queued on a bounded channel. A
//! single consumer task applies them to the tree in arrival order.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::OverflowPolicy;
use crate::error::{FsError, FsResult};
use crate::fs::LayoutFs;
use crate::mapping::MapOutcome;
use crate::scan::workspace_relative;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Create,
    Remove,
}

/// One change to a workspace-relative real path
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: String,
    pub kind: ChangeKind,
}

impl ChangeEvent {
    pub fn new(path: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Translate a raw notification into changes. Paths are reported relative to
/// `root`; paths outside it are dropped.
pub fn translate(root: &Path, event: &Event) -> Vec<ChangeEvent> {
    let kinds: Vec<(&PathBuf, ChangeKind)> = match &event.kind {
        EventKind::Create(_) => event.paths.iter().map(|p| (p, ChangeKind::Create)).collect(),
        EventKind::Remove(_) => event.paths.iter().map(|p| (p, ChangeKind::Remove)).collect(),
        EventKind::Modify(ModifyKind::Name(mode)) => match (mode, event.paths.as_slice()) {
            (RenameMode::From, paths) => paths.iter().map(|p| (p, ChangeKind::Remove)).collect(),
            (RenameMode::To, paths) => paths.iter().map(|p| (p, ChangeKind::Create)).collect(),
            (RenameMode::Both, [from, to]) => vec![(from, ChangeKind::Remove), (to, ChangeKind::Create)],
            // Backends that cannot tell the two ends apart
            (_, paths) => paths
                .iter()
                .map(|p| {
                    let kind = if p.symlink_metadata().is_ok() {
                        ChangeKind::Create
                    } else {
                        ChangeKind::Remove
                    };
                    (p, kind)
                })
                .collect(),
        },
        _ => Vec::new(),
    };

    kinds
        .into_iter()
        .filter_map(|(path, kind)| match workspace_relative(root, path) {
            Some(relative) => Some(ChangeEvent::new(relative, kind)),
            None => {
                debug!("ignoring change outside workspace: {}", path.display());
                None
            }
        })
        .collect()
}

/// Apply one change to the tree.
///
/// A created directory is walked so its mapped contents appear; a created
/// file is tracked on its own. A remove untracks the mapped path unless the
/// real path has reappeared in the meantime.
pub fn handle_event(fs: &LayoutFs, event: &ChangeEvent) -> FsResult<()> {
    let mapping = match fs.mapper().map(&event.path) {
        MapOutcome::Matched(mapping) => mapping,
        outcome => {
            debug!("skipping {:?} {}: {:?}", event.kind, event.path, outcome.status());
            return Ok(());
        }
    };
    let actual = fs.workspace().join(&event.path);
    let real_fs = fs.tree().real_fs();

    match event.kind {
        ChangeKind::Create => match real_fs.stat(&actual) {
            Ok(attr) if attr.is_dir() => {
                let report = fs.rescan(&actual);
                debug!("rescanned {}: {} tracked", event.path, report.tracked);
            }
            Ok(_) => {
                fs.tree().track(&mapping.virtual_path, actual, mapping.readonly);
            }
            Err(e) => debug!("{} vanished before tracking: {}", event.path, e),
        },
        ChangeKind::Remove => {
            if real_fs.stat(&actual).is_ok() {
                debug!("{} exists again, keeping it tracked", event.path);
                return Ok(());
            }
            match fs.tree().untrack(&mapping.virtual_path) {
                Ok(()) | Err(FsError::NotFound) => {}
                // root and the top-level directories are never untracked
                Err(FsError::InvalidArgument) => {
                    debug!("{} maps to {}, left in place", event.path, mapping.virtual_path)
                }
                Err(e) => return Err(e),
            }
        }
    }
    Ok(())
}

/// Background watcher over the workspace root
pub struct ChangeWatcher {
    watcher: Option<RecommendedWatcher>,
    cancel: CancellationToken,
    consumer: Option<JoinHandle<()>>,
    dropped: Arc<AtomicU64>,
}

impl ChangeWatcher {
    /// Start watching `fs`'s workspace. Must be called inside a tokio runtime.
    pub fn start(fs: Arc<LayoutFs>) -> FsResult<Self> {
        let root = std::fs::canonicalize(fs.workspace())?;
        let policy = fs.config().watcher.clone();
        let (tx, rx) = mpsc::channel::<ChangeEvent>(policy.queue_capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));

        let watch_root = root.clone();
        let counter = Arc::clone(&dropped);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!("watch error: {}", e);
                    return;
                }
            };
            for change in translate(&watch_root, &event) {
                enqueue(&tx, change, policy.overflow, &counter);
            }
        })?;
        watcher.watch(&root, RecursiveMode::Recursive)?;
        info!("watching {}", root.display());

        let cancel = CancellationToken::new();
        let consumer = tokio::spawn(consume(fs, rx, cancel.clone()));

        Ok(Self {
            watcher: Some(watcher),
            cancel,
            consumer: Some(consumer),
            dropped,
        })
    }

    /// Events discarded because the queue was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop the OS watch, then the consumer, and wait for it to finish.
    pub async fn stop(mut self) {
        drop(self.watcher.take());
        self.cancel.cancel();
        if let Some(consumer) = self.consumer.take() {
            if let Err(e) = consumer.await {
                error!("watch consumer failed: {}", e);
            }
        }
        info!("watcher stopped ({} events dropped)", self.dropped_events());
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn enqueue(tx: &mpsc::Sender<ChangeEvent>, change: ChangeEvent, overflow: OverflowPolicy, dropped: &AtomicU64) {
    match overflow {
        OverflowPolicy::Block => {
            if tx.blocking_send(change).is_err() {
                debug!("watch queue closed");
            }
        }
        OverflowPolicy::Drop => match tx.try_send(change) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(change)) => {
                dropped.fetch_add(1, Ordering::Relaxed);
                warn!("watch queue full, dropped {:?} {}", change.kind, change.path);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => debug!("watch queue closed"),
        },
    }
}

async fn consume(fs: Arc<LayoutFs>, mut rx: mpsc::Receiver<ChangeEvent>, cancel: CancellationToken) {
    loop {
        let change = tokio::select! {
            _ = cancel.cancelled() => break,
            change = rx.recv() => match change {
                Some(change) => change,
                None => break,
            },
        };

        let fs = Arc::clone(&fs);
        let result = tokio::task::spawn_blocking(move || {
            let outcome = handle_event(&fs, &change);
            (change, outcome)
        })
        .await;

        match result {
            Ok((_, Ok(()))) => {}
            Ok((change, Err(e))) => warn!("failed to apply {:?} {}: {}", change.kind, change.path, e),
            Err(e) => error!("change handler panicked: {}", e),
        }
    }
    debug!("watch consumer exiting");
}
