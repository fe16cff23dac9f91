//! LayoutFS FUSE Host — GOPATH-style view of a Please workspace
//!
//! This binary populates the virtual layout from a workspace, keeps it in
//! step with the real files and mounts it using libfuse (Linux) or macFUSE
//! (macOS).

#[cfg(feature = "fuse")]
mod adapter;
#[cfg_attr(not(feature = "fuse"), allow(dead_code))]
mod errno;
#[cfg_attr(not(feature = "fuse"), allow(dead_code))]
mod inodes;

#[cfg(feature = "fuse")]
use adapter::LayoutFsFuse;
use anyhow::{bail, Context, Result};
use clap::Parser;
use layoutfs_core::{ChangeWatcher, LayoutConfig, LayoutFs};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
struct Args {
    /// Mount point for the filesystem
    mount_point: PathBuf,

    /// Workspace to expose (defaults to the current directory)
    #[arg(short, long)]
    workspace: Option<PathBuf>,

    /// Import path of the workspace, e.g. github.com/org/repo
    #[arg(short, long)]
    import_path: Option<String>,

    /// Configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Allow other users to access the filesystem
    #[arg(long)]
    allow_other: bool,

    /// Allow root to access the filesystem
    #[arg(long)]
    allow_root: bool,

    /// Auto unmount on process exit
    #[arg(long)]
    auto_unmount: bool,

    /// Log every operation
    #[arg(short, long)]
    verbose: bool,
}

/// Load the layout configuration. Command-line values override the file.
fn load_config(
    config_path: Option<PathBuf>,
    workspace: Option<PathBuf>,
    import_path: Option<String>,
) -> Result<LayoutConfig> {
    let mut config = match config_path {
        Some(path) => {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            LayoutConfig::from_json(&content)
                .with_context(|| format!("parsing {}", path.display()))?
        }
        None => LayoutConfig::for_workspace(".", ""),
    };

    if let Some(workspace) = workspace {
        config.workspace = workspace;
    }
    if let Some(import_path) = import_path {
        config.import_path = import_path;
    }
    Ok(config)
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    info!("Starting LayoutFS FUSE Host");
    info!("Mount point: {}", args.mount_point.display());

    let mut config = load_config(args.config.clone(), args.workspace.clone(), args.import_path.clone())?;
    config.workspace = fs::canonicalize(&config.workspace)
        .with_context(|| format!("workspace {}", config.workspace.display()))?;
    if config.import_path.is_empty() {
        warn!("No import path configured; sources map directly under src/");
    }
    if let Ok(mount_point) = fs::canonicalize(&args.mount_point) {
        if mount_point.starts_with(&config.workspace) {
            bail!("mount point {} is inside the workspace", mount_point.display());
        }
    }
    info!("Configuration loaded: {:?}", config);

    let layout = Arc::new(LayoutFs::new(config)?);
    layout.populate();
    let watcher = ChangeWatcher::start(Arc::clone(&layout))?;

    #[cfg(feature = "fuse")]
    {
        let filesystem = LayoutFsFuse::new(Arc::clone(&layout));

        let mut mount_options = vec![
            fuser::MountOption::FSName("layoutfs".to_string()),
            fuser::MountOption::Subtype("layoutfs".to_string()),
        ];

        if args.allow_other {
            mount_options.push(fuser::MountOption::AllowOther);
        }

        if args.allow_root {
            mount_options.push(fuser::MountOption::AllowRoot);
        }

        if args.auto_unmount {
            mount_options.push(fuser::MountOption::AutoUnmount);
        }

        info!("Mounting filesystem...");
        let mount_point = args.mount_point.clone();
        let mounted =
            tokio::task::spawn_blocking(move || fuser::mount2(filesystem, &mount_point, &mount_options))
                .await;

        watcher.stop().await;
        mounted??;
    }

    #[cfg(not(feature = "fuse"))]
    {
        warn!("FUSE support not compiled in. This binary is for testing only.");
        info!("Virtual tree:\n{}", layout.tree());
        info!("To enable FUSE support, compile with: cargo build --features fuse");
        watcher.stop().await;
    }

    Ok(())
}
