// SPDX-License-Identifier: GPL-3.0-only

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

use storage_core::resize::{self, ResizeOptions, ResizeVolume};
use storage_core::usage::resolve;
use storage_core::{CoreConfig, Index, logging};
use storage_types::{ActionVerb, ObjectPath, ObjectSnapshot, UsageRequest, UsageTarget};

/// Inspect a saved object snapshot the way the storage core sees it
#[derive(Parser)]
#[command(name = "storage-inspect")]
#[command(about = "Query indices, usage and resize plans of an object snapshot", long_about = None)]
struct Cli {
    /// JSON object snapshot
    snapshot: PathBuf,

    /// TOML configuration of the core
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the derived index
    Index,
    /// List what would have to be torn down for an action
    Usage {
        /// Object path of the block, drive, volume group or pool
        path: String,
        #[arg(long, value_enum, default_value = "block")]
        kind: TargetKind,
        #[arg(long, value_enum, default_value = "format")]
        action: Action,
        /// Restore everything after the action
        #[arg(long)]
        temporary: bool,
    },
    /// Show what resizing a volume may do
    ResizeInfo {
        /// Partition block or logical volume path
        path: String,
        #[arg(long)]
        lvol: bool,
        #[arg(long)]
        to_fit: bool,
    },
    /// Report content noticeably smaller than its volume
    UnusedSpace {
        /// Block path
        path: String,
    },
    /// Plan a resize without running it
    Plan {
        /// Partition block or logical volume path
        path: String,
        /// New size in bytes
        size: u64,
        #[arg(long)]
        lvol: bool,
        #[arg(long)]
        to_fit: bool,
        /// Physical volumes for new extents
        #[arg(long = "pv")]
        pvs: Vec<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum TargetKind {
    Block,
    Drive,
    Lvol,
    Vgroup,
    StratisPool,
    Mdraid,
}

#[derive(Clone, Copy, ValueEnum)]
enum Action {
    Format,
    Delete,
    Grow,
    Shrink,
    Deactivate,
    Lock,
    Stop,
    Repair,
}

impl From<Action> for ActionVerb {
    fn from(action: Action) -> Self {
        match action {
            Action::Format => Self::Format,
            Action::Delete => Self::Delete,
            Action::Grow => Self::Grow,
            Action::Shrink => Self::Shrink,
            Action::Deactivate => Self::Deactivate,
            Action::Lock => Self::Lock,
            Action::Stop => Self::Stop,
            Action::Repair => Self::Repair,
        }
    }
}

fn target(kind: TargetKind, path: ObjectPath) -> UsageTarget {
    match kind {
        TargetKind::Block => UsageTarget::Block(path),
        TargetKind::Drive => UsageTarget::Drive(path),
        TargetKind::Lvol => UsageTarget::LogicalVolume(path),
        TargetKind::Vgroup => UsageTarget::VolumeGroup(path),
        TargetKind::StratisPool => UsageTarget::StratisPool(path),
        TargetKind::Mdraid => UsageTarget::MdRaid(path),
    }
}

fn volume(path: String, lvol: bool) -> ResizeVolume {
    let path = ObjectPath::new(path);
    if lvol {
        ResizeVolume::LogicalVolume(path)
    } else {
        ResizeVolume::Partition(path)
    }
}

fn load_snapshot(path: &Path) -> Result<ObjectSnapshot> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read snapshot {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid snapshot {}", path.display()))
}

fn print<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => CoreConfig::load(path)?,
        None => CoreConfig::default(),
    };
    logging::init(config.log_level);

    let snapshot = load_snapshot(&cli.snapshot)?;
    let index = Index::build(&snapshot, config.min_free_space);
    tracing::debug!(blocks = index.blocks.len(), "snapshot indexed");

    match cli.command {
        Commands::Index => print(&index),
        Commands::Usage {
            path,
            kind,
            action,
            temporary,
        } => {
            let request = if temporary {
                UsageRequest::temporary(action.into())
            } else {
                UsageRequest::destructive(action.into())
            };
            let usage = resolve(&index, &config, &target(kind, ObjectPath::new(path)), request);
            print(&usage)
        }
        Commands::ResizeInfo { path, lvol, to_fit } => {
            let volume = volume(path, lvol);
            let block = volume.block(&index);
            print(&resize::get_resize_info(&index, block.as_ref(), to_fit))
        }
        Commands::UnusedSpace { path } => {
            print(&resize::check_unused_space(&index, &ObjectPath::new(path)))
        }
        Commands::Plan {
            path,
            size,
            lvol,
            to_fit,
            pvs,
        } => {
            let options = ResizeOptions {
                to_fit,
                pvs: (!pvs.is_empty()).then(|| pvs.into_iter().map(ObjectPath::new).collect()),
                passphrase: None,
            };
            let plan = resize::plan(&index, &config, &volume(path, lvol), size, &options)?;
            for step in &plan.steps {
                eprintln!("{step}");
            }
            print(&plan)
        }
    }
}
