// SPDX-License-Identifier: GPL-3.0-only

//! Resizing a partition or logical volume together with everything stacked on it.

mod execute;
mod info;
mod limits;
mod plan;
mod unused;

use serde::{Deserialize, Serialize};

use storage_types::ObjectPath;

use crate::index::Index;

pub use execute::{ResizeExecutor, execute};
pub use info::get_resize_info;
pub use limits::{PvSpace, available_pvs, grow_limit, initial_pvs, max_grow_size, prepare_pvs};
pub use plan::{ResizePlan, Step, plan, shrink_to_fit_size};
pub use unused::check_unused_space;

/// The container being resized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "path")]
pub enum ResizeVolume {
    /// Partition, by its block path.
    Partition(ObjectPath),
    LogicalVolume(ObjectPath),
}

impl ResizeVolume {
    pub fn path(&self) -> &ObjectPath {
        match self {
            Self::Partition(path) | Self::LogicalVolume(path) => path,
        }
    }

    /// Block exposing the volume's content; `None` for an inactive logical volume.
    pub fn block(&self, index: &Index) -> Option<ObjectPath> {
        match self {
            Self::Partition(block) => index.blocks.contains_key(block).then(|| block.clone()),
            Self::LogicalVolume(lvol) => index.lvols_block.get(lvol).cloned(),
        }
    }

    pub fn size(&self, index: &Index) -> Option<u64> {
        match self {
            Self::Partition(block) => index.partitions.get(block).map(|part| part.size),
            Self::LogicalVolume(lvol) => index.lvols.get(lvol).map(|lvol| lvol.size),
        }
    }

    /// Granularity of the volume's size.
    pub fn size_step(&self, index: &Index, partition_alignment: u64) -> u64 {
        match self {
            Self::Partition(_) => partition_alignment,
            Self::LogicalVolume(lvol) => index
                .lvols
                .get(lvol)
                .and_then(|lvol| lvol.group.as_ref())
                .and_then(|group| index.vgroups.get(group))
                .map(|group| group.extent_size)
                .unwrap_or(partition_alignment),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeOptions {
    /// Resize to what the content needs (shrink) or to fill the volume (grow).
    pub to_fit: bool,
    /// Physical volumes to allocate new extents on; default is the initial selection.
    pub pvs: Option<Vec<ObjectPath>>,
    pub passphrase: Option<String>,
}
