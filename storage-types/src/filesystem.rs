// SPDX-License-Identifier: GPL-3.0-only

use enumflags2::{BitFlags, bitflags};
use serde::{Deserialize, Serialize};

use crate::path::ObjectPath;

/// Resize modes reported by the storage service for a filesystem type.
#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResizeMode {
    OfflineShrink = 0b0_0010,
    OfflineGrow = 0b0_0100,
    OnlineShrink = 0b0_1000,
    OnlineGrow = 0b1_0000,
}

/// What the tools for one filesystem type can do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeSupport {
    pub can_shrink: bool,
    pub can_grow: bool,
    pub shrink_needs_unmount: bool,
    pub grow_needs_unmount: bool,
}

impl ResizeSupport {
    pub fn from_modes(modes: BitFlags<ResizeMode>) -> Self {
        Self {
            can_shrink: modes.intersects(ResizeMode::OfflineShrink | ResizeMode::OnlineShrink),
            can_grow: modes.intersects(ResizeMode::OfflineGrow | ResizeMode::OnlineGrow),
            shrink_needs_unmount: !modes.contains(ResizeMode::OnlineShrink),
            grow_needs_unmount: !modes.contains(ResizeMode::OnlineGrow),
        }
    }

    /// Decode the raw flag word, ignoring unknown bits.
    pub fn from_bits(bits: u32) -> Self {
        Self::from_modes(BitFlags::from_bits_truncate(bits))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filesystem {
    pub block: ObjectPath,
    pub mount_points: Vec<String>,
    /// Size of the filesystem itself, zero when unknown.
    pub size: u64,
}

impl Filesystem {
    pub fn is_mounted(&self) -> bool {
        !self.mount_points.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Swap {
    pub block: ObjectPath,
    pub active: bool,
}

/// A persistent mount-table line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MountEntry {
    /// `UUID=...` spec or device node.
    pub device: String,
    pub directory: String,
    pub fs_type: String,
    pub options: String,
    pub freq: u32,
    pub passno: u32,
}

impl MountEntry {
    /// The (device, directory, options) triple that identifies an entry.
    pub fn key(&self) -> (&str, &str, &str) {
        (&self.device, &self.directory, &self.options)
    }
}

/// A process holding files open on a mounted filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRef {
    pub pid: i32,
    pub command: String,
    pub uid: Option<u32>,
    /// False for processes that must not be signalled (system services, pid 1).
    pub stoppable: bool,
}
