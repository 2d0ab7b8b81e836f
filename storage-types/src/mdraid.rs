// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};

use crate::path::ObjectPath;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MdRaid {
    pub path: ObjectPath,
    pub name: String,
    pub level: String,
    pub size: u64,
    pub num_devices: u32,
    pub degraded: u32,
    /// An array is running when it has an assembled block device.
    pub running: bool,
}

/// A legacy VDO volume stacked on a backing block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VdoVolume {
    pub path: ObjectPath,
    pub name: String,
    pub backing: Option<ObjectPath>,
    pub physical_size: u64,
    pub logical_size: u64,
}
