// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};

use crate::partition::PartitionTableType;
use crate::path::ObjectPath;

/// What a block device holds, decided once per index rebuild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum DeviceKind {
    /// A filesystem directly on the block.
    Plain { fs_type: String },
    Partitioned { table_type: PartitionTableType },
    Encrypted { cleartext: Option<ObjectPath> },
    LvmPhysicalVolume { group: Option<ObjectPath> },
    /// A logical volume's block; `content` is what the volume holds.
    LvmLogicalVolume {
        lvol: ObjectPath,
        content: Box<DeviceKind>,
    },
    StratisBlockdev { pool: Option<ObjectPath> },
    BtrfsMember { uuid: String },
    Swap { active: bool },
    MdRaidMember { array: Option<ObjectPath> },
    VdoBacking { vdo: ObjectPath },
    Unformatted,
    Unrecognized { id_type: String },
}

impl DeviceKind {
    /// The innermost content, looking through the logical-volume wrapper.
    pub fn content(&self) -> &DeviceKind {
        match self {
            Self::LvmLogicalVolume { content, .. } => content.content(),
            other => other,
        }
    }

    pub fn label(&self) -> &str {
        match self.content() {
            Self::Plain { fs_type } => fs_type,
            Self::Partitioned { .. } => "partition table",
            Self::Encrypted { .. } => "encrypted data",
            Self::LvmPhysicalVolume { .. } => "LVM2 physical volume",
            Self::LvmLogicalVolume { .. } => "logical volume",
            Self::StratisBlockdev { .. } => "Stratis block device",
            Self::BtrfsMember { .. } => "btrfs",
            Self::Swap { .. } => "swap",
            Self::MdRaidMember { .. } => "RAID member",
            Self::VdoBacking { .. } => "VDO backing device",
            Self::Unformatted => "unformatted data",
            Self::Unrecognized { .. } => "unrecognized data",
        }
    }
}
