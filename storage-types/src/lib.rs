// SPDX-License-Identifier: GPL-3.0-only

//! Canonical domain models for the storage orchestration core
//!
//! Remote objects are mirrored loosely typed (`object`) and decoded into the
//! typed records of this crate by the index builder in `storage-core`:
//!
//! - **Devices**: `Block`, `Drive`, `Partition`, `CryptoContainer`, `Filesystem`, `Swap`
//! - **Volume managers**: LVM2 (`VolumeGroup`, `LogicalVolume`, `PhysicalVolume`),
//!   Stratis pools, MD RAID arrays, VDO volumes, Btrfs volumes
//! - **Derived views**: `DeviceKind`, `StripeSummary`, `PartitionTree`
//! - **Requests and answers**: `UsageList`, `ResizeInfo`, `UnusedSpace`

pub mod block;
pub mod btrfs;
pub mod common;
pub mod encryption;
pub mod filesystem;
pub mod kind;
pub mod lvm;
pub mod mdraid;
pub mod object;
pub mod partition;
pub mod path;
pub mod resize;
pub mod stratis;
pub mod usage;

pub use block::{Block, ConfigEntry, ConfigKind, Drive, IdUsage, MULTIPATH_SYMLINK_PREFIX};
pub use btrfs::{BtrfsSubvolume, BtrfsVolume, SubvolumeNode, SubvolumeTree};
pub use common::{ByteRange, MIB, bytes_to_pretty, round_down, round_up};
pub use encryption::CryptoContainer;
pub use filesystem::{Filesystem, MountEntry, ProcessRef, ResizeMode, ResizeSupport, Swap};
pub use kind::DeviceKind;
pub use lvm::{
    LogicalVolume, LvLayout, LvmStructure, LvolStatus, PhysicalVolume, Segment, StripeKey,
    StripeLeg, StripeSummary, VolumeGroup,
};
pub use mdraid::{MdRaid, VdoVolume};
pub use object::{
    Change, ChangeNotification, InterfaceKind, ObjectSnapshot, Properties, PropertiesExt,
    RemoteObject,
};
pub use partition::{
    Partition, PartitionNode, PartitionNodeKind, PartitionTable, PartitionTableType,
    PartitionTree,
};
pub use path::ObjectPath;
pub use resize::{GrowLimit, ResizeDirection, ResizeInfo, ResizeTarget, UnusedSpace};
pub use stratis::{BlockdevTier, StratisBlockdev, StratisFilesystem, StratisPool};
pub use usage::{
    ActionVerb, TeardownVerb, UsageEntry, UsageKind, UsageList, UsageRequest, UsageTarget,
};
