// SPDX-License-Identifier: GPL-3.0-only

//! Device relationship indices derived from the object cache.
//!
//! [`Index::build`] is a pure function of an [`ObjectSnapshot`]; it never
//! fails and is rebuilt wholesale after every cache change.

mod btrfs;
mod classify;
mod multipath;
mod parse;
pub mod stripe;

use std::collections::BTreeMap;

use serde::Serialize;

use storage_types::{
    Block, BtrfsVolume, CryptoContainer, DeviceKind, Drive, Filesystem, InterfaceKind,
    LogicalVolume, LvolStatus, MdRaid, ObjectPath, ObjectSnapshot, Partition, PartitionTable,
    PartitionTree, PhysicalVolume, Properties, ResizeSupport, StratisBlockdev, StratisFilesystem,
    StratisPool, StripeSummary, Swap, VdoVolume, VolumeGroup,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Index {
    pub blocks: BTreeMap<ObjectPath, Block>,
    pub drives: BTreeMap<ObjectPath, Drive>,
    /// Keyed by the partition's block path.
    pub partitions: BTreeMap<ObjectPath, Partition>,
    pub partition_tables: BTreeMap<ObjectPath, PartitionTable>,
    pub crypto: BTreeMap<ObjectPath, CryptoContainer>,
    pub filesystems: BTreeMap<ObjectPath, Filesystem>,
    pub swaps: BTreeMap<ObjectPath, Swap>,
    pub mdraids: BTreeMap<ObjectPath, MdRaid>,
    pub vgroups: BTreeMap<ObjectPath, VolumeGroup>,
    pub lvols: BTreeMap<ObjectPath, LogicalVolume>,
    /// Keyed by the physical volume's block path.
    pub pvols: BTreeMap<ObjectPath, PhysicalVolume>,
    pub vdos: BTreeMap<ObjectPath, VdoVolume>,
    pub stratis_pools: BTreeMap<ObjectPath, StratisPool>,
    pub stratis_blockdevs: BTreeMap<ObjectPath, StratisBlockdev>,
    pub stratis_filesystems: BTreeMap<ObjectPath, StratisFilesystem>,
    pub resize_support: BTreeMap<String, ResizeSupport>,

    pub drives_block: BTreeMap<ObjectPath, ObjectPath>,
    pub drives_multipath_blocks: BTreeMap<ObjectPath, Vec<ObjectPath>>,
    pub broken_multipath_present: bool,
    /// Partition table block to its partitions, by offset.
    pub blocks_partitions: BTreeMap<ObjectPath, Vec<ObjectPath>>,
    pub partition_trees: BTreeMap<ObjectPath, PartitionTree>,
    /// Backing block to its unlocked cleartext block.
    pub blocks_cleartext: BTreeMap<ObjectPath, ObjectPath>,
    pub cleartext_backing: BTreeMap<ObjectPath, ObjectPath>,
    /// Device names without `/dev/` to their block.
    pub slashdevs_block: BTreeMap<String, ObjectPath>,
    pub mdraids_block: BTreeMap<ObjectPath, ObjectPath>,
    pub mdraids_members: BTreeMap<ObjectPath, Vec<ObjectPath>>,
    pub vgnames_vgroup: BTreeMap<String, ObjectPath>,
    pub vgroups_pvols: BTreeMap<ObjectPath, Vec<ObjectPath>>,
    pub vgroups_lvols: BTreeMap<ObjectPath, Vec<ObjectPath>>,
    pub lvols_block: BTreeMap<ObjectPath, ObjectPath>,
    pub blocks_lvol: BTreeMap<ObjectPath, ObjectPath>,
    /// Thin pool to the thin volumes it provisions.
    pub lvols_pool_members: BTreeMap<ObjectPath, Vec<ObjectPath>>,
    pub lvols_stripe_summary: BTreeMap<ObjectPath, StripeSummary>,
    pub lvols_status: BTreeMap<ObjectPath, LvolStatus>,
    pub stratis_pool_blockdevs: BTreeMap<ObjectPath, Vec<ObjectPath>>,
    pub stratis_pool_filesystems: BTreeMap<ObjectPath, Vec<ObjectPath>>,
    pub blocks_stratis_blockdev: BTreeMap<ObjectPath, ObjectPath>,
    pub blocks_stratis_fsys: BTreeMap<ObjectPath, ObjectPath>,
    pub btrfs_volumes: BTreeMap<String, BtrfsVolume>,
    pub blocks_btrfs_volume: BTreeMap<ObjectPath, String>,
    pub blocks_vdo: BTreeMap<ObjectPath, ObjectPath>,
    /// Live mount points and configured mount directories to their block.
    pub mountpoints_block: BTreeMap<String, ObjectPath>,
    pub kinds: BTreeMap<ObjectPath, DeviceKind>,
}

fn decode<T>(
    snapshot: &ObjectSnapshot,
    kind: InterfaceKind,
    parse: impl Fn(&ObjectPath, &Properties) -> T,
) -> BTreeMap<ObjectPath, T> {
    snapshot
        .objects
        .iter()
        .filter_map(|(path, interfaces)| Some((path.clone(), parse(path, interfaces.get(&kind)?))))
        .collect()
}

impl Index {
    /// Derive all indices from `snapshot`. Free partition space must be
    /// strictly larger than `min_free_space` to be reported.
    pub fn build(snapshot: &ObjectSnapshot, min_free_space: u64) -> Self {
        let mut index = Self {
            blocks: decode(snapshot, InterfaceKind::Block, parse::block),
            drives: decode(snapshot, InterfaceKind::Drive, parse::drive),
            partitions: decode(snapshot, InterfaceKind::Partition, parse::partition),
            partition_tables: decode(
                snapshot,
                InterfaceKind::PartitionTable,
                parse::partition_table,
            ),
            crypto: decode(snapshot, InterfaceKind::Encrypted, parse::crypto),
            filesystems: decode(snapshot, InterfaceKind::Filesystem, parse::filesystem),
            swaps: decode(snapshot, InterfaceKind::Swapspace, parse::swap),
            mdraids: decode(snapshot, InterfaceKind::MdRaid, parse::mdraid),
            vgroups: decode(snapshot, InterfaceKind::VolumeGroup, parse::volume_group),
            lvols: decode(snapshot, InterfaceKind::LogicalVolume, parse::logical_volume),
            pvols: decode(snapshot, InterfaceKind::PhysicalVolume, parse::physical_volume),
            vdos: decode(snapshot, InterfaceKind::Vdo, parse::vdo),
            stratis_pools: decode(snapshot, InterfaceKind::StratisPool, parse::stratis_pool),
            stratis_blockdevs: decode(
                snapshot,
                InterfaceKind::StratisBlockdev,
                parse::stratis_blockdev,
            ),
            stratis_filesystems: decode(
                snapshot,
                InterfaceKind::StratisFilesystem,
                parse::stratis_filesystem,
            ),
            resize_support: snapshot.resize_support.clone(),
            ..Default::default()
        };

        index.link_drives();
        index.link_partitions(min_free_space);
        index.link_crypto();
        index.link_slashdevs();
        index.link_mdraids();
        index.link_lvm(snapshot);
        index.link_stratis();
        index.link_vdo();
        index.btrfs_volumes =
            btrfs::group_volumes(&index.blocks, &index.filesystems, &snapshot.btrfs_subvolumes);
        for volume in index.btrfs_volumes.values() {
            for member in &volume.members {
                index
                    .blocks_btrfs_volume
                    .insert(member.clone(), volume.uuid.clone());
            }
        }
        index.link_mountpoints();
        let kinds = index
            .blocks
            .values()
            .map(|block| (block.path.clone(), classify::classify(&index, block)))
            .collect();
        index.kinds = kinds;

        index
    }

    fn link_drives(&mut self) {
        let grouped = multipath::group_drive_blocks(&self.blocks, &self.drives, &self.partitions);
        self.drives_block = grouped.drives_block;
        self.drives_multipath_blocks = grouped.drives_multipath_blocks;
        self.broken_multipath_present = grouped.broken_multipath_present;
    }

    fn link_partitions(&mut self, min_free_space: u64) {
        for partition in self.partitions.values() {
            if let Some(table) = &partition.table {
                self.blocks_partitions
                    .entry(table.clone())
                    .or_default()
                    .push(partition.block.clone());
            }
        }
        for members in self.blocks_partitions.values_mut() {
            members.sort_by_key(|path| self.partitions.get(path).map(|part| part.offset));
        }

        for table in self.partition_tables.keys() {
            let Some(block) = self.blocks.get(table) else {
                continue;
            };
            let partitions: Vec<Partition> = self
                .blocks_partitions
                .get(table)
                .into_iter()
                .flatten()
                .filter_map(|path| self.partitions.get(path).cloned())
                .collect();
            self.partition_trees.insert(
                table.clone(),
                PartitionTree::build(table, block.size, &partitions, min_free_space),
            );
        }
    }

    fn link_crypto(&mut self) {
        for block in self.blocks.values() {
            let Some(backing) = &block.crypto_backing_device else {
                continue;
            };
            if let Some(previous) = self.blocks_cleartext.insert(backing.clone(), block.path.clone())
            {
                tracing::warn!(
                    %backing,
                    %previous,
                    replacement = %block.path,
                    "two cleartext devices claim the same backing device"
                );
                self.cleartext_backing.remove(&previous);
            }
            self.cleartext_backing
                .insert(block.path.clone(), backing.clone());
        }

        for container in self.crypto.values_mut() {
            if let Some(cleartext) = self.blocks_cleartext.get(&container.block) {
                container.cleartext = Some(cleartext.clone());
            }
        }
    }

    fn link_slashdevs(&mut self) {
        for block in self.blocks.values() {
            for name in block.slashdev_names() {
                self.slashdevs_block
                    .insert(name.to_string(), block.path.clone());
            }
        }
    }

    fn link_mdraids(&mut self) {
        for block in self.blocks.values() {
            if let Some(array) = &block.mdraid {
                self.mdraids_block.insert(array.clone(), block.path.clone());
            }
            if let Some(array) = &block.mdraid_member {
                self.mdraids_members
                    .entry(array.clone())
                    .or_default()
                    .push(block.path.clone());
            }
        }
        for (path, array) in self.mdraids.iter_mut() {
            array.running = self.mdraids_block.contains_key(path);
        }
    }

    fn link_lvm(&mut self, snapshot: &ObjectSnapshot) {
        for (path, group) in &self.vgroups {
            self.vgnames_vgroup.insert(group.name.clone(), path.clone());
        }

        for pvol in self.pvols.values() {
            if let Some(group) = &pvol.group {
                self.vgroups_pvols
                    .entry(group.clone())
                    .or_default()
                    .push(pvol.block.clone());
            }
        }
        for members in self.vgroups_pvols.values_mut() {
            members.sort_by(|a, b| {
                let name = |path: &ObjectPath| {
                    self.blocks
                        .get(path)
                        .map(|block| block.device.clone())
                        .unwrap_or_default()
                };
                name(a).cmp(&name(b))
            });
        }

        for lvol in self.lvols.values() {
            if let Some(group) = &lvol.group {
                self.vgroups_lvols
                    .entry(group.clone())
                    .or_default()
                    .push(lvol.path.clone());
            }
            if let Some(pool) = &lvol.thin_pool {
                self.lvols_pool_members
                    .entry(pool.clone())
                    .or_default()
                    .push(lvol.path.clone());
            }
            if let Some(summary) = stripe::summarize(lvol) {
                self.lvols_status
                    .insert(lvol.path.clone(), stripe::status(&lvol.layout, &summary));
                self.lvols_stripe_summary.insert(lvol.path.clone(), summary);
            }
        }
        let lvols = &self.lvols;
        let by_name = |a: &ObjectPath, b: &ObjectPath| {
            let name = |path: &ObjectPath| lvols.get(path).map(|lvol| lvol.name.as_str());
            name(a).cmp(&name(b))
        };
        for members in self.vgroups_lvols.values_mut() {
            members.sort_by(by_name);
        }
        for members in self.lvols_pool_members.values_mut() {
            members.sort_by(by_name);
        }

        for (path, interfaces) in &snapshot.objects {
            let Some(lvol) = interfaces
                .get(&InterfaceKind::LvmBlock)
                .and_then(|props| {
                    props
                        .get("LogicalVolume")
                        .and_then(|value| value.as_str())
                        .and_then(ObjectPath::from_ref)
                })
            else {
                continue;
            };
            self.lvols_block.insert(lvol.clone(), path.clone());
            self.blocks_lvol.insert(path.clone(), lvol);
        }
    }

    fn link_stratis(&mut self) {
        for blockdev in self.stratis_blockdevs.values() {
            if let Some(pool) = &blockdev.pool {
                self.stratis_pool_blockdevs
                    .entry(pool.clone())
                    .or_default()
                    .push(blockdev.path.clone());
            }
            if let Some(block) = self.block_for_device(&blockdev.physical_path) {
                self.blocks_stratis_blockdev
                    .insert(block, blockdev.path.clone());
            }
        }
        for filesystem in self.stratis_filesystems.values() {
            if let Some(pool) = &filesystem.pool {
                self.stratis_pool_filesystems
                    .entry(pool.clone())
                    .or_default()
                    .push(filesystem.path.clone());
            }
            if let Some(block) = self.block_for_device(&filesystem.devnode) {
                self.blocks_stratis_fsys
                    .insert(block, filesystem.path.clone());
            }
        }
    }

    fn link_vdo(&mut self) {
        for vdo in self.vdos.values() {
            if let Some(backing) = &vdo.backing {
                self.blocks_vdo.insert(backing.clone(), vdo.path.clone());
            }
        }
    }

    fn link_mountpoints(&mut self) {
        for block in self.blocks.values() {
            for entry in block.fstab_entries() {
                if let Some(directory) = &entry.directory {
                    self.mountpoints_block
                        .insert(directory.clone(), block.path.clone());
                }
            }
        }
        // Live mounts win over configured ones.
        for filesystem in self.filesystems.values() {
            for mount_point in &filesystem.mount_points {
                self.mountpoints_block
                    .insert(mount_point.clone(), filesystem.block.clone());
            }
        }
    }

    /// Block for a device node such as `/dev/sdb` or `/dev/stratis/pool/fs`.
    pub fn block_for_device(&self, device: &str) -> Option<ObjectPath> {
        let name = device.strip_prefix("/dev/").unwrap_or(device);
        self.slashdevs_block.get(name).cloned()
    }

    /// Uuids of Btrfs volumes that are not present in `previous`.
    pub fn new_btrfs_uuids(&self, previous: Option<&Index>) -> Vec<String> {
        self.btrfs_volumes
            .keys()
            .filter(|uuid| previous.is_none_or(|previous| !previous.btrfs_volumes.contains_key(*uuid)))
            .cloned()
            .collect()
    }

    pub fn kind(&self, block: &ObjectPath) -> Option<&DeviceKind> {
        self.kinds.get(block)
    }

    /// The table a partition block belongs to, with its layout tree.
    pub fn partition_tree_for(&self, partition: &ObjectPath) -> Option<&PartitionTree> {
        let table = self.partitions.get(partition)?.table.as_ref()?;
        self.partition_trees.get(table)
    }

    /// Free space directly behind a partition, zero when none.
    pub fn free_space_after_partition(&self, partition: &ObjectPath) -> u64 {
        self.partition_tree_for(partition)
            .map(|tree| tree.free_space_after(partition))
            .unwrap_or(0)
    }

    /// Physical volume blocks of a volume group, as typed records.
    pub fn group_pvols(&self, group: &ObjectPath) -> Vec<&PhysicalVolume> {
        self.vgroups_pvols
            .get(group)
            .into_iter()
            .flatten()
            .filter_map(|path| self.pvols.get(path))
            .collect()
    }

    pub fn group_lvols(&self, group: &ObjectPath) -> Vec<&LogicalVolume> {
        self.vgroups_lvols
            .get(group)
            .into_iter()
            .flatten()
            .filter_map(|path| self.lvols.get(path))
            .collect()
    }

    /// Display name for messages: the device node when known.
    pub fn display_name(&self, path: &ObjectPath) -> String {
        if let Some(block) = self.blocks.get(path)
            && !block.preferred_device.is_empty()
        {
            return block.preferred_device.clone();
        }
        if let Some(block) = self.blocks.get(path)
            && !block.device.is_empty()
        {
            return block.device.clone();
        }
        if let Some(lvol) = self.lvols.get(path) {
            return lvol.name.clone();
        }
        path.basename().to_string()
    }
}
