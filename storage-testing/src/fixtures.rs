// SPDX-License-Identifier: GPL-3.0-only

//! Snapshot fixtures shaped like the storage service's object tree.

use std::fs;
use std::path::Path;

use serde_json::{Value, json};

use storage_types::{
    BtrfsSubvolume, InterfaceKind, ObjectPath, ObjectSnapshot, Properties, ResizeSupport,
};

use crate::errors::{Result, TestingError};

const UDISKS: &str = "/org/freedesktop/UDisks2";

pub fn block_path(name: &str) -> ObjectPath {
    ObjectPath::new(format!("{UDISKS}/block_devices/{name}"))
}

pub fn drive_path(name: &str) -> ObjectPath {
    ObjectPath::new(format!("{UDISKS}/drives/{name}"))
}

pub fn vg_path(vg: &str) -> ObjectPath {
    ObjectPath::new(format!("{UDISKS}/lvm/{vg}"))
}

pub fn lv_path(vg: &str, lv: &str) -> ObjectPath {
    ObjectPath::new(format!("{UDISKS}/lvm/{vg}/{lv}"))
}

pub fn mdraid_path(name: &str) -> ObjectPath {
    ObjectPath::new(format!("{UDISKS}/mdraid/{name}"))
}

pub fn vdo_path(name: &str) -> ObjectPath {
    ObjectPath::new(format!("/org/storage/vdo/{name}"))
}

pub fn stratis_pool_path(name: &str) -> ObjectPath {
    ObjectPath::new(format!("/org/storage/stratis3/pool/{name}"))
}

pub fn stratis_blockdev_path(name: &str) -> ObjectPath {
    ObjectPath::new(format!("/org/storage/stratis3/blockdev/{name}"))
}

pub fn stratis_fs_path(pool: &str, name: &str) -> ObjectPath {
    ObjectPath::new(format!("/org/storage/stratis3/filesystem/{pool}/{name}"))
}

/// `[start, size, pv]` segment triples; `None` marks a missing PV.
pub fn segments(parts: &[(u64, Option<&str>)]) -> Value {
    let mut start = 0;
    let triples: Vec<Value> = parts
        .iter()
        .map(|(size, pv)| {
            let pv = pv.map(|name| block_path(name).to_string());
            let triple = json!([start, size, pv.unwrap_or_else(|| "/".to_string())]);
            start += size;
            triple
        })
        .collect();
    Value::Array(triples)
}

/// Structure of a plain (linear) logical volume.
pub fn linear_structure(size: u64, parts: &[(u64, Option<&str>)]) -> Value {
    json!({"type": "linear", "size": size, "segments": segments(parts)})
}

/// Structure of a RAID volume with one data leg per entry of `legs`.
pub fn raid_structure(layout: &str, leg_size: u64, legs: &[&[(u64, Option<&str>)]]) -> Value {
    let data: Vec<Value> = legs
        .iter()
        .map(|parts| linear_structure(leg_size, parts))
        .collect();
    json!({"type": layout, "size": leg_size, "data": data})
}

/// Fluent builder for [`ObjectSnapshot`]s. Names are device names such as `sda1`.
#[derive(Debug, Clone, Default)]
pub struct SnapshotBuilder {
    snapshot: ObjectSnapshot,
}

impl SnapshotBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `properties` into the `kind` interface of `path`.
    pub fn with_props(mut self, path: &ObjectPath, kind: InterfaceKind, properties: Value) -> Self {
        let target: &mut Properties = self
            .snapshot
            .objects
            .entry(path.clone())
            .or_default()
            .entry(kind)
            .or_default();
        if let Value::Object(map) = properties {
            target.extend(map);
        }
        self
    }

    pub fn block(self, name: &str, size: u64) -> Self {
        let device = format!("/dev/{name}");
        self.with_props(
            &block_path(name),
            InterfaceKind::Block,
            json!({
                "Device": device,
                "PreferredDevice": device,
                "Symlinks": [],
                "Size": size,
                "Drive": "/",
                "IdUsage": "",
                "IdType": "",
                "CryptoBackingDevice": "/",
            }),
        )
    }

    fn block_props(self, name: &str, properties: Value) -> Self {
        self.with_props(&block_path(name), InterfaceKind::Block, properties)
    }

    /// A drive owning the whole-disk `blocks`.
    pub fn drive(mut self, name: &str, blocks: &[&str]) -> Self {
        let drive = drive_path(name);
        self = self.with_props(&drive, InterfaceKind::Drive, json!({"Model": name, "Size": 0}));
        for block in blocks {
            self = self.block_props(block, json!({"Drive": drive.as_str()}));
        }
        self
    }

    pub fn symlinks(self, name: &str, links: &[&str]) -> Self {
        self.block_props(name, json!({"Symlinks": links}))
    }

    pub fn partition_table(self, name: &str, table_type: &str) -> Self {
        self.with_props(
            &block_path(name),
            InterfaceKind::PartitionTable,
            json!({"Type": table_type}),
        )
    }

    pub fn partition(self, name: &str, table: &str, offset: u64, size: u64) -> Self {
        let number: u64 = name
            .rfind(|c: char| !c.is_ascii_digit())
            .map_or(name, |position| &name[position + 1..])
            .parse()
            .unwrap_or(0);
        self.block(name, size).with_props(
            &block_path(name),
            InterfaceKind::Partition,
            json!({
                "Table": block_path(table).as_str(),
                "Number": number,
                "Offset": offset,
                "Size": size,
                "IsContainer": false,
                "IsContained": false,
            }),
        )
    }

    pub fn extended(self, name: &str) -> Self {
        self.with_props(
            &block_path(name),
            InterfaceKind::Partition,
            json!({"IsContainer": true}),
        )
    }

    pub fn logical(self, name: &str) -> Self {
        self.with_props(
            &block_path(name),
            InterfaceKind::Partition,
            json!({"IsContained": true}),
        )
    }

    pub fn filesystem(self, name: &str, fs_type: &str, mount_points: &[&str], fs_size: u64) -> Self {
        self.block_props(name, json!({"IdUsage": "filesystem", "IdType": fs_type}))
            .with_props(
                &block_path(name),
                InterfaceKind::Filesystem,
                json!({"MountPoints": mount_points, "Size": fs_size}),
            )
    }

    fn config(mut self, name: &str, entry: Value) -> Self {
        let path = block_path(name);
        let current = self
            .snapshot
            .interface(&path, InterfaceKind::Block)
            .and_then(|props| props.get("Configuration"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut entries = current;
        entries.push(entry);
        self = self.block_props(name, json!({"Configuration": entries}));
        self
    }

    pub fn fstab(self, name: &str, directory: &str, options: &str) -> Self {
        self.config(name, json!(["fstab", {"dir": directory, "opts": options}]))
    }

    pub fn crypttab(self, name: &str, options: &str) -> Self {
        self.config(name, json!(["crypttab", {"options": options}]))
    }

    pub fn swap(self, name: &str, active: bool) -> Self {
        self.block_props(name, json!({"IdUsage": "other", "IdType": "swap"}))
            .with_props(
                &block_path(name),
                InterfaceKind::Swapspace,
                json!({"Active": active}),
            )
    }

    /// LUKS container on `name` with `metadata_size` bytes of header.
    pub fn encrypted(self, name: &str, metadata_size: u64) -> Self {
        self.block_props(name, json!({"IdUsage": "crypto", "IdType": "crypto_LUKS", "IdVersion": "2"}))
            .with_props(
                &block_path(name),
                InterfaceKind::Encrypted,
                json!({"MetadataSize": metadata_size, "CleartextDevice": "/"}),
            )
    }

    /// Unlocked mapping `name` of the encrypted block `backing`.
    pub fn cleartext(self, name: &str, backing: &str, size: u64) -> Self {
        self.block(name, size)
            .block_props(name, json!({"CryptoBackingDevice": block_path(backing).as_str()}))
    }

    pub fn volume_group(self, vg: &str, size: u64, free: u64, extent_size: u64) -> Self {
        self.with_props(
            &vg_path(vg),
            InterfaceKind::VolumeGroup,
            json!({
                "Name": vg,
                "Size": size,
                "FreeSize": free,
                "ExtentSize": extent_size,
                "MissingPhysicalVolumes": [],
            }),
        )
    }

    pub fn physical_volume(self, name: &str, vg: &str, size: u64, free: u64) -> Self {
        self.block_props(name, json!({"IdUsage": "raid", "IdType": "LVM2_member"}))
            .with_props(
                &block_path(name),
                InterfaceKind::PhysicalVolume,
                json!({"VolumeGroup": vg_path(vg).as_str(), "Size": size, "FreeSize": free}),
            )
    }

    pub fn logical_volume(
        self,
        vg: &str,
        lv: &str,
        layout: &str,
        size: u64,
        structure: Value,
    ) -> Self {
        self.with_props(
            &lv_path(vg, lv),
            InterfaceKind::LogicalVolume,
            json!({
                "Name": lv,
                "VolumeGroup": vg_path(vg).as_str(),
                "Size": size,
                "Layout": layout,
                "Type": "block",
                "ThinPool": "/",
                "Active": true,
                "Structure": structure,
            }),
        )
    }

    pub fn thin_pool(self, vg: &str, lv: &str, size: u64) -> Self {
        self.logical_volume(vg, lv, "linear", size, Value::Null)
            .with_props(&lv_path(vg, lv), InterfaceKind::LogicalVolume, json!({"Type": "pool"}))
    }

    pub fn thin_volume(self, vg: &str, lv: &str, pool: &str, size: u64) -> Self {
        self.logical_volume(vg, lv, "thin", size, Value::Null).with_props(
            &lv_path(vg, lv),
            InterfaceKind::LogicalVolume,
            json!({"ThinPool": lv_path(vg, pool).as_str()}),
        )
    }

    pub fn inactive(self, vg: &str, lv: &str) -> Self {
        self.with_props(&lv_path(vg, lv), InterfaceKind::LogicalVolume, json!({"Active": false}))
    }

    /// Block `name` that is the active mapping of logical volume `vg/lv`.
    pub fn lv_block(self, name: &str, vg: &str, lv: &str, size: u64) -> Self {
        self.block(name, size).with_props(
            &block_path(name),
            InterfaceKind::LvmBlock,
            json!({"LogicalVolume": lv_path(vg, lv).as_str()}),
        )
    }

    pub fn mdraid(self, name: &str, level: &str, members: &[&str], array_block: Option<&str>) -> Self {
        let array = mdraid_path(name);
        let mut builder = self.with_props(
            &array,
            InterfaceKind::MdRaid,
            json!({"Name": name, "Level": level, "NumDevices": members.len(), "Degraded": 0}),
        );
        for member in members {
            builder = builder.block_props(
                member,
                json!({"IdUsage": "raid", "IdType": "linux_raid_member", "MDRaidMember": array.as_str()}),
            );
        }
        if let Some(block) = array_block {
            builder = builder.block_props(block, json!({"MDRaid": array.as_str()}));
        }
        builder
    }

    pub fn vdo(self, name: &str, backing: &str, physical_size: u64, logical_size: u64) -> Self {
        self.with_props(
            &vdo_path(name),
            InterfaceKind::Vdo,
            json!({
                "Name": name,
                "BackingBlock": block_path(backing).as_str(),
                "PhysicalSize": physical_size,
                "LogicalSize": logical_size,
            }),
        )
    }

    pub fn stratis_pool(self, name: &str, size: u64) -> Self {
        self.with_props(
            &stratis_pool_path(name),
            InterfaceKind::StratisPool,
            json!({
                "Name": name,
                "Uuid": format!("{name}-uuid"),
                "TotalPhysicalSize": size.to_string(),
                "TotalPhysicalUsed": "0",
                "Encrypted": false,
            }),
        )
    }

    /// Blockdev of `pool` living on block `name`.
    pub fn stratis_blockdev(self, name: &str, pool: &str, size: u64) -> Self {
        self.block_props(name, json!({"IdUsage": "", "IdType": "stratis"}))
            .with_props(
                &stratis_blockdev_path(name),
                InterfaceKind::StratisBlockdev,
                json!({
                    "Pool": stratis_pool_path(pool).as_str(),
                    "Uuid": format!("{name}-bd"),
                    "Tier": 0,
                    "PhysicalPath": format!("/dev/{name}"),
                    "TotalPhysicalSize": size.to_string(),
                }),
            )
    }

    /// Filesystem `fs` of `pool`, exposed as block `block`.
    pub fn stratis_filesystem(self, pool: &str, fs: &str, block: &str, size: u64) -> Self {
        let devnode = format!("/dev/stratis/{pool}/{fs}");
        self.block(block, size)
            .block_props(block, json!({"Symlinks": [devnode.clone()], "IdUsage": "filesystem", "IdType": "xfs"}))
            .with_props(
                &stratis_fs_path(pool, fs),
                InterfaceKind::StratisFilesystem,
                json!({
                    "Pool": stratis_pool_path(pool).as_str(),
                    "Name": fs,
                    "Devnode": devnode,
                    "Size": size.to_string(),
                    "Used": "0",
                }),
            )
    }

    pub fn btrfs(self, name: &str, uuid: &str, label: &str) -> Self {
        self.block_props(
            name,
            json!({"IdUsage": "filesystem", "IdType": "btrfs", "IdUUID": uuid, "IdLabel": label}),
        )
        .with_props(&block_path(name), InterfaceKind::Filesystem, json!({"MountPoints": [], "Size": 0}))
    }

    pub fn btrfs_subvolumes(mut self, uuid: &str, subvolumes: Vec<BtrfsSubvolume>) -> Self {
        self.snapshot
            .btrfs_subvolumes
            .insert(uuid.to_string(), subvolumes);
        self
    }

    pub fn resize_support(mut self, fs_type: &str, bits: u32) -> Self {
        self.snapshot
            .resize_support
            .insert(fs_type.to_string(), ResizeSupport::from_bits(bits));
        self
    }

    /// ext4 (online grow, offline shrink) and xfs (online grow only).
    pub fn common_resize_support(self) -> Self {
        self.resize_support("ext4", 2 | 4 | 16)
            .resize_support("xfs", 16)
    }

    pub fn build(self) -> ObjectSnapshot {
        self.snapshot
    }
}

/// Load a JSON snapshot fixture.
pub fn load_snapshot(path: &Path) -> Result<ObjectSnapshot> {
    let raw = fs::read_to_string(path).map_err(|error| TestingError::FixtureIo {
        path: path.to_path_buf(),
        reason: error.to_string(),
    })?;
    serde_json::from_str(&raw).map_err(|error| TestingError::FixtureInvalid {
        path: path.to_path_buf(),
        reason: error.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use storage_types::PropertiesExt;

    use super::*;

    #[test]
    fn partition_helper_fills_partition_interface() {
        let snapshot = SnapshotBuilder::new()
            .block("sda", 100)
            .partition_table("sda", "gpt")
            .partition("sda12", "sda", 1, 10)
            .build();

        let props = snapshot
            .interface(&block_path("sda12"), InterfaceKind::Partition)
            .expect("partition interface");
        assert_eq!(props.u64_prop("Number"), 12);
        assert_eq!(props.path_prop("Table"), Some(block_path("sda")));
    }

    #[test]
    fn configuration_entries_accumulate() {
        let snapshot = SnapshotBuilder::new()
            .block("sdb1", 10)
            .fstab("sdb1", "/data", "defaults")
            .crypttab("sdb1", "none")
            .build();
        let props = snapshot
            .interface(&block_path("sdb1"), InterfaceKind::Block)
            .expect("block interface");
        assert_eq!(
            props
                .get("Configuration")
                .and_then(Value::as_array)
                .map(Vec::len),
            Some(2)
        );
    }

    #[test]
    fn segments_are_laid_out_back_to_back() {
        let value = segments(&[(4, Some("sdb")), (6, None)]);
        assert_eq!(value[1][0], 4);
        assert_eq!(value[1][2], "/");
    }

    #[test]
    fn missing_fixture_is_reported() {
        let error = load_snapshot(Path::new("/nonexistent/snapshot.json")).expect_err("missing");
        assert!(matches!(error, TestingError::FixtureIo { .. }));
    }
}
