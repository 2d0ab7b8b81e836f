// SPDX-License-Identifier: GPL-3.0-only

//! Loosely typed remote objects as mirrored by the object cache.
//!
//! Property values are kept as `serde_json::Value` so that a partially
//! populated or newer remote object never fails to load. Typed records are
//! derived from these maps by the index builder.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::btrfs::BtrfsSubvolume;
use crate::filesystem::ResizeSupport;
use crate::path::ObjectPath;

/// Interfaces a remote object may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceKind {
    Block,
    Drive,
    Partition,
    PartitionTable,
    Filesystem,
    Swapspace,
    Encrypted,
    MdRaid,
    /// Logical-volume facet of a block device.
    LvmBlock,
    PhysicalVolume,
    VolumeGroup,
    LogicalVolume,
    Vdo,
    StratisPool,
    StratisBlockdev,
    StratisFilesystem,
}

impl InterfaceKind {
    pub const ALL: [InterfaceKind; 16] = [
        Self::Block,
        Self::Drive,
        Self::Partition,
        Self::PartitionTable,
        Self::Filesystem,
        Self::Swapspace,
        Self::Encrypted,
        Self::MdRaid,
        Self::LvmBlock,
        Self::PhysicalVolume,
        Self::VolumeGroup,
        Self::LogicalVolume,
        Self::Vdo,
        Self::StratisPool,
        Self::StratisBlockdev,
        Self::StratisFilesystem,
    ];

    /// Fully qualified interface name on the bus.
    pub fn interface_name(self) -> &'static str {
        match self {
            Self::Block => "org.freedesktop.UDisks2.Block",
            Self::Drive => "org.freedesktop.UDisks2.Drive",
            Self::Partition => "org.freedesktop.UDisks2.Partition",
            Self::PartitionTable => "org.freedesktop.UDisks2.PartitionTable",
            Self::Filesystem => "org.freedesktop.UDisks2.Filesystem",
            Self::Swapspace => "org.freedesktop.UDisks2.Swapspace",
            Self::Encrypted => "org.freedesktop.UDisks2.Encrypted",
            Self::MdRaid => "org.freedesktop.UDisks2.MDRaid",
            Self::LvmBlock => "org.freedesktop.UDisks2.Block.LVM2",
            Self::PhysicalVolume => "org.freedesktop.UDisks2.PhysicalVolume",
            Self::VolumeGroup => "org.freedesktop.UDisks2.VolumeGroup",
            Self::LogicalVolume => "org.freedesktop.UDisks2.LogicalVolume",
            Self::Vdo => "org.storage.LegacyVdo",
            Self::StratisPool => "org.storage.stratis3.pool",
            Self::StratisBlockdev => "org.storage.stratis3.blockdev",
            Self::StratisFilesystem => "org.storage.stratis3.filesystem",
        }
    }
}

pub type Properties = BTreeMap<String, Value>;

/// Tolerant accessors over a property map. Missing or mistyped values
/// decode to the type's empty value instead of failing.
pub trait PropertiesExt {
    fn str_prop(&self, key: &str) -> String;
    fn u64_prop(&self, key: &str) -> u64;
    fn opt_u64_prop(&self, key: &str) -> Option<u64>;
    fn bool_prop(&self, key: &str) -> bool;
    fn path_prop(&self, key: &str) -> Option<ObjectPath>;
    fn paths_prop(&self, key: &str) -> Vec<ObjectPath>;
    fn strings_prop(&self, key: &str) -> Vec<String>;
}

impl PropertiesExt for Properties {
    fn str_prop(&self, key: &str) -> String {
        self.get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    fn u64_prop(&self, key: &str) -> u64 {
        self.opt_u64_prop(key).unwrap_or(0)
    }

    fn opt_u64_prop(&self, key: &str) -> Option<u64> {
        match self.get(key)? {
            Value::Number(number) => number.as_u64(),
            // Sizes above 2^53 may arrive as strings from JSON front ends.
            Value::String(text) => text.parse().ok(),
            _ => None,
        }
    }

    fn bool_prop(&self, key: &str) -> bool {
        self.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    fn path_prop(&self, key: &str) -> Option<ObjectPath> {
        self.get(key)
            .and_then(Value::as_str)
            .and_then(ObjectPath::from_ref)
    }

    fn paths_prop(&self, key: &str) -> Vec<ObjectPath> {
        self.strings_prop(key)
            .iter()
            .filter_map(|path| ObjectPath::from_ref(path))
            .collect()
    }

    fn strings_prop(&self, key: &str) -> Vec<String> {
        self.get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// A remote object with all of its interfaces.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteObject {
    pub path: ObjectPath,
    pub interfaces: BTreeMap<InterfaceKind, Properties>,
}

/// Serializable content of the object cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectSnapshot {
    #[serde(default)]
    pub objects: BTreeMap<ObjectPath, BTreeMap<InterfaceKind, Properties>>,

    /// Resize support per filesystem type, as reported by the service.
    #[serde(default)]
    pub resize_support: BTreeMap<String, ResizeSupport>,

    /// Polled Btrfs subvolume lists keyed by volume uuid.
    #[serde(default)]
    pub btrfs_subvolumes: BTreeMap<String, Vec<BtrfsSubvolume>>,
}

impl ObjectSnapshot {
    pub fn interface(&self, path: &ObjectPath, kind: InterfaceKind) -> Option<&Properties> {
        self.objects.get(path)?.get(&kind)
    }

    /// Paths of all objects carrying `kind`, in path order.
    pub fn paths_with(&self, kind: InterfaceKind) -> impl Iterator<Item = &ObjectPath> {
        self.objects
            .iter()
            .filter(move |(_, interfaces)| interfaces.contains_key(&kind))
            .map(|(path, _)| path)
    }

    pub fn insert(&mut self, object: RemoteObject) {
        self.objects
            .entry(object.path)
            .or_default()
            .extend(object.interfaces);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "properties")]
pub enum Change {
    Added(Properties),
    /// Only the listed properties changed; the rest stay as they were.
    Changed(Properties),
    Removed,
}

/// One change notification from the remote object system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub path: ObjectPath,
    pub interface: InterfaceKind,
    pub change: Change,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn props(value: Value) -> Properties {
        serde_json::from_value(value).expect("property map")
    }

    #[test]
    fn accessors_tolerate_missing_and_mistyped_values() {
        let map = props(json!({
            "Size": "18446744073709551615",
            "ReadOnly": "yes",
            "Drive": "/",
            "Symlinks": ["/dev/disk/by-id/a", 7],
        }));

        assert_eq!(map.u64_prop("Size"), u64::MAX);
        assert!(!map.bool_prop("ReadOnly"));
        assert_eq!(map.path_prop("Drive"), None);
        assert_eq!(map.strings_prop("Symlinks"), vec!["/dev/disk/by-id/a"]);
        assert_eq!(map.str_prop("Device"), "");
        assert_eq!(map.opt_u64_prop("Missing"), None);
    }

    #[test]
    fn snapshot_serializes_interface_keys_as_names() {
        let mut snapshot = ObjectSnapshot::default();
        snapshot.insert(RemoteObject {
            path: ObjectPath::new("/block_devices/sda"),
            interfaces: BTreeMap::from([(InterfaceKind::Block, props(json!({"Size": 1})))]),
        });

        let json = serde_json::to_value(&snapshot).expect("serialize snapshot");
        assert_eq!(json["objects"]["/block_devices/sda"]["block"]["Size"], 1);

        let parsed: ObjectSnapshot = serde_json::from_value(json).expect("deserialize snapshot");
        assert_eq!(parsed, snapshot);
    }
}
