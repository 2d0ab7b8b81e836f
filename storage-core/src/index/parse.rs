// SPDX-License-Identifier: GPL-3.0-only

//! Decoding of loosely typed property maps into typed records.
//!
//! Every decoder is total: absent or malformed properties produce empty
//! values, which downstream code reads as "cannot determine".

use serde_json::Value;

use storage_types::{
    Block, BlockdevTier, ConfigEntry, ConfigKind, CryptoContainer, Drive, Filesystem, IdUsage,
    LogicalVolume, LvLayout, LvmStructure, MdRaid, ObjectPath, Partition, PartitionTable,
    PartitionTableType, PhysicalVolume, Properties, PropertiesExt, Segment, StratisBlockdev,
    StratisFilesystem, StratisPool, Swap, VdoVolume, VolumeGroup,
};

pub(crate) fn block(path: &ObjectPath, props: &Properties) -> Block {
    Block {
        path: path.clone(),
        device: props.str_prop("Device"),
        preferred_device: props.str_prop("PreferredDevice"),
        symlinks: props.strings_prop("Symlinks"),
        size: props.u64_prop("Size"),
        read_only: props.bool_prop("ReadOnly"),
        drive: props.path_prop("Drive"),
        id_usage: IdUsage::parse(&props.str_prop("IdUsage")),
        id_type: props.str_prop("IdType"),
        id_uuid: props.str_prop("IdUUID"),
        id_version: props.str_prop("IdVersion"),
        id_label: props.str_prop("IdLabel"),
        crypto_backing_device: props.path_prop("CryptoBackingDevice"),
        mdraid: props.path_prop("MDRaid"),
        mdraid_member: props.path_prop("MDRaidMember"),
        configuration: configuration(props.get("Configuration")),
    }
}

/// `Configuration` is a list of `[type, {key: value}]` pairs.
fn configuration(value: Option<&Value>) -> Vec<ConfigEntry> {
    let Some(items) = value.and_then(Value::as_array) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let pair = item.as_array()?;
            let kind = match pair.first()?.as_str()? {
                "fstab" => ConfigKind::Fstab,
                "crypttab" => ConfigKind::Crypttab,
                _ => return None,
            };
            let details = pair.get(1)?.as_object()?;
            let text = |key: &str| details.get(key).and_then(Value::as_str).map(str::to_string);
            Some(ConfigEntry {
                kind,
                directory: text("dir"),
                options: text("opts").or_else(|| text("options")).unwrap_or_default(),
            })
        })
        .collect()
}

pub(crate) fn drive(path: &ObjectPath, props: &Properties) -> Drive {
    Drive {
        path: path.clone(),
        vendor: props.str_prop("Vendor"),
        model: props.str_prop("Model"),
        serial: props.str_prop("Serial"),
        size: props.u64_prop("Size"),
        removable: props.bool_prop("Removable"),
    }
}

pub(crate) fn partition(path: &ObjectPath, props: &Properties) -> Partition {
    Partition {
        block: path.clone(),
        table: props.path_prop("Table"),
        number: props.u64_prop("Number") as u32,
        offset: props.u64_prop("Offset"),
        size: props.u64_prop("Size"),
        name: props.str_prop("Name"),
        type_id: props.str_prop("Type"),
        is_container: props.bool_prop("IsContainer"),
        is_contained: props.bool_prop("IsContained"),
    }
}

pub(crate) fn partition_table(path: &ObjectPath, props: &Properties) -> PartitionTable {
    PartitionTable {
        block: path.clone(),
        table_type: PartitionTableType::parse(&props.str_prop("Type")),
    }
}

pub(crate) fn filesystem(path: &ObjectPath, props: &Properties) -> Filesystem {
    Filesystem {
        block: path.clone(),
        mount_points: props.strings_prop("MountPoints"),
        size: props.u64_prop("Size"),
    }
}

pub(crate) fn swap(path: &ObjectPath, props: &Properties) -> Swap {
    Swap {
        block: path.clone(),
        active: props.bool_prop("Active"),
    }
}

pub(crate) fn crypto(path: &ObjectPath, props: &Properties) -> CryptoContainer {
    CryptoContainer {
        block: path.clone(),
        cleartext: props.path_prop("CleartextDevice"),
        metadata_size: props.u64_prop("MetadataSize"),
        hint_encryption_type: props.str_prop("HintEncryptionType"),
    }
}

pub(crate) fn mdraid(path: &ObjectPath, props: &Properties) -> MdRaid {
    MdRaid {
        path: path.clone(),
        name: props.str_prop("Name"),
        level: props.str_prop("Level"),
        size: props.u64_prop("Size"),
        num_devices: props.u64_prop("NumDevices") as u32,
        degraded: props.u64_prop("Degraded") as u32,
        running: false,
    }
}

pub(crate) fn volume_group(path: &ObjectPath, props: &Properties) -> VolumeGroup {
    VolumeGroup {
        path: path.clone(),
        name: props.str_prop("Name"),
        size: props.u64_prop("Size"),
        free_size: props.u64_prop("FreeSize"),
        extent_size: props.u64_prop("ExtentSize"),
        missing_pvs: props.strings_prop("MissingPhysicalVolumes"),
    }
}

pub(crate) fn physical_volume(path: &ObjectPath, props: &Properties) -> PhysicalVolume {
    PhysicalVolume {
        block: path.clone(),
        group: props.path_prop("VolumeGroup"),
        size: props.u64_prop("Size"),
        free_size: props.u64_prop("FreeSize"),
    }
}

pub(crate) fn logical_volume(path: &ObjectPath, props: &Properties) -> LogicalVolume {
    let layout = if props.str_prop("Type") == "pool" {
        LvLayout::ThinPool
    } else {
        LvLayout::parse(&props.str_prop("Layout"))
    };

    LogicalVolume {
        path: path.clone(),
        name: props.str_prop("Name"),
        group: props.path_prop("VolumeGroup"),
        size: props.u64_prop("Size"),
        layout,
        thin_pool: props.path_prop("ThinPool"),
        active: props.bool_prop("Active"),
        structure: props.get("Structure").and_then(structure),
    }
}

fn structure(value: &Value) -> Option<LvmStructure> {
    let object = value.as_object()?;
    let nested = |key: &str| {
        object
            .get(key)
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(structure).collect::<Vec<_>>())
    };

    Some(LvmStructure {
        layout_type: object
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        size: object.get("size").and_then(Value::as_u64).unwrap_or(0),
        segments: object
            .get("segments")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(segment).collect()),
        data: nested("data"),
        metadata: nested("metadata"),
    })
}

/// Segments travel as `[start, size, pv_path]` triples.
fn segment(value: &Value) -> Option<Segment> {
    let triple = value.as_array()?;
    Some(Segment {
        start: triple.first()?.as_u64()?,
        size: triple.get(1)?.as_u64()?,
        pv: triple
            .get(2)
            .and_then(Value::as_str)
            .and_then(ObjectPath::from_ref),
    })
}

pub(crate) fn vdo(path: &ObjectPath, props: &Properties) -> VdoVolume {
    VdoVolume {
        path: path.clone(),
        name: props.str_prop("Name"),
        backing: props.path_prop("BackingBlock"),
        physical_size: props.u64_prop("PhysicalSize"),
        logical_size: props.u64_prop("LogicalSize"),
    }
}

pub(crate) fn stratis_pool(path: &ObjectPath, props: &Properties) -> StratisPool {
    StratisPool {
        path: path.clone(),
        name: props.str_prop("Name"),
        uuid: props.str_prop("Uuid"),
        total_physical_size: props.u64_prop("TotalPhysicalSize"),
        total_physical_used: props.u64_prop("TotalPhysicalUsed"),
        encrypted: props.bool_prop("Encrypted"),
    }
}

pub(crate) fn stratis_blockdev(path: &ObjectPath, props: &Properties) -> StratisBlockdev {
    StratisBlockdev {
        path: path.clone(),
        pool: props.path_prop("Pool"),
        uuid: props.str_prop("Uuid"),
        tier: BlockdevTier::from_code(props.u64_prop("Tier")),
        physical_path: props.str_prop("PhysicalPath"),
        total_physical_size: props.u64_prop("TotalPhysicalSize"),
    }
}

pub(crate) fn stratis_filesystem(path: &ObjectPath, props: &Properties) -> StratisFilesystem {
    StratisFilesystem {
        path: path.clone(),
        pool: props.path_prop("Pool"),
        name: props.str_prop("Name"),
        devnode: props.str_prop("Devnode"),
        size: props.u64_prop("Size"),
        used: props.u64_prop("Used"),
        size_limit: props.opt_u64_prop("SizeLimit"),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn props(value: Value) -> Properties {
        serde_json::from_value(value).expect("property map")
    }

    #[test]
    fn block_configuration_is_decoded() {
        let parsed = block(
            &ObjectPath::new("/block_devices/sda1"),
            &props(json!({
                "Device": "/dev/sda1",
                "IdUsage": "filesystem",
                "IdType": "ext4",
                "Configuration": [
                    ["fstab", {"dir": "/data", "opts": "defaults"}],
                    ["crypttab", {"options": "discard"}],
                    ["bogus", {}],
                ],
            })),
        );

        assert_eq!(parsed.id_usage, IdUsage::Filesystem);
        assert_eq!(parsed.configuration.len(), 2);
        assert_eq!(parsed.fstab_entries().count(), 1);
        assert_eq!(
            parsed.crypttab_entries().next().map(|entry| entry.options.as_str()),
            Some("discard")
        );
    }

    #[test]
    fn raid_structure_keeps_missing_segments() {
        let lvol = logical_volume(
            &ObjectPath::new("/lvm/vg0/mirror"),
            &props(json!({
                "Name": "mirror",
                "Layout": "raid1",
                "Type": "block",
                "Structure": {
                    "type": "raid1",
                    "size": 100,
                    "data": [
                        {"type": "linear", "size": 100, "segments": [[0, 100, "/pvs/a"]]},
                        {"type": "linear", "size": 100, "segments": [[0, 100, "/"]]},
                    ],
                },
            })),
        );

        assert_eq!(lvol.layout, LvLayout::Raid1);
        let structure = lvol.structure.expect("structure");
        let data = structure.data.expect("data legs");
        assert_eq!(data.len(), 2);
        assert_eq!(data[1].segments.as_ref().expect("segments")[0].pv, None);
        assert_eq!(structure.metadata, None);
    }

    #[test]
    fn pool_type_wins_over_layout() {
        let lvol = logical_volume(
            &ObjectPath::new("/lvm/vg0/pool"),
            &props(json!({"Type": "pool", "Layout": "linear"})),
        );
        assert!(lvol.is_thin_pool());
    }
}
