// SPDX-License-Identifier: GPL-3.0-only

use storage_types::{Block, DeviceKind, IdUsage};

use super::Index;

/// Most specific description of what `block` holds.
pub(crate) fn classify(index: &Index, block: &Block) -> DeviceKind {
    let content = content_kind(index, block);
    match index.blocks_lvol.get(&block.path) {
        Some(lvol) => DeviceKind::LvmLogicalVolume {
            lvol: lvol.clone(),
            content: Box::new(content),
        },
        None => content,
    }
}

fn content_kind(index: &Index, block: &Block) -> DeviceKind {
    let path = &block.path;

    if let Some(table) = index.partition_tables.get(path) {
        return DeviceKind::Partitioned {
            table_type: table.table_type,
        };
    }
    if index.crypto.contains_key(path) || block.id_usage == IdUsage::Crypto {
        return DeviceKind::Encrypted {
            cleartext: index.blocks_cleartext.get(path).cloned(),
        };
    }
    if let Some(pvol) = index.pvols.get(path) {
        return DeviceKind::LvmPhysicalVolume {
            group: pvol.group.clone(),
        };
    }
    if block.id_type == "LVM2_member" {
        return DeviceKind::LvmPhysicalVolume { group: None };
    }
    if let Some(blockdev) = index.blocks_stratis_blockdev.get(path) {
        return DeviceKind::StratisBlockdev {
            pool: index
                .stratis_blockdevs
                .get(blockdev)
                .and_then(|blockdev| blockdev.pool.clone()),
        };
    }
    if block.id_type == "stratis" {
        return DeviceKind::StratisBlockdev { pool: None };
    }
    if let Some(vdo) = index.blocks_vdo.get(path) {
        return DeviceKind::VdoBacking { vdo: vdo.clone() };
    }
    if block.mdraid_member.is_some() || block.id_usage == IdUsage::Raid {
        return DeviceKind::MdRaidMember {
            array: block.mdraid_member.clone(),
        };
    }
    if let Some(swap) = index.swaps.get(path) {
        return DeviceKind::Swap {
            active: swap.active,
        };
    }
    if block.id_type == "swap" {
        return DeviceKind::Swap { active: false };
    }
    if block.id_type == "btrfs" {
        return DeviceKind::BtrfsMember {
            uuid: block.id_uuid.clone(),
        };
    }
    if index.filesystems.contains_key(path) || block.id_usage == IdUsage::Filesystem {
        return DeviceKind::Plain {
            fs_type: block.id_type.clone(),
        };
    }
    if block.id_usage == IdUsage::Unknown && block.id_type.is_empty() {
        return DeviceKind::Unformatted;
    }
    DeviceKind::Unrecognized {
        id_type: block.id_type.clone(),
    }
}
