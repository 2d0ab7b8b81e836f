// SPDX-License-Identifier: GPL-3.0-only

use std::collections::BTreeMap;

use storage_types::{Block, Drive, ObjectPath, Partition};

#[derive(Debug, Default)]
pub(crate) struct DriveBlocks {
    pub drives_block: BTreeMap<ObjectPath, ObjectPath>,
    pub drives_multipath_blocks: BTreeMap<ObjectPath, Vec<ObjectPath>>,
    pub broken_multipath_present: bool,
}

/// Pick the block that represents each drive.
///
/// A multipath master claims its drive; every other whole-disk block is a
/// path member. A drive without master but with a single member uses that
/// member, which then no longer counts as a path. Several members and no
/// master means multipathd is not running. Blocks referring to a drive that
/// is not known are left out.
pub(crate) fn group_drive_blocks(
    blocks: &BTreeMap<ObjectPath, Block>,
    drives: &BTreeMap<ObjectPath, Drive>,
    partitions: &BTreeMap<ObjectPath, Partition>,
) -> DriveBlocks {
    let mut result = DriveBlocks::default();

    for (path, block) in blocks {
        if partitions.contains_key(path) || block.is_emmc_special() {
            continue;
        }
        let Some(drive) = block.drive.as_ref().filter(|drive| drives.contains_key(*drive)) else {
            continue;
        };
        if block.is_multipath_master() {
            result.drives_block.insert(drive.clone(), path.clone());
        } else {
            result
                .drives_multipath_blocks
                .entry(drive.clone())
                .or_default()
                .push(path.clone());
        }
    }

    for (drive, members) in &mut result.drives_multipath_blocks {
        members.sort_by(|a, b| device_name(blocks, a).cmp(device_name(blocks, b)));
        if result.drives_block.contains_key(drive) {
            continue;
        }
        if members.len() == 1 {
            result.drives_block.insert(drive.clone(), members.remove(0));
        } else {
            tracing::warn!(%drive, paths = members.len(), "drive has several paths but no multipath device");
            result.broken_multipath_present = true;
        }
    }

    result
}

fn device_name<'a>(blocks: &'a BTreeMap<ObjectPath, Block>, path: &ObjectPath) -> &'a str {
    blocks
        .get(path)
        .map(|block| block.device.as_str())
        .unwrap_or_default()
}
