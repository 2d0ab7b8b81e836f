// SPDX-License-Identifier: GPL-3.0-only

use std::collections::BTreeMap;

use storage_types::{Block, BtrfsSubvolume, BtrfsVolume, Filesystem, ObjectPath, SubvolumeTree};

/// Group Btrfs member blocks into volumes by filesystem uuid.
pub(crate) fn group_volumes(
    blocks: &BTreeMap<ObjectPath, Block>,
    filesystems: &BTreeMap<ObjectPath, Filesystem>,
    subvolumes: &BTreeMap<String, Vec<BtrfsSubvolume>>,
) -> BTreeMap<String, BtrfsVolume> {
    let mut members: BTreeMap<String, Vec<&Block>> = BTreeMap::new();
    for block in blocks.values() {
        if block.id_type == "btrfs" && !block.id_uuid.is_empty() {
            members.entry(block.id_uuid.clone()).or_default().push(block);
        }
    }

    members
        .into_iter()
        .filter_map(|(uuid, blocks)| {
            let representative = blocks
                .iter()
                .find(|block| {
                    filesystems
                        .get(&block.path)
                        .is_some_and(Filesystem::is_mounted)
                })
                .or_else(|| blocks.first())?;
            let volume = BtrfsVolume {
                uuid: uuid.clone(),
                label: representative.id_label.clone(),
                members: blocks.iter().map(|block| block.path.clone()).collect(),
                representative: representative.path.clone(),
                subvolumes: subvolumes
                    .get(&uuid)
                    .map(|list| SubvolumeTree::build(list))
                    .unwrap_or_default(),
            };
            Some((uuid, volume))
        })
        .collect()
}
