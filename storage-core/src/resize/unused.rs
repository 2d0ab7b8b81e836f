// SPDX-License-Identifier: GPL-3.0-only

use storage_types::{MIB, ObjectPath, UnusedSpace};

use crate::index::Index;

/// Detect a volume whose content is noticeably smaller than the volume.
///
/// Only partitions and logical volumes qualify. A volume whose size does not
/// match its block is mid-resize and is ignored.
pub fn check_unused_space(index: &Index, block: &ObjectPath) -> Option<UnusedSpace> {
    let device = index.blocks.get(block)?;

    let (size, min_change) = if let Some(lvol) = index
        .blocks_lvol
        .get(block)
        .and_then(|lvol| index.lvols.get(lvol))
    {
        let extent = lvol
            .group
            .as_ref()
            .and_then(|group| index.vgroups.get(group))
            .map(|group| group.extent_size)
            .unwrap_or(MIB);
        (lvol.size, extent)
    } else if let Some(partition) = index.partitions.get(block) {
        (partition.size, MIB)
    } else {
        return None;
    };

    if size != device.size {
        tracing::trace!(%block, size, block_size = device.size, "volume and block disagree");
        return None;
    }

    let (content, overhead) = match index.crypto.get(block) {
        Some(crypto) => (crypto.cleartext.as_ref()?, crypto.metadata_size),
        None => (block, 0),
    };

    let unused = |content_size: u64| {
        let slack = size.checked_sub(content_size)?.checked_sub(overhead)?;
        (slack > min_change).then_some(UnusedSpace {
            volume_size: size - overhead,
            content_size,
        })
    };

    if let Some(filesystem) = index.filesystems.get(content)
        && filesystem.size > 0
        && index
            .blocks
            .get(content)
            .is_some_and(|content| index.resize_support.contains_key(&content.id_type))
        && let Some(space) = unused(filesystem.size)
    {
        return Some(space);
    }

    if let Some(vdo) = index.blocks_vdo.get(content).and_then(|vdo| index.vdos.get(vdo))
        && let Some(space) = unused(vdo.physical_size)
    {
        return Some(space);
    }

    index
        .blocks_stratis_blockdev
        .get(content)
        .and_then(|blockdev| index.stratis_blockdevs.get(blockdev))
        .and_then(|blockdev| unused(blockdev.total_physical_size))
}

#[cfg(test)]
mod tests {
    use storage_testing::fixtures::{SnapshotBuilder, block_path};

    use super::*;

    fn partitioned(builder: SnapshotBuilder) -> Index {
        let snapshot = builder
            .block("sda", 1000 * MIB)
            .partition_table("sda", "gpt")
            .common_resize_support()
            .build();
        Index::build(&snapshot, MIB)
    }

    #[test]
    fn small_filesystem_on_partition_is_reported() {
        let index = partitioned(
            SnapshotBuilder::new()
                .partition("sda1", "sda", MIB, 500 * MIB)
                .filesystem("sda1", "ext4", &["/data"], 300 * MIB),
        );

        let space = check_unused_space(&index, &block_path("sda1")).expect("unused space");
        assert_eq!(space.volume_size, 500 * MIB);
        assert_eq!(space.content_size, 300 * MIB);
        assert_eq!(space.unused(), 200 * MIB);
    }

    #[test]
    fn encryption_overhead_is_not_unused() {
        let index = partitioned(
            SnapshotBuilder::new()
                .partition("sda1", "sda", MIB, 500 * MIB)
                .encrypted("sda1", 16 * MIB)
                .cleartext("dm-0", "sda1", 484 * MIB)
                .filesystem("dm-0", "ext4", &[], 484 * MIB),
        );
        assert_eq!(check_unused_space(&index, &block_path("sda1")), None);

        let index = partitioned(
            SnapshotBuilder::new()
                .partition("sda1", "sda", MIB, 500 * MIB)
                .encrypted("sda1", 16 * MIB)
                .cleartext("dm-0", "sda1", 484 * MIB)
                .filesystem("dm-0", "ext4", &[], 400 * MIB),
        );
        let space = check_unused_space(&index, &block_path("sda1")).expect("unused space");
        assert_eq!(space.volume_size, 484 * MIB);
        assert_eq!(space.content_size, 400 * MIB);
    }

    #[test]
    fn slack_within_one_step_is_ignored() {
        let index = partitioned(
            SnapshotBuilder::new()
                .partition("sda1", "sda", MIB, 500 * MIB)
                .filesystem("sda1", "ext4", &[], 499 * MIB),
        );
        assert_eq!(check_unused_space(&index, &block_path("sda1")), None);
    }

    #[test]
    fn filesystem_without_resize_tooling_is_ignored() {
        let index = partitioned(
            SnapshotBuilder::new()
                .partition("sda1", "sda", MIB, 500 * MIB)
                .filesystem("sda1", "vfat", &[], 100 * MIB),
        );
        assert_eq!(check_unused_space(&index, &block_path("sda1")), None);
    }

    #[test]
    fn vdo_and_stratis_backings_count_their_physical_size() {
        let index = partitioned(
            SnapshotBuilder::new()
                .partition("sda1", "sda", MIB, 500 * MIB)
                .vdo("vdo0", "sda1", 200 * MIB, 1000 * MIB)
                .partition("sda2", "sda", 501 * MIB, 400 * MIB)
                .stratis_pool("tank", 100 * MIB)
                .stratis_blockdev("sda2", "tank", 100 * MIB),
        );

        let vdo = check_unused_space(&index, &block_path("sda1")).expect("vdo slack");
        assert_eq!(vdo.content_size, 200 * MIB);

        let stratis = check_unused_space(&index, &block_path("sda2")).expect("stratis slack");
        assert_eq!(stratis.content_size, 100 * MIB);
        assert_eq!(stratis.volume_size, 400 * MIB);
    }

    #[test]
    fn whole_disks_are_not_checked() {
        let index = partitioned(SnapshotBuilder::new().filesystem("sda", "ext4", &[], MIB));
        assert_eq!(check_unused_space(&index, &block_path("sda")), None);
    }
}
