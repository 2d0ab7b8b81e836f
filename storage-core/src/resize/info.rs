// SPDX-License-Identifier: GPL-3.0-only

use storage_types::{DeviceKind, ObjectPath, ResizeInfo};

use crate::index::Index;

/// What resizing the volume whose content lives on `block` is allowed to do.
///
/// `block` is `None` for an inactive logical volume. With `to_fit` the
/// content keeps its size, so nothing prevents shrinking the volume to it.
pub fn get_resize_info(index: &Index, block: Option<&ObjectPath>, to_fit: bool) -> ResizeInfo {
    let Some(block) = block else {
        return ResizeInfo::unsupported("Activate before resizing");
    };

    let kind = index.kind(block).map(DeviceKind::content);
    let mut info = match kind {
        Some(DeviceKind::Encrypted {
            cleartext: Some(cleartext),
        }) => return get_resize_info(index, Some(cleartext), to_fit),
        Some(DeviceKind::Encrypted { cleartext: None }) => {
            ResizeInfo::unsupported("Unlock before resizing")
        }
        Some(DeviceKind::Plain { fs_type }) => filesystem_info(index, fs_type),
        Some(DeviceKind::BtrfsMember { .. }) => filesystem_info(index, "btrfs"),
        Some(DeviceKind::StratisBlockdev { .. }) => ResizeInfo {
            can_grow: true,
            shrink_excuse: Some("Stratis blockdevs can not be made smaller".to_string()),
            ..Default::default()
        },
        Some(DeviceKind::LvmPhysicalVolume { .. } | DeviceKind::MdRaidMember { .. }) => {
            ResizeInfo::unsupported("Physical volumes can not be resized here")
        }
        Some(DeviceKind::VdoBacking { .. }) => ResizeInfo {
            can_grow: true,
            shrink_excuse: Some("VDO backing devices can not be made smaller".to_string()),
            ..Default::default()
        },
        Some(DeviceKind::Swap { .. }) => ResizeInfo::unsupported("Swap can not be resized here"),
        Some(DeviceKind::Unformatted) => ResizeInfo {
            can_shrink: true,
            can_grow: true,
            ..Default::default()
        },
        Some(other @ DeviceKind::Partitioned { .. }) => {
            ResizeInfo::unsupported(format!("{} can not be resized here", other.label()))
        }
        Some(DeviceKind::Unrecognized { .. } | DeviceKind::LvmLogicalVolume { .. }) | None => {
            ResizeInfo {
                can_grow: true,
                grow_needs_unmount: true,
                shrink_excuse: Some("Unrecognized data can not be made smaller here".to_string()),
                ..Default::default()
            }
        }
    };

    if to_fit {
        info.shrink_excuse = None;
    }
    info
}

fn filesystem_info(index: &Index, fs_type: &str) -> ResizeInfo {
    let Some(support) = index.resize_support.get(fs_type) else {
        return ResizeInfo::unsupported(format!("{fs_type} can not be resized here"));
    };

    let mut info = ResizeInfo {
        can_shrink: support.can_shrink,
        can_grow: support.can_grow,
        shrink_needs_unmount: support.shrink_needs_unmount,
        grow_needs_unmount: support.grow_needs_unmount,
        ..Default::default()
    };
    if !support.can_shrink && !support.can_grow {
        let excuse = format!("{fs_type} can not be resized");
        info.shrink_excuse = Some(excuse.clone());
        info.grow_excuse = Some(excuse);
    } else {
        if !support.can_shrink {
            info.shrink_excuse = Some(format!("{fs_type} can not be made smaller"));
        }
        if !support.can_grow {
            info.grow_excuse = Some(format!("{fs_type} can not be made larger"));
        }
    }
    info
}

#[cfg(test)]
mod tests {
    use storage_testing::fixtures::{SnapshotBuilder, block_path};
    use storage_types::{MIB, ResizeDirection};

    use super::*;

    fn info_for(builder: SnapshotBuilder, name: &str, to_fit: bool) -> ResizeInfo {
        let index = Index::build(&builder.common_resize_support().build(), MIB);
        get_resize_info(&index, Some(&block_path(name)), to_fit)
    }

    #[test]
    fn unlocked_crypto_reports_its_content() {
        let info = info_for(
            SnapshotBuilder::new()
                .block("sda1", 100 * MIB)
                .encrypted("sda1", 16 * MIB)
                .cleartext("dm-0", "sda1", 84 * MIB)
                .filesystem("dm-0", "ext4", &["/data"], 84 * MIB),
            "sda1",
            false,
        );
        assert!(info.can_shrink);
        assert!(info.shrink_needs_unmount);
        assert!(!info.grow_needs_unmount);
        assert_eq!(info.excuse(ResizeDirection::Grow), None);
    }

    #[test]
    fn locked_crypto_must_be_unlocked() {
        let info = info_for(
            SnapshotBuilder::new()
                .block("sda1", 100 * MIB)
                .encrypted("sda1", 16 * MIB),
            "sda1",
            false,
        );
        assert_eq!(info.excuse(ResizeDirection::Grow), Some("Unlock before resizing"));
    }

    #[test]
    fn xfs_can_not_shrink_unless_to_fit() {
        let builder = SnapshotBuilder::new()
            .block("sdb1", 100 * MIB)
            .filesystem("sdb1", "xfs", &[], 100 * MIB);

        let info = info_for(builder.clone(), "sdb1", false);
        assert_eq!(info.shrink_excuse.as_deref(), Some("xfs can not be made smaller"));
        assert!(info.grow_excuse.is_none());

        assert!(info_for(builder, "sdb1", true).shrink_excuse.is_none());
    }

    #[test]
    fn unknown_filesystem_type_can_not_be_resized() {
        let info = info_for(
            SnapshotBuilder::new()
                .block("sdb1", 100 * MIB)
                .filesystem("sdb1", "vfat", &[], 100 * MIB),
            "sdb1",
            false,
        );
        assert_eq!(info.grow_excuse.as_deref(), Some("vfat can not be resized here"));
    }

    #[test]
    fn content_kinds_map_to_fixed_answers() {
        let builder = SnapshotBuilder::new()
            .block("sdc", 100 * MIB)
            .swap("sdc", false)
            .block("sdd", 100 * MIB)
            .block("sde", 100 * MIB)
            .with_props(
                &block_path("sde"),
                storage_types::InterfaceKind::Block,
                serde_json::json!({"IdUsage": "other", "IdType": "bitlocker"}),
            )
            .block("sdf", 100 * MIB)
            .volume_group("vg0", 100 * MIB, 0, 4 * MIB)
            .physical_volume("sdf", "vg0", 100 * MIB, 0);

        let swap = info_for(builder.clone(), "sdc", false);
        assert_eq!(swap.grow_excuse.as_deref(), Some("Swap can not be resized here"));

        let empty = info_for(builder.clone(), "sdd", false);
        assert!(empty.can_shrink && empty.can_grow);
        assert!(!empty.shrink_needs_unmount && !empty.grow_needs_unmount);

        let unknown = info_for(builder.clone(), "sde", false);
        assert!(unknown.can_grow && unknown.grow_needs_unmount);
        assert_eq!(
            unknown.shrink_excuse.as_deref(),
            Some("Unrecognized data can not be made smaller here")
        );

        let pvol = info_for(builder, "sdf", false);
        assert_eq!(
            pvol.shrink_excuse.as_deref(),
            Some("Physical volumes can not be resized here")
        );
    }

    #[test]
    fn inactive_volume_must_be_activated() {
        let info = get_resize_info(&Index::default(), None, false);
        assert_eq!(info.shrink_excuse.as_deref(), Some("Activate before resizing"));
        assert_eq!(info.grow_excuse.as_deref(), Some("Activate before resizing"));
    }
}
