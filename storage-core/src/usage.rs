// SPDX-License-Identifier: GPL-3.0-only

//! What is using a device, and what it takes to free it.
//!
//! [`resolve`] walks the index upwards from the target through every stacked
//! layer. [`attach_processes`] then asks the mount helper about open files,
//! which is the only part that needs the live system.

use storage_contracts::MountHelper;
use storage_types::{
    ActionVerb, ConfigEntry, DeviceKind, ObjectPath, TeardownVerb, UsageEntry, UsageKind,
    UsageList, UsageRequest, UsageTarget,
};

use crate::config::CoreConfig;
use crate::error::Result;
use crate::index::Index;

struct Resolver<'a> {
    index: &'a Index,
    config: &'a CoreConfig,
    target: &'a UsageTarget,
    request: UsageRequest,
    entries: Vec<UsageEntry>,
}

/// Compute the usage list for `request` on `target`.
pub fn resolve(
    index: &Index,
    config: &CoreConfig,
    target: &UsageTarget,
    request: UsageRequest,
) -> UsageList {
    let mut resolver = Resolver {
        index,
        config,
        target,
        request,
        entries: Vec::new(),
    };

    match target {
        UsageTarget::Block(block) => resolver.block(block, 0),
        UsageTarget::Drive(drive) => {
            if let Some(block) = index.drives_block.get(drive) {
                resolver.block(block, 0);
            } else {
                for block in index.drives_multipath_blocks.get(drive).into_iter().flatten() {
                    resolver.block(block, 0);
                }
            }
        }
        UsageTarget::LogicalVolume(lvol) => resolver.lvol(lvol, 0),
        UsageTarget::VolumeGroup(group) => {
            for lvol in index.vgroups_lvols.get(group).into_iter().flatten() {
                resolver.lvol(lvol, 1);
            }
        }
        UsageTarget::StratisPool(pool) => {
            for filesystem in index.stratis_pool_filesystems.get(pool).into_iter().flatten() {
                let block = index
                    .blocks_stratis_fsys
                    .iter()
                    .find(|(_, fsys)| *fsys == filesystem)
                    .map(|(block, _)| block.clone());
                if let Some(block) = block {
                    resolver.block(&block, 1);
                }
            }
        }
        UsageTarget::MdRaid(array) => {
            if let Some(block) = index.mdraids_block.get(array) {
                resolver.block(block, 0);
            }
        }
    }

    let mut usage = UsageList::new(target.clone(), request);
    usage.entries = resolver.entries;
    tracing::debug!(
        target = %target.path(),
        action = %request.action,
        entries = usage.entries.len(),
        blocking = usage.blocking(),
        "resolved active usage"
    );
    usage
}

impl Resolver<'_> {
    fn name(&self, path: &ObjectPath) -> String {
        self.index.display_name(path)
    }

    fn entry(&self, level: u32, kind: UsageKind, block: &ObjectPath) -> UsageEntry {
        let mut entry = UsageEntry::new(level, kind, block.clone());
        entry.temporary = self.request.temporary;
        entry
    }

    fn lvol(&mut self, lvol: &ObjectPath, level: u32) {
        let index = self.index;
        if let Some(block) = index.lvols_block.get(lvol) {
            self.block(block, level);
        }
        for member in index.lvols_pool_members.get(lvol).into_iter().flatten() {
            self.lvol(member, level + 1);
        }
    }

    fn block(&mut self, path: &ObjectPath, level: u32) {
        let index = self.index;
        let Some(kind) = index.kind(path) else {
            return;
        };
        let kind = match kind {
            DeviceKind::LvmLogicalVolume { content, .. } => content.as_ref(),
            other => other,
        };

        match kind {
            DeviceKind::Partitioned { .. } => {
                for partition in index.blocks_partitions.get(path).into_iter().flatten() {
                    self.block(partition, level + 1);
                }
            }
            DeviceKind::Encrypted { cleartext } => self.crypto(path, cleartext.as_ref(), level),
            DeviceKind::LvmPhysicalVolume { group } => self.pvol(path, group.as_ref(), level),
            DeviceKind::StratisBlockdev { pool } => {
                let targeted = matches!(
                    (self.target, pool),
                    (UsageTarget::StratisPool(target), Some(pool)) if target == pool
                );
                if !targeted {
                    let pool_name = pool
                        .as_ref()
                        .and_then(|pool| self.index.stratis_pools.get(pool))
                        .map(|pool| pool.name.clone())
                        .unwrap_or_default();
                    let mut entry = self.entry(level, UsageKind::PoolMember, path);
                    entry.container = Some(pool_name.clone());
                    let reason = format!(
                        "{} is a member of Stratis pool {pool_name}",
                        self.name(path)
                    );
                    self.entries.push(entry.blocked(reason));
                }
            }
            DeviceKind::MdRaidMember { array } => {
                let running = array
                    .as_ref()
                    .is_some_and(|array| self.index.mdraids_block.contains_key(array));
                if running {
                    let array_name = array
                        .as_ref()
                        .and_then(|array| self.index.mdraids.get(array))
                        .map(|array| array.name.clone())
                        .unwrap_or_default();
                    let mut entry = self.entry(level, UsageKind::RaidMember, path);
                    entry.container = Some(array_name.clone());
                    let reason = format!(
                        "{} is a member of RAID device {array_name}",
                        self.name(path)
                    );
                    self.entries.push(entry.blocked(reason));
                }
            }
            DeviceKind::VdoBacking { vdo } => {
                let vdo_name = self
                    .index
                    .vdos
                    .get(vdo)
                    .map(|vdo| vdo.name.clone())
                    .unwrap_or_default();
                let mut entry = self.entry(level, UsageKind::PoolMember, path);
                entry.container = Some(vdo_name.clone());
                let reason = format!("{} backs VDO volume {vdo_name}", self.name(path));
                self.entries.push(entry.blocked(reason));
            }
            DeviceKind::BtrfsMember { uuid } => {
                let multi_device = self
                    .index
                    .btrfs_volumes
                    .get(uuid)
                    .is_some_and(|volume| volume.is_multi_device());
                if multi_device {
                    let mut entry = self.entry(level, UsageKind::BtrfsDevice, path);
                    entry.container = Some(uuid.clone());
                    let reason = format!(
                        "{} is one of several devices of a Btrfs volume",
                        self.name(path)
                    );
                    self.entries.push(entry.blocked(reason));
                } else {
                    self.filesystem(path, level);
                }
            }
            DeviceKind::Swap { active } => self.swap(path, *active, level),
            DeviceKind::Plain { .. } => self.filesystem(path, level),
            DeviceKind::Unformatted
            | DeviceKind::Unrecognized { .. }
            | DeviceKind::LvmLogicalVolume { .. } => {}
        }
    }

    /// Configuration entries that a destructive request removes.
    fn removable_configs(&self, configs: Vec<ConfigEntry>) -> Vec<ConfigEntry> {
        if self.request.temporary {
            Vec::new()
        } else {
            configs
        }
    }

    fn filesystem(&mut self, path: &ObjectPath, level: u32) {
        let Some(block) = self.index.blocks.get(path) else {
            return;
        };
        let configs = self.removable_configs(block.fstab_entries().cloned().collect());
        let mount_points = self
            .index
            .filesystems
            .get(path)
            .map(|filesystem| filesystem.mount_points.clone())
            .unwrap_or_default();

        if mount_points.is_empty() {
            if !configs.is_empty() {
                let mut entry = self.entry(level, UsageKind::None, path);
                entry.location = configs.iter().find_map(|config| config.directory.clone());
                entry.verbs.push(TeardownVerb::RemoveConfig);
                entry.configs = configs;
                self.entries.push(entry);
            }
            return;
        }

        for (position, mount_point) in mount_points.iter().enumerate() {
            let mut entry = self.entry(level, UsageKind::Mounted, path);
            entry.location = Some(mount_point.clone());
            if self.config.is_protected_mount_point(mount_point) {
                let reason = format!("{} is mounted at {mount_point}", self.name(path));
                self.entries.push(entry.blocked(reason));
                continue;
            }
            entry.verbs.push(TeardownVerb::Unmount);
            // Configuration belongs to the block, not to one of its mount points.
            if position == 0 && !configs.is_empty() {
                entry.verbs.push(TeardownVerb::RemoveConfig);
                entry.configs = configs.clone();
            }
            self.entries.push(entry);
        }
    }

    fn swap(&mut self, path: &ObjectPath, active: bool, level: u32) {
        let configs = self
            .index
            .blocks
            .get(path)
            .map(|block| self.removable_configs(block.fstab_entries().cloned().collect()))
            .unwrap_or_default();
        if !active && configs.is_empty() {
            return;
        }

        let kind = if active { UsageKind::Swap } else { UsageKind::None };
        let mut entry = self.entry(level, kind, path);
        if active {
            entry.verbs.push(TeardownVerb::SwapOff);
        }
        if !configs.is_empty() {
            entry.verbs.push(TeardownVerb::RemoveConfig);
            entry.configs = configs;
        }
        self.entries.push(entry);
    }

    fn crypto(&mut self, path: &ObjectPath, cleartext: Option<&ObjectPath>, level: u32) {
        let configs = self
            .index
            .blocks
            .get(path)
            .map(|block| self.removable_configs(block.crypttab_entries().cloned().collect()))
            .unwrap_or_default();

        let Some(cleartext) = cleartext else {
            if !configs.is_empty() {
                let mut entry = self.entry(level, UsageKind::None, path);
                entry.verbs.push(TeardownVerb::RemoveConfig);
                entry.configs = configs;
                self.entries.push(entry);
            }
            return;
        };

        // A temporary teardown keeps the container open so the content can be resized.
        let locks = !self.request.temporary
            && !(level == 0 && self.request.action == ActionVerb::Lock);
        if locks || !configs.is_empty() {
            let mut entry = self.entry(level, UsageKind::Crypto, path);
            if locks {
                entry.verbs.push(TeardownVerb::Lock);
            }
            if !configs.is_empty() {
                entry.verbs.push(TeardownVerb::RemoveConfig);
                entry.configs = configs;
            }
            self.entries.push(entry);
        }
        self.block(cleartext, level + 1);
    }

    fn pvol(&mut self, path: &ObjectPath, group: Option<&ObjectPath>, level: u32) {
        let Some(group) = group.and_then(|group| self.index.vgroups.get(group)) else {
            return;
        };
        let used = self
            .index
            .pvols
            .get(path)
            .map(|pvol| pvol.used_size())
            .unwrap_or(0);
        let members = self
            .index
            .vgroups_pvols
            .get(&group.path)
            .map(Vec::len)
            .unwrap_or(0);

        let mut entry = self.entry(level, UsageKind::PhysicalVolume, path);
        entry.container = Some(group.name.clone());
        let name = self.name(path);

        if self.request.temporary {
            let reason = format!("{name} is a physical volume of {}", group.name);
            self.entries.push(entry.blocked(reason));
        } else if members < 2 {
            let reason = format!("{name} is the only physical volume of {}", group.name);
            self.entries.push(entry.blocked(reason));
        } else if group.free_size < used {
            let reason = format!(
                "not enough free space in {} to move the data off {name}",
                group.name
            );
            self.entries.push(entry.blocked(reason));
        } else {
            entry.verbs.push(TeardownVerb::RemoveFromGroup);
            self.entries.push(entry);
        }
    }
}

/// Add an `OpenFiles` entry above every mounted entry whose mount point is in use.
pub async fn attach_processes(usage: &mut UsageList, mounts: &dyn MountHelper) -> Result<()> {
    let mut extra = Vec::new();
    for entry in &usage.entries {
        if entry.kind != UsageKind::Mounted {
            continue;
        }
        let Some(location) = &entry.location else {
            continue;
        };
        let processes = mounts.find_users(location).await?;
        if processes.is_empty() {
            continue;
        }

        let mut users = UsageEntry::new(entry.level + 1, UsageKind::OpenFiles, entry.block.clone());
        users.location = Some(location.clone());
        users.temporary = entry.temporary;
        let stoppable = processes.iter().all(|process| process.stoppable);
        users.processes = processes;
        if entry.blocking || !stoppable {
            let unstoppable: Vec<&str> = users
                .processes
                .iter()
                .filter(|process| !process.stoppable)
                .map(|process| process.command.as_str())
                .collect();
            let commands = if unstoppable.is_empty() {
                users
                    .processes
                    .iter()
                    .map(|process| process.command.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            } else {
                unstoppable.join(", ")
            };
            extra.push(users.blocked(format!("{location} is used by {commands}")));
        } else {
            users.verbs.push(TeardownVerb::StopProcesses);
            extra.push(users);
        }
    }
    usage.entries.extend(extra);
    Ok(())
}

#[cfg(test)]
mod tests {
    use storage_testing::fixtures::{
        SnapshotBuilder, block_path, linear_structure, lv_path, stratis_pool_path, vg_path,
    };
    use storage_testing::{CallLedger, FakeMountHelper};
    use storage_types::{MIB, ProcessRef};

    use super::*;

    const GIB: u64 = 1024 * MIB;

    fn resolve_block(builder: SnapshotBuilder, name: &str, request: UsageRequest) -> UsageList {
        let index = Index::build(&builder.build(), MIB);
        resolve(
            &index,
            &CoreConfig::default(),
            &UsageTarget::Block(block_path(name)),
            request,
        )
    }

    fn encrypted_disk() -> SnapshotBuilder {
        SnapshotBuilder::new()
            .block("sda", 100 * GIB)
            .partition_table("sda", "gpt")
            .partition("sda1", "sda", MIB, 50 * GIB)
            .encrypted("sda1", 16 * MIB)
            .crypttab("sda1", "discard")
            .cleartext("dm-0", "sda1", 50 * GIB - 16 * MIB)
            .filesystem("dm-0", "ext4", &["/data"], 50 * GIB - 16 * MIB)
            .fstab("dm-0", "/data", "defaults")
    }

    #[test]
    fn destructive_request_walks_every_layer() {
        let usage = resolve_block(
            encrypted_disk(),
            "sda",
            UsageRequest::destructive(ActionVerb::Format),
        );

        let summary: Vec<_> = usage
            .entries
            .iter()
            .map(|entry| (entry.level, entry.kind, entry.verbs.clone()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (
                    1,
                    UsageKind::Crypto,
                    vec![TeardownVerb::Lock, TeardownVerb::RemoveConfig]
                ),
                (
                    2,
                    UsageKind::Mounted,
                    vec![TeardownVerb::Unmount, TeardownVerb::RemoveConfig]
                ),
            ]
        );
        assert!(!usage.blocking());
        assert!(usage.needs_teardown());
    }

    #[test]
    fn temporary_request_keeps_crypto_open_and_config() {
        let usage = resolve_block(
            encrypted_disk(),
            "sda1",
            UsageRequest::temporary(ActionVerb::Shrink),
        );

        assert_eq!(usage.entries.len(), 1);
        let mounted = &usage.entries[0];
        assert_eq!(mounted.kind, UsageKind::Mounted);
        assert_eq!(mounted.level, 1);
        assert_eq!(mounted.verbs, vec![TeardownVerb::Unmount]);
        assert!(mounted.temporary);
    }

    #[test]
    fn protected_mount_point_blocks() {
        let usage = resolve_block(
            SnapshotBuilder::new()
                .block("sda2", 20 * GIB)
                .filesystem("sda2", "ext4", &["/"], 20 * GIB),
            "sda2",
            UsageRequest::destructive(ActionVerb::Format),
        );
        assert!(usage.blocking());
        assert_eq!(
            usage.entries[0].reason.as_deref(),
            Some("/dev/sda2 is mounted at /")
        );
    }

    #[test]
    fn dormant_fstab_entry_only_matters_for_destructive_requests() {
        let builder = SnapshotBuilder::new()
            .block("sdb1", GIB)
            .filesystem("sdb1", "xfs", &[], GIB)
            .fstab("sdb1", "/backup", "noauto");

        let destructive = resolve_block(
            builder.clone(),
            "sdb1",
            UsageRequest::destructive(ActionVerb::Delete),
        );
        assert_eq!(destructive.entries[0].kind, UsageKind::None);
        assert_eq!(destructive.entries[0].verbs, vec![TeardownVerb::RemoveConfig]);
        assert_eq!(destructive.entries[0].location.as_deref(), Some("/backup"));

        let temporary = resolve_block(builder, "sdb1", UsageRequest::temporary(ActionVerb::Grow));
        assert!(temporary.entries.is_empty());
    }

    fn two_pv_group(free: u64) -> SnapshotBuilder {
        SnapshotBuilder::new()
            .block("sdb", 10 * GIB)
            .block("sdc", 10 * GIB)
            .volume_group("vg0", 20 * GIB, free, 4 * MIB)
            .physical_volume("sdb", "vg0", 10 * GIB, 6 * GIB)
            .physical_volume("sdc", "vg0", 10 * GIB, 10 * GIB)
    }

    #[test]
    fn physical_volume_can_be_emptied_when_group_has_room() {
        let usage = resolve_block(
            two_pv_group(16 * GIB),
            "sdb",
            UsageRequest::destructive(ActionVerb::Format),
        );
        assert_eq!(usage.entries[0].verbs, vec![TeardownVerb::RemoveFromGroup]);
        assert_eq!(usage.entries[0].container.as_deref(), Some("vg0"));
    }

    #[test]
    fn physical_volume_blocks_without_room_or_for_temporary_requests() {
        // sdb holds 4 GiB of extents, the group only has 3 GiB free.
        let crowded = resolve_block(
            two_pv_group(3 * GIB),
            "sdb",
            UsageRequest::destructive(ActionVerb::Format),
        );
        assert!(crowded.blocking());

        let temporary = resolve_block(
            two_pv_group(16 * GIB),
            "sdb",
            UsageRequest::temporary(ActionVerb::Grow),
        );
        assert!(temporary.blocking());
    }

    #[test]
    fn stratis_member_blocks_unless_pool_is_target() {
        let builder = SnapshotBuilder::new()
            .block("sdd", 10 * GIB)
            .stratis_pool("tank", 10 * GIB)
            .stratis_blockdev("sdd", "tank", 10 * GIB)
            .stratis_filesystem("tank", "media", "dm-7", GIB);
        let index = Index::build(&builder.build(), MIB);
        let config = CoreConfig::default();

        let member = resolve(
            &index,
            &config,
            &UsageTarget::Block(block_path("sdd")),
            UsageRequest::destructive(ActionVerb::Format),
        );
        assert!(member.blocking());
        assert_eq!(
            member.entries[0].reason.as_deref(),
            Some("/dev/sdd is a member of Stratis pool tank")
        );

        let pool = resolve(
            &index,
            &config,
            &UsageTarget::StratisPool(stratis_pool_path("tank")),
            UsageRequest::destructive(ActionVerb::Delete),
        );
        assert!(!pool.blocking());
    }

    #[test]
    fn volume_group_target_lists_mounted_volumes() {
        let builder = SnapshotBuilder::new()
            .volume_group("vg0", 10 * GIB, 0, 4 * MIB)
            .logical_volume("vg0", "home", "linear", 2 * GIB, linear_structure(2 * GIB, &[(2 * GIB, Some("sdb"))]))
            .lv_block("dm-1", "vg0", "home", 2 * GIB)
            .filesystem("dm-1", "ext4", &["/home"], 2 * GIB);
        let index = Index::build(&builder.build(), MIB);

        let usage = resolve(
            &index,
            &CoreConfig::default(),
            &UsageTarget::VolumeGroup(vg_path("vg0")),
            UsageRequest::destructive(ActionVerb::Delete),
        );
        assert_eq!(usage.entries.len(), 1);
        assert_eq!(usage.entries[0].level, 1);
        assert_eq!(usage.entries[0].block, block_path("dm-1"));

        let single = resolve(
            &index,
            &CoreConfig::default(),
            &UsageTarget::LogicalVolume(lv_path("vg0", "home")),
            UsageRequest::destructive(ActionVerb::Delete),
        );
        assert_eq!(single.entries[0].level, 0);
    }

    #[test]
    fn running_raid_member_blocks() {
        let usage = resolve_block(
            SnapshotBuilder::new()
                .block("sde", GIB)
                .block("sdf", GIB)
                .block("md0", GIB)
                .mdraid("md0", "raid1", &["sde", "sdf"], Some("md0")),
            "sde",
            UsageRequest::destructive(ActionVerb::Format),
        );
        assert_eq!(usage.entries[0].kind, UsageKind::RaidMember);
        assert!(usage.blocking());
    }

    #[tokio::test]
    async fn open_files_are_attached_above_their_mount() {
        let mut usage = resolve_block(
            SnapshotBuilder::new()
                .block("sdb1", GIB)
                .filesystem("sdb1", "ext4", &["/media/usb"], GIB),
            "sdb1",
            UsageRequest::destructive(ActionVerb::Format),
        );
        let mounts = FakeMountHelper::new(CallLedger::new());
        mounts.set_users(
            "/media/usb",
            vec![ProcessRef {
                pid: 4242,
                command: "vim".to_string(),
                uid: Some(1000),
                stoppable: true,
            }],
        );

        attach_processes(&mut usage, &mounts).await.expect("users");

        let order: Vec<_> = usage
            .teardown_order()
            .iter()
            .map(|entry| entry.kind)
            .collect();
        assert_eq!(order, vec![UsageKind::OpenFiles, UsageKind::Mounted]);
        assert!(usage.entries[1].has_verb(TeardownVerb::StopProcesses));
    }

    #[tokio::test]
    async fn unstoppable_processes_block() {
        let mut usage = resolve_block(
            SnapshotBuilder::new()
                .block("sdb1", GIB)
                .filesystem("sdb1", "ext4", &["/srv/db"], GIB),
            "sdb1",
            UsageRequest::destructive(ActionVerb::Format),
        );
        let mounts = FakeMountHelper::new(CallLedger::new());
        mounts.set_users(
            "/srv/db",
            vec![ProcessRef {
                pid: 812,
                command: "postgres".to_string(),
                uid: Some(26),
                stoppable: false,
            }],
        );

        attach_processes(&mut usage, &mounts).await.expect("users");

        assert!(usage.blocking());
        assert_eq!(
            usage.entries[1].reason.as_deref(),
            Some("/srv/db is used by postgres")
        );
    }
}
