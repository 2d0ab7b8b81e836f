// SPDX-License-Identifier: GPL-3.0-only

//! Entry point for the presentation layer.
//!
//! [`StorageCore`] owns the object cache and hands out index snapshots. Every
//! mutating operation resolves usage against the newest snapshot, takes the
//! device locks and runs under a [`Teardown`].

use std::future::Future;
use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;

use storage_contracts::{
    FilesystemHelper, FormatRequest, MountHelper, MountTable, ObjectSource, OperationEvent,
    OperationKind, PassphraseSource,
};
use storage_types::{
    ActionVerb, GrowLimit, InterfaceKind, MountEntry, ObjectPath, ResizeDirection, ResizeInfo,
    UnusedSpace, UsageList, UsageRequest, UsageTarget,
};

use crate::config::CoreConfig;
use crate::error::{CoreError, Result};
use crate::index::Index;
use crate::locks::DeviceLocks;
use crate::maintenance::{RemoveMissingPlan, RepairPlan, remove_missing_plan, repair_plan};
use crate::resize::{self, ResizeOptions, ResizePlan, ResizeVolume};
use crate::store::Store;
use crate::teardown::{Teardown, TeardownOutcome};
use crate::usage::{attach_processes, resolve};

/// The external systems the core drives.
#[derive(Clone)]
pub struct Collaborators {
    pub objects: Arc<dyn ObjectSource>,
    pub filesystems: Arc<dyn FilesystemHelper>,
    pub mounts: Arc<dyn MountHelper>,
    pub mount_table: Arc<dyn MountTable>,
    pub passphrases: Arc<dyn PassphraseSource>,
}

impl Collaborators {
    #[cfg(test)]
    pub(crate) fn from_fakes(fakes: &storage_testing::Fakes) -> Self {
        Self {
            objects: fakes.objects.clone(),
            filesystems: fakes.filesystems.clone(),
            mounts: fakes.mounts.clone(),
            mount_table: fakes.mount_table.clone(),
            passphrases: fakes.passphrases.clone(),
        }
    }
}

pub struct StorageCore {
    config: CoreConfig,
    collab: Collaborators,
    store: RwLock<Store>,
    locks: DeviceLocks,
    events: Option<mpsc::UnboundedSender<OperationEvent>>,
}

impl StorageCore {
    /// Load the object cache from the remote service.
    pub async fn connect(config: CoreConfig, collab: Collaborators) -> Result<Self> {
        let store = Store::load(
            collab.objects.as_ref(),
            collab.filesystems.as_ref(),
            config.min_free_space,
            config.poll_btrfs,
        )
        .await?;
        Ok(Self::with_store(config, collab, store))
    }

    pub fn with_store(config: CoreConfig, collab: Collaborators, store: Store) -> Self {
        Self {
            config,
            collab,
            store: RwLock::new(store),
            locks: DeviceLocks::new(),
            events: None,
        }
    }

    /// Report operation progress to `events`.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<OperationEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collab
    }

    /// The newest index snapshot.
    pub async fn index(&self) -> Arc<Index> {
        self.store.read().await.index()
    }

    /// Follow remote changes until the notification stream ends.
    pub async fn watch(&self) -> Result<()> {
        let mut changes = self.collab.objects.subscribe().await?;
        while let Some(notification) = changes.next().await {
            let pending = {
                let mut store = self.store.write().await;
                let uuids = store.apply(notification);
                store.pending(&uuids)
            };
            if pending.is_empty() {
                continue;
            }
            // Readers keep the applied index while the helper answers.
            let answers = pending.run(self.collab.filesystems.as_ref()).await;
            self.store.write().await.answer(answers);
        }
        tracing::debug!("change stream ended");
        Ok(())
    }

    fn teardown<'a>(&'a self, index: &'a Index, cancel: &CancellationToken) -> Teardown<'a> {
        Teardown::new(&self.collab, index, &self.config, &self.locks)
            .with_events(self.events.clone())
            .with_cancel(cancel.clone())
    }

    async fn resolve_usage(
        &self,
        index: &Index,
        target: &UsageTarget,
        request: UsageRequest,
    ) -> Result<UsageList> {
        let mut usage = resolve(index, &self.config, target, request);
        attach_processes(&mut usage, self.collab.mounts.as_ref()).await?;
        Ok(usage)
    }

    /// Everything that would have to go for `request` on `target`, including open files.
    pub async fn get_active_usage(
        &self,
        target: &UsageTarget,
        request: UsageRequest,
    ) -> Result<UsageList> {
        let index = self.index().await;
        self.resolve_usage(&index, target, request).await
    }

    pub async fn get_resize_info(&self, volume: &ResizeVolume, to_fit: bool) -> ResizeInfo {
        let index = self.index().await;
        let block = volume.block(&index);
        resize::get_resize_info(&index, block.as_ref(), to_fit)
    }

    pub async fn grow_limit(&self, volume: &ResizeVolume) -> Option<GrowLimit> {
        let index = self.index().await;
        resize::grow_limit(&index, volume)
    }

    pub async fn check_unused_space(&self, block: &ObjectPath) -> Option<UnusedSpace> {
        let index = self.index().await;
        resize::check_unused_space(&index, block)
    }

    pub async fn plan_resize(
        &self,
        volume: &ResizeVolume,
        size: u64,
        options: &ResizeOptions,
    ) -> Result<ResizePlan> {
        let index = self.index().await;
        resize::plan(&index, &self.config, volume, size, options)
    }

    /// Plan a resize and carry it out, unmounting the content only when its
    /// filesystem can not be resized online.
    pub async fn plan_and_run_resize(
        &self,
        volume: &ResizeVolume,
        size: u64,
        options: &ResizeOptions,
        cancel: &CancellationToken,
    ) -> Result<TeardownOutcome<ResizePlan>> {
        let index = self.index().await;
        let plan = resize::plan(&index, &self.config, volume, size, options)?;

        let action = match plan.direction {
            ResizeDirection::Shrink => ActionVerb::Shrink,
            ResizeDirection::Grow => ActionVerb::Grow,
        };
        let target = UsageTarget::Block(plan.block.clone());
        let request = UsageRequest::temporary(action);
        let usage = if plan.needs_unmount {
            self.resolve_usage(&index, &target, request).await?
        } else {
            UsageList::new(target, request)
        };

        tracing::info!(
            volume = %volume.path(),
            from = plan.current_size,
            to = plan.target_size,
            steps = plan.steps.len(),
            "resizing"
        );
        let collab = &self.collab;
        let plan = &plan;
        let passphrase = options.passphrase.clone();
        self.teardown(&index, cancel)
            .with_operation(OperationKind::Resize)
            .with_lock(volume.path().clone())
            .around(&usage, move || async move {
                resize::execute(collab, plan, passphrase, cancel).await?;
                Ok(plan.clone())
            })
            .await
    }

    /// Tear down `usage`, run `action`, then restore what was temporary.
    pub async fn run_teardown_then<T, F, Fut>(
        &self,
        usage: &UsageList,
        action: F,
        cancel: &CancellationToken,
    ) -> Result<TeardownOutcome<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let index = self.index().await;
        self.teardown(&index, cancel).around(usage, action).await
    }

    /// Put a new filesystem on `block`, then mount it where requested.
    pub async fn format(
        &self,
        block: &ObjectPath,
        request: &FormatRequest,
        cancel: &CancellationToken,
    ) -> Result<TeardownOutcome<()>> {
        let index = self.index().await;
        let device = index
            .blocks
            .get(block)
            .ok_or_else(|| CoreError::NotFound(block.clone()))?;
        if device.read_only {
            return Err(CoreError::excuse("Device is read-only"));
        }

        let usage = self
            .resolve_usage(
                &index,
                &UsageTarget::Block(block.clone()),
                UsageRequest::destructive(ActionVerb::Format),
            )
            .await?;

        let filesystems = &self.collab.filesystems;
        let outcome = self
            .teardown(&index, cancel)
            .with_operation(OperationKind::Format)
            .around(&usage, move || async move {
                tracing::info!(%block, fs_type = request.fs_type, "formatting");
                Ok(filesystems.format(block, request).await?)
            })
            .await?;

        if let Some(directory) = &request.mount_point {
            let options = request
                .mount_options
                .clone()
                .unwrap_or_else(|| "defaults".to_string());
            let entry = MountEntry {
                device: device.device.clone(),
                directory: directory.clone(),
                fs_type: request.fs_type.clone(),
                options: options.clone(),
                freq: 0,
                passno: 2,
            };
            self.save_mount_entry(entry).await?;
            self.collab.mounts.mount(block, directory, &options).await?;
        }
        Ok(outcome)
    }

    /// Replace the entry for the same directory, or add a new one.
    async fn save_mount_entry(&self, entry: MountEntry) -> Result<()> {
        let existing = self
            .collab
            .mount_table
            .entries()
            .await?
            .into_iter()
            .find(|candidate| candidate.directory == entry.directory);
        match existing {
            Some(old) => self.collab.mount_table.update_entry(&old, &entry).await?,
            None => self.collab.mount_table.add_entry(&entry).await?,
        }
        Ok(())
    }

    pub async fn repair_plan(&self, lvol: &ObjectPath) -> Result<RepairPlan> {
        let index = self.index().await;
        repair_plan(&index, lvol)
    }

    /// Rebuild the lost legs of a RAID volume on `selection`.
    pub async fn repair_lvol(&self, lvol: &ObjectPath, selection: &[ObjectPath]) -> Result<()> {
        let index = self.index().await;
        let plan = repair_plan(&index, lvol)?;
        let pvs = plan.validate(selection)?;
        let block = index.lvols_block.get(lvol).cloned();
        let _guard = self
            .locks
            .try_lock(std::iter::once(lvol.clone()).chain(block))?;
        tracing::info!(%lvol, pvs = pvs.len(), "repairing logical volume");
        self.collab
            .objects
            .call_method(
                lvol,
                InterfaceKind::LogicalVolume,
                "Repair",
                json!({"pvs": pvs, "options": {}}),
            )
            .await?;
        Ok(())
    }

    pub async fn remove_missing_plan(&self, group: &ObjectPath) -> Result<RemoveMissingPlan> {
        let index = self.index().await;
        remove_missing_plan(&index, &self.config, group)
    }

    /// Delete the partial linear volumes of `group`, then drop its missing PVs.
    pub async fn remove_missing_pvs(
        &self,
        group: &ObjectPath,
        cancel: &CancellationToken,
    ) -> Result<TeardownOutcome<()>> {
        let index = self.index().await;
        let mut plan = remove_missing_plan(&index, &self.config, group)?;
        attach_processes(&mut plan.usage, self.collab.mounts.as_ref()).await?;

        let objects = &self.collab.objects;
        let lvols = &plan.lvols;
        let teardown = lvols.iter().fold(
            self.teardown(&index, cancel)
                .with_operation(OperationKind::Repair),
            |teardown, lvol| teardown.with_lock(lvol.clone()),
        );
        teardown
            .around(&plan.usage, move || async move {
                for lvol in lvols {
                    tracing::info!(%lvol, "deleting partial logical volume");
                    objects
                        .call_method(
                            lvol,
                            InterfaceKind::LogicalVolume,
                            "Delete",
                            json!({"options": {"tear-down": true}}),
                        )
                        .await?;
                }
                objects
                    .call_method(
                        group,
                        InterfaceKind::VolumeGroup,
                        "RemoveMissingPhysicalVolumes",
                        json!({"options": {}}),
                    )
                    .await?;
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use storage_testing::Fakes;
    use storage_testing::fixtures::{
        SnapshotBuilder, block_path, linear_structure, lv_path, raid_structure, vg_path,
    };
    use storage_types::MIB;

    use super::*;

    const GIB: u64 = 1024 * MIB;

    fn core(builder: SnapshotBuilder) -> (Fakes, StorageCore) {
        let snapshot = builder.build();
        let fakes = Fakes::new(snapshot.clone());
        let config = CoreConfig::default();
        let store = Store::from_snapshot(snapshot, config.min_free_space);
        let core = StorageCore::with_store(config, Collaborators::from_fakes(&fakes), store);
        (fakes, core)
    }

    fn mounted_partition() -> SnapshotBuilder {
        SnapshotBuilder::new()
            .block("sda", 1000 * MIB)
            .partition_table("sda", "gpt")
            .partition("sda1", "sda", MIB, 500 * MIB)
            .filesystem("sda1", "ext4", &["/data"], 500 * MIB)
            .fstab("sda1", "/data", "defaults")
    }

    #[tokio::test]
    async fn format_replaces_the_mount_entry_for_the_directory() {
        let (fakes, core) = core(mounted_partition());
        fakes.mount_table.set_entries(vec![MountEntry {
            device: "/dev/sda1".to_string(),
            directory: "/data".to_string(),
            fs_type: "ext4".to_string(),
            options: "defaults".to_string(),
            freq: 0,
            passno: 2,
        }]);
        let request = FormatRequest {
            fs_type: "xfs".to_string(),
            label: Some("data".to_string()),
            erase: false,
            mount_point: Some("/data".to_string()),
            mount_options: Some("noatime".to_string()),
        };

        core.format(&block_path("sda1"), &request, &CancellationToken::new())
            .await
            .expect("format");

        assert_eq!(
            fakes.ledger.summaries(),
            vec![
                "unmount sda1 /data",
                "fstab-remove /data",
                "format sda1 xfs",
                "fstab-add /data",
                "mount sda1 /data",
            ]
        );
        let entries = fakes.mount_table.current();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].fs_type, "xfs");
        assert_eq!(entries[0].options, "noatime");
    }

    #[tokio::test]
    async fn format_updates_an_entry_it_did_not_remove() {
        let (fakes, core) = core(
            SnapshotBuilder::new()
                .block("sdb", 100 * MIB)
                .filesystem("sdb", "vfat", &[], 100 * MIB),
        );
        fakes.mount_table.set_entries(vec![MountEntry {
            device: "/dev/sdc".to_string(),
            directory: "/media/usb".to_string(),
            fs_type: "vfat".to_string(),
            options: "defaults".to_string(),
            freq: 0,
            passno: 0,
        }]);
        let request = FormatRequest {
            fs_type: "ext4".to_string(),
            label: None,
            erase: false,
            mount_point: Some("/media/usb".to_string()),
            mount_options: None,
        };

        core.format(&block_path("sdb"), &request, &CancellationToken::new())
            .await
            .expect("format");

        assert_eq!(
            fakes.ledger.summaries(),
            vec!["format sdb ext4", "fstab-update /media/usb", "mount sdb /media/usb"]
        );
        assert_eq!(fakes.mount_table.current()[0].device, "/dev/sdb");
    }

    #[tokio::test]
    async fn protected_mount_blocks_format() {
        let (fakes, core) = core(
            SnapshotBuilder::new()
                .block("sda", 1000 * MIB)
                .filesystem("sda", "ext4", &["/"], 1000 * MIB),
        );
        let request = FormatRequest {
            fs_type: "ext4".to_string(),
            label: None,
            erase: false,
            mount_point: None,
            mount_options: None,
        };

        let error = core
            .format(&block_path("sda"), &request, &CancellationToken::new())
            .await
            .expect_err("root is protected");

        assert!(matches!(error, CoreError::Blocked { .. }));
        assert!(fakes.ledger.is_empty());
    }

    #[tokio::test]
    async fn online_grow_does_not_unmount() {
        let (fakes, core) = core(mounted_partition().common_resize_support());
        fakes.mounts.set_mounted(block_path("sda1"), true);

        let outcome = core
            .plan_and_run_resize(
                &ResizeVolume::Partition(block_path("sda1")),
                800 * MIB,
                &ResizeOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .expect("grow");

        assert_eq!(outcome.value.target_size, 800 * MIB);
        assert_eq!(
            fakes.ledger.summaries(),
            vec!["Partition.Resize sda1", "fs-resize sda1 fill"]
        );
    }

    #[tokio::test]
    async fn offline_shrink_unmounts_and_remounts() {
        let (fakes, core) = core(
            mounted_partition()
                .common_resize_support()
                .filesystem("sda1", "ext4", &["/data"], 300 * MIB),
        );
        fakes.mounts.set_mounted(block_path("sda1"), true);

        core.plan_and_run_resize(
            &ResizeVolume::Partition(block_path("sda1")),
            400 * MIB,
            &ResizeOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .expect("shrink");

        assert_eq!(
            fakes.ledger.summaries(),
            vec![
                "unmount sda1 /data".to_string(),
                "repair sda1".to_string(),
                format!("fs-resize sda1 {}", 400 * MIB),
                "Partition.Resize sda1".to_string(),
                "mount sda1 /data".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn remove_missing_deletes_partial_volumes_first() {
        let (fakes, core) = core(
            SnapshotBuilder::new()
                .block("sdb", 20 * GIB)
                .volume_group("vg0", 40 * GIB, 10 * GIB, 4 * MIB)
                .with_props(
                    &vg_path("vg0"),
                    InterfaceKind::VolumeGroup,
                    json!({"MissingPhysicalVolumes": ["pv-uuid-1"]}),
                )
                .physical_volume("sdb", "vg0", 20 * GIB, 10 * GIB)
                .logical_volume(
                    "vg0",
                    "broken",
                    "linear",
                    8 * GIB,
                    linear_structure(8 * GIB, &[(4 * GIB, Some("sdb")), (4 * GIB, None)]),
                )
                .lv_block("dm-1", "vg0", "broken", 8 * GIB)
                .filesystem("dm-1", "ext4", &["/srv"], 8 * GIB),
        );

        core.remove_missing_pvs(&vg_path("vg0"), &CancellationToken::new())
            .await
            .expect("removed");

        assert_eq!(
            fakes.ledger.summaries(),
            vec![
                "unmount dm-1 /srv",
                "LogicalVolume.Delete broken",
                "VolumeGroup.RemoveMissingPhysicalVolumes vg0",
            ]
        );
        assert_eq!(
            core.remove_missing_plan(&vg_path("vg0"))
                .await
                .expect("plan")
                .lvols,
            vec![lv_path("vg0", "broken")]
        );
    }

    fn degraded_mirror() -> SnapshotBuilder {
        SnapshotBuilder::new()
            .block("sdb", 20 * GIB)
            .block("sdc", 20 * GIB)
            .block("sdd", 20 * GIB)
            .volume_group("vg0", 60 * GIB, 20 * GIB, 4 * MIB)
            .physical_volume("sdb", "vg0", 20 * GIB, 10 * GIB)
            .physical_volume("sdc", "vg0", 20 * GIB, 5 * GIB)
            .physical_volume("sdd", "vg0", 20 * GIB, 8 * GIB)
            .logical_volume(
                "vg0",
                "mirror",
                "raid1",
                10 * GIB,
                raid_structure(
                    "raid1",
                    10 * GIB,
                    &[
                        &[(10 * GIB, Some("sdb"))],
                        &[(4 * GIB, Some("sdc")), (6 * GIB, None)],
                    ],
                ),
            )
            .lv_block("dm-1", "vg0", "mirror", 10 * GIB)
    }

    #[tokio::test]
    async fn repair_waits_for_work_on_the_volume_block() {
        let (fakes, core) = core(degraded_mirror());
        let mirror = lv_path("vg0", "mirror");

        let held = core.locks.try_lock([block_path("dm-1")]).expect("lock");
        let error = core
            .repair_lvol(&mirror, &[block_path("sdd")])
            .await
            .expect_err("block is held");
        assert!(matches!(error, CoreError::Busy(ref path) if *path == block_path("dm-1")));
        assert!(fakes.ledger.is_empty());

        drop(held);
        core.repair_lvol(&mirror, &[block_path("sdd")])
            .await
            .expect("repair");
        assert_eq!(fakes.ledger.summaries(), vec!["LogicalVolume.Repair mirror"]);
        assert!(!core.locks.is_locked(&mirror));
    }

    #[tokio::test]
    async fn resize_holds_the_volume_object() {
        let (fakes, core) = core(
            SnapshotBuilder::new()
                .block("sdb", 20 * GIB)
                .volume_group("vg0", 20 * GIB, 10 * GIB, 4 * MIB)
                .physical_volume("sdb", "vg0", 20 * GIB, 10 * GIB)
                .logical_volume(
                    "vg0",
                    "data",
                    "linear",
                    10 * GIB,
                    linear_structure(10 * GIB, &[(10 * GIB, Some("sdb"))]),
                )
                .lv_block("dm-1", "vg0", "data", 10 * GIB)
                .filesystem("dm-1", "ext4", &["/srv"], 10 * GIB)
                .common_resize_support(),
        );
        let data = lv_path("vg0", "data");

        let _repairing = core.locks.try_lock([data.clone()]).expect("lock");
        let error = core
            .plan_and_run_resize(
                &ResizeVolume::LogicalVolume(data.clone()),
                15 * GIB,
                &ResizeOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .expect_err("volume is held");

        assert!(matches!(error, CoreError::Busy(ref path) if *path == data));
        assert!(fakes.ledger.is_empty());
    }

    #[tokio::test]
    async fn queries_read_the_current_snapshot() {
        let (_fakes, core) = core(
            mounted_partition()
                .common_resize_support()
                .filesystem("sda1", "ext4", &["/data"], 300 * MIB),
        );
        let sda1 = ResizeVolume::Partition(block_path("sda1"));

        let limit = core.grow_limit(&sda1).await.expect("limit");
        assert!(limit.max_size > 500 * MIB);
        assert!(!limit.unbounded);

        let unused = core
            .check_unused_space(&block_path("sda1"))
            .await
            .expect("unused space");
        assert_eq!(unused.volume_size, 500 * MIB);
        assert_eq!(unused.content_size, 300 * MIB);

        let plan = core
            .plan_resize(&sda1, 400 * MIB, &ResizeOptions::default())
            .await
            .expect("plan");
        assert_eq!(plan.target_size, 400 * MIB);

        let missing = lv_path("vg0", "absent");
        assert!(matches!(
            core.repair_plan(&missing).await,
            Err(CoreError::NotFound(ref path)) if *path == missing
        ));
        assert!(core.remove_missing_plan(&vg_path("vg0")).await.is_err());
    }

    type HelperResult<T> = std::result::Result<T, storage_contracts::StorageError>;

    /// Holds subvolume listings back until the test releases them.
    struct HeldListings {
        inner: Arc<storage_testing::FakeFilesystemHelper>,
        release: tokio::sync::Semaphore,
    }

    #[async_trait::async_trait]
    impl FilesystemHelper for HeldListings {
        async fn format(
            &self,
            block: &ObjectPath,
            request: &FormatRequest,
        ) -> HelperResult<()> {
            self.inner.format(block, request).await
        }

        async fn resize(
            &self,
            block: &ObjectPath,
            target: storage_types::ResizeTarget,
        ) -> HelperResult<()> {
            self.inner.resize(block, target).await
        }

        async fn repair(
            &self,
            block: &ObjectPath,
        ) -> HelperResult<()> {
            self.inner.repair(block).await
        }

        async fn resize_support(
            &self,
            fs_type: &str,
        ) -> HelperResult<Option<storage_types::ResizeSupport>> {
            self.inner.resize_support(fs_type).await
        }

        async fn btrfs_subvolumes(
            &self,
            block: &ObjectPath,
        ) -> HelperResult<Vec<storage_types::BtrfsSubvolume>> {
            let _permit = self.release.acquire().await.expect("semaphore open");
            self.inner.btrfs_subvolumes(block).await
        }
    }

    #[tokio::test]
    async fn index_stays_readable_while_subvolumes_are_listed() {
        let fakes = Fakes::new(SnapshotBuilder::new().build());
        fakes.filesystems.set_subvolumes(
            block_path("sdc"),
            vec![storage_types::BtrfsSubvolume {
                id: 256,
                parent_id: Some(5),
                path: "home".to_string(),
            }],
        );
        let listings = Arc::new(HeldListings {
            inner: fakes.filesystems.clone(),
            release: tokio::sync::Semaphore::new(0),
        });
        let mut collab = Collaborators::from_fakes(&fakes);
        collab.filesystems = listings.clone() as Arc<dyn FilesystemHelper>;
        let config = CoreConfig::default();
        let store = Store::from_snapshot(SnapshotBuilder::new().build(), config.min_free_space)
            .with_btrfs_polling(true);
        let core = StorageCore::with_store(config, collab, store);

        let added = SnapshotBuilder::new()
            .block("sdc", 10 * MIB)
            .btrfs("sdc", "c0ffee", "data")
            .build();
        for (interface, properties) in added.objects[&block_path("sdc")].clone() {
            fakes.objects.notify(storage_types::ChangeNotification {
                path: block_path("sdc"),
                interface,
                change: storage_types::Change::Added(properties),
            });
        }

        let reader = async {
            loop {
                let index = core.index().await;
                if let Some(volume) = index.btrfs_volumes.get("c0ffee") {
                    assert!(volume.subvolumes.is_empty());
                    break;
                }
                tokio::task::yield_now().await;
            }
            assert!(fakes.ledger.summaries().is_empty());
            listings.release.add_permits(1);
            loop {
                if core.index().await.btrfs_volumes["c0ffee"].subvolumes.len() == 1 {
                    break;
                }
                tokio::task::yield_now().await;
            }
        };
        let run = async {
            tokio::select! {
                _ = core.watch() => panic!("change stream ended"),
                () = reader => {}
            }
        };
        tokio::time::timeout(std::time::Duration::from_secs(5), run)
            .await
            .expect("index readable during the subvolume listing");
        assert_eq!(fakes.ledger.summaries(), vec!["poll-subvolumes sdc".to_string()]);
    }
}
