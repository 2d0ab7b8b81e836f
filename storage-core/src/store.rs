// SPDX-License-Identifier: GPL-3.0-only

//! Local mirror of the remote object tree.
//!
//! The store is the only writer of the derived [`Index`]. Every change
//! rebuilds it wholesale and publishes a fresh `Arc`, so readers holding an
//! older snapshot never observe a partial rebuild.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures_util::StreamExt;

use storage_contracts::{FilesystemHelper, ObjectSource, StorageErrorKind};
use storage_types::{
    BtrfsSubvolume, Change, ChangeNotification, InterfaceKind, ObjectPath, ObjectSnapshot,
    PropertiesExt, ResizeSupport,
};

use crate::error::Result;
use crate::index::Index;

/// Helper queries a change left behind, run without holding the store.
#[derive(Debug, Default)]
pub struct PendingQueries {
    /// Btrfs volume uuid and the block its subvolumes are listed through.
    pub subvolumes: Vec<(String, ObjectPath)>,
    pub resize_types: BTreeSet<String>,
}

/// Results of [`PendingQueries::run`], applied with [`Store::answer`].
#[derive(Debug, Default)]
pub struct QueryAnswers {
    pub subvolumes: Vec<(String, Vec<BtrfsSubvolume>)>,
    pub resize_support: Vec<(String, Option<ResizeSupport>)>,
}

impl PendingQueries {
    pub fn is_empty(&self) -> bool {
        self.subvolumes.is_empty() && self.resize_types.is_empty()
    }

    /// Failed queries are logged and left for a later change to retry.
    pub async fn run(self, filesystems: &dyn FilesystemHelper) -> QueryAnswers {
        let mut answers = QueryAnswers::default();
        for (uuid, representative) in self.subvolumes {
            match filesystems.btrfs_subvolumes(&representative).await {
                Ok(subvolumes) => answers.subvolumes.push((uuid, subvolumes)),
                Err(error) => {
                    tracing::warn!(%uuid, %error, "failed to list btrfs subvolumes");
                }
            }
        }
        match fetch_resize_support(filesystems, self.resize_types).await {
            Ok(support) => answers.resize_support = support,
            Err(error) => tracing::warn!(%error, "failed to query filesystem resize support"),
        }
        answers
    }
}

async fn fetch_resize_support(
    filesystems: &dyn FilesystemHelper,
    types: BTreeSet<String>,
) -> Result<Vec<(String, Option<ResizeSupport>)>> {
    let mut support = Vec::with_capacity(types.len());
    for fs_type in types {
        let answer = filesystems.resize_support(&fs_type).await?;
        support.push((fs_type, answer));
    }
    Ok(support)
}

pub struct Store {
    snapshot: ObjectSnapshot,
    index: Arc<Index>,
    min_free_space: u64,
    poll_btrfs: bool,
    /// Filesystem types whose resize support was already asked for.
    queried_types: BTreeSet<String>,
}

impl Store {
    /// Wrap an existing snapshot, e.g. one loaded from a fixture file.
    pub fn from_snapshot(snapshot: ObjectSnapshot, min_free_space: u64) -> Self {
        let index = Arc::new(Index::build(&snapshot, min_free_space));
        let queried_types = snapshot.resize_support.keys().cloned().collect();
        Self {
            snapshot,
            index,
            min_free_space,
            poll_btrfs: false,
            queried_types,
        }
    }

    /// Enumerate every interface kind, read all properties and derive the index.
    pub async fn load(
        source: &dyn ObjectSource,
        filesystems: &dyn FilesystemHelper,
        min_free_space: u64,
        poll_btrfs: bool,
    ) -> Result<Self> {
        let mut snapshot = ObjectSnapshot::default();
        for kind in InterfaceKind::ALL {
            for path in source.list_objects(kind).await? {
                match source.get_properties(&path, kind).await {
                    Ok(properties) => {
                        snapshot
                            .objects
                            .entry(path)
                            .or_default()
                            .insert(kind, properties);
                    }
                    // Objects may vanish between enumeration and the read.
                    Err(error) if error.kind == StorageErrorKind::NotFound => {
                        tracing::debug!(%path, ?kind, "object disappeared during load");
                    }
                    Err(error) => return Err(error.into()),
                }
            }
        }

        let mut store = Self::from_snapshot(snapshot, min_free_space);
        store.poll_btrfs = poll_btrfs;
        store.queried_types.clear();
        store.refresh_resize_support(filesystems).await?;

        let uuids = store.index.new_btrfs_uuids(None);
        store.poll_btrfs_volumes(filesystems, &uuids).await;

        tracing::info!(
            objects = store.snapshot.objects.len(),
            blocks = store.index.blocks.len(),
            "object cache loaded"
        );
        Ok(store)
    }

    /// List subvolumes of newly seen Btrfs volumes.
    pub fn with_btrfs_polling(mut self, poll_btrfs: bool) -> Self {
        self.poll_btrfs = poll_btrfs;
        self
    }

    pub fn index(&self) -> Arc<Index> {
        Arc::clone(&self.index)
    }

    pub fn snapshot(&self) -> &ObjectSnapshot {
        &self.snapshot
    }

    /// Apply one change notification and rebuild the index.
    ///
    /// Returns the uuids of Btrfs volumes that were not known before.
    pub fn apply(&mut self, notification: ChangeNotification) -> Vec<String> {
        let ChangeNotification {
            path,
            interface,
            change,
        } = notification;
        tracing::debug!(%path, ?interface, "applying change notification");

        match change {
            Change::Added(properties) => {
                self.snapshot
                    .objects
                    .entry(path)
                    .or_default()
                    .insert(interface, properties);
            }
            Change::Changed(properties) => {
                self.snapshot
                    .objects
                    .entry(path)
                    .or_default()
                    .entry(interface)
                    .or_default()
                    .extend(properties);
            }
            Change::Removed => {
                if let Some(interfaces) = self.snapshot.objects.get_mut(&path) {
                    interfaces.remove(&interface);
                    if interfaces.is_empty() {
                        self.snapshot.objects.remove(&path);
                    }
                }
            }
        }

        self.rebuild()
    }

    fn rebuild(&mut self) -> Vec<String> {
        let index = Index::build(&self.snapshot, self.min_free_space);
        let new_uuids = index.new_btrfs_uuids(Some(&self.index));
        self.snapshot
            .btrfs_subvolumes
            .retain(|uuid, _| index.btrfs_volumes.contains_key(uuid));
        self.index = Arc::new(index);
        new_uuids
    }

    /// Filesystem types present on some block but never asked about.
    fn unqueried_types(&self) -> BTreeSet<String> {
        self.snapshot
            .paths_with(InterfaceKind::Filesystem)
            .filter_map(|path| self.snapshot.interface(path, InterfaceKind::Block))
            .map(|block| block.str_prop("IdType"))
            .filter(|fs_type| !fs_type.is_empty() && !self.queried_types.contains(fs_type))
            .collect()
    }

    /// Ask the helper about filesystem types seen for the first time.
    pub async fn refresh_resize_support(
        &mut self,
        filesystems: &dyn FilesystemHelper,
    ) -> Result<()> {
        let types = self.unqueried_types();
        if types.is_empty() {
            return Ok(());
        }
        let support = fetch_resize_support(filesystems, types).await?;
        self.answer(QueryAnswers {
            resize_support: support,
            ..Default::default()
        });
        Ok(())
    }

    /// Representative blocks of the volumes in `uuids`, when polling is enabled.
    fn btrfs_targets(&self, uuids: &[String]) -> Vec<(String, ObjectPath)> {
        if !self.poll_btrfs {
            return Vec::new();
        }
        uuids
            .iter()
            .filter_map(|uuid| {
                let volume = self.index.btrfs_volumes.get(uuid)?;
                Some((uuid.clone(), volume.representative.clone()))
            })
            .collect()
    }

    /// Queries the helper still has to answer after `uuids` appeared.
    pub fn pending(&self, uuids: &[String]) -> PendingQueries {
        PendingQueries {
            subvolumes: self.btrfs_targets(uuids),
            resize_types: self.unqueried_types(),
        }
    }

    /// Record helper answers and rebuild once.
    pub fn answer(&mut self, answers: QueryAnswers) {
        if answers.subvolumes.is_empty() && answers.resize_support.is_empty() {
            return;
        }
        for (uuid, subvolumes) in answers.subvolumes {
            self.snapshot.btrfs_subvolumes.insert(uuid, subvolumes);
        }
        for (fs_type, support) in answers.resize_support {
            if let Some(support) = support {
                self.snapshot
                    .resize_support
                    .insert(fs_type.clone(), support);
            }
            self.queried_types.insert(fs_type);
        }
        self.rebuild();
    }

    /// Fetch subvolumes of the given Btrfs volumes through their representative block.
    pub async fn poll_btrfs_volumes(&mut self, filesystems: &dyn FilesystemHelper, uuids: &[String]) {
        let pending = PendingQueries {
            subvolumes: self.btrfs_targets(uuids),
            ..Default::default()
        };
        let answers = pending.run(filesystems).await;
        self.answer(answers);
    }

    /// Consume change notifications until the stream ends.
    pub async fn watch(
        &mut self,
        source: &dyn ObjectSource,
        filesystems: &dyn FilesystemHelper,
    ) -> Result<()> {
        let mut changes = source.subscribe().await?;
        while let Some(notification) = changes.next().await {
            self.ingest(notification, filesystems).await;
        }
        tracing::debug!("change stream ended");
        Ok(())
    }

    /// Apply a notification, then fetch what the new objects need from the helper.
    pub async fn ingest(
        &mut self,
        notification: ChangeNotification,
        filesystems: &dyn FilesystemHelper,
    ) {
        let uuids = self.apply(notification);
        let pending = self.pending(&uuids);
        if !pending.is_empty() {
            let answers = pending.run(filesystems).await;
            self.answer(answers);
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use storage_testing::Fakes;
    use storage_testing::fixtures::{SnapshotBuilder, block_path};
    use storage_types::{MIB, ResizeSupport};

    use super::*;

    fn props(value: serde_json::Value) -> storage_types::Properties {
        serde_json::from_value(value).expect("property map")
    }

    #[tokio::test]
    async fn load_mirrors_objects_and_resize_support() {
        let snapshot = SnapshotBuilder::new()
            .block("sda1", 100 * MIB)
            .filesystem("sda1", "ext4", &["/data"], 100 * MIB)
            .build();
        let fakes = Fakes::new(snapshot);
        fakes
            .filesystems
            .set_resize_support("ext4", ResizeSupport::from_bits(2 | 4 | 16));

        let store = Store::load(&*fakes.objects, &*fakes.filesystems, MIB, true)
            .await
            .expect("load");

        let index = store.index();
        assert!(index.blocks.contains_key(&block_path("sda1")));
        assert!(index.resize_support["ext4"].can_shrink);
        assert_eq!(index.mountpoints_block.get("/data"), Some(&block_path("sda1")));
    }

    #[test]
    fn changed_properties_are_merged() {
        let mut store = Store::from_snapshot(
            SnapshotBuilder::new().block("sdb", 10 * MIB).build(),
            MIB,
        );
        let before = store.index();

        store.apply(ChangeNotification {
            path: block_path("sdb"),
            interface: InterfaceKind::Block,
            change: Change::Changed(props(json!({"Size": 20 * MIB}))),
        });

        assert_eq!(before.blocks[&block_path("sdb")].size, 10 * MIB);
        let block = &store.index().blocks[&block_path("sdb")];
        assert_eq!(block.size, 20 * MIB);
        assert_eq!(block.device, "/dev/sdb");
    }

    #[test]
    fn removing_last_interface_drops_object() {
        let mut store = Store::from_snapshot(
            SnapshotBuilder::new().block("sdb", 10 * MIB).build(),
            MIB,
        );
        store.apply(ChangeNotification {
            path: block_path("sdb"),
            interface: InterfaceKind::Block,
            change: Change::Removed,
        });
        assert!(store.snapshot().objects.is_empty());
        assert!(store.index().blocks.is_empty());
    }

    #[test]
    fn new_btrfs_uuids_are_reported_once() {
        let mut store = Store::from_snapshot(SnapshotBuilder::new().build(), MIB);
        let added = SnapshotBuilder::new()
            .block("sdc", 10 * MIB)
            .btrfs("sdc", "c0ffee", "data")
            .build();
        let block = added.objects[&block_path("sdc")][&InterfaceKind::Block].clone();

        let first = store.apply(ChangeNotification {
            path: block_path("sdc"),
            interface: InterfaceKind::Block,
            change: Change::Added(block.clone()),
        });
        let second = store.apply(ChangeNotification {
            path: block_path("sdc"),
            interface: InterfaceKind::Block,
            change: Change::Changed(block),
        });

        assert_eq!(first, vec!["c0ffee".to_string()]);
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn watch_polls_subvolumes_of_new_volumes() {
        let fakes = Fakes::new(SnapshotBuilder::new().build());
        fakes.filesystems.set_subvolumes(
            block_path("sdc"),
            vec![BtrfsSubvolume {
                id: 256,
                parent_id: Some(5),
                path: "home".to_string(),
            }],
        );
        let mut store = Store::load(&*fakes.objects, &*fakes.filesystems, MIB, true)
            .await
            .expect("load");

        let added = SnapshotBuilder::new()
            .block("sdc", 10 * MIB)
            .btrfs("sdc", "c0ffee", "data")
            .build();
        for (interface, properties) in added.objects[&block_path("sdc")].clone() {
            fakes.objects.notify(ChangeNotification {
                path: block_path("sdc"),
                interface,
                change: Change::Added(properties),
            });
        }
        let watcher = store.watch(&*fakes.objects, &*fakes.filesystems);
        // The fake stream never ends; stop once the notifications are drained.
        let _ = tokio::time::timeout(std::time::Duration::from_millis(100), watcher).await;

        let index = store.index();
        assert_eq!(index.btrfs_volumes["c0ffee"].subvolumes.len(), 1);
        assert_eq!(fakes.ledger.summaries(), vec!["poll-subvolumes sdc".to_string()]);
    }
}
