// SPDX-License-Identifier: GPL-3.0-only

use storage_core::{Collaborators, CoreConfig, StorageCore, Store};
use storage_testing::{Fakes, SnapshotBuilder};

pub const MIB: u64 = storage_types::MIB;
pub const GIB: u64 = 1024 * MIB;

/// A core wired to fresh fakes serving `builder`'s snapshot.
pub fn core(builder: SnapshotBuilder) -> (Fakes, StorageCore) {
    let snapshot = builder.build();
    let fakes = Fakes::new(snapshot.clone());
    let collab = Collaborators {
        objects: fakes.objects.clone(),
        filesystems: fakes.filesystems.clone(),
        mounts: fakes.mounts.clone(),
        mount_table: fakes.mount_table.clone(),
        passphrases: fakes.passphrases.clone(),
    };
    let config = CoreConfig::default();
    let store = Store::from_snapshot(snapshot, config.min_free_space);
    (fakes, StorageCore::with_store(config, collab, store))
}
