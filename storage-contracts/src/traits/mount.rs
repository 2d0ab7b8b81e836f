// SPDX-License-Identifier: GPL-3.0-only

use async_trait::async_trait;

use storage_types::{MountEntry, ObjectPath, ProcessRef};

use crate::StorageError;

#[async_trait]
pub trait MountHelper: Send + Sync {
    async fn mount(
        &self,
        block: &ObjectPath,
        directory: &str,
        options: &str,
    ) -> Result<(), StorageError>;

    async fn unmount(&self, block: &ObjectPath, directory: &str) -> Result<(), StorageError>;

    /// Processes holding files open below `directory`.
    async fn find_users(&self, directory: &str) -> Result<Vec<ProcessRef>, StorageError>;

    async fn stop_users(&self, processes: &[ProcessRef]) -> Result<(), StorageError>;

    async fn is_mounted(&self, block: &ObjectPath) -> Result<bool, StorageError>;
}

/// Persistent mount configuration, keyed by (device, directory, options).
#[async_trait]
pub trait MountTable: Send + Sync {
    async fn entries(&self) -> Result<Vec<MountEntry>, StorageError>;

    async fn add_entry(&self, entry: &MountEntry) -> Result<(), StorageError>;

    async fn update_entry(&self, old: &MountEntry, new: &MountEntry)
    -> Result<(), StorageError>;

    async fn remove_entry(&self, entry: &MountEntry) -> Result<(), StorageError>;
}
