// SPDX-License-Identifier: GPL-3.0-only

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use storage_types::{BtrfsSubvolume, ObjectPath, ResizeSupport, ResizeTarget};

use crate::StorageError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatRequest {
    pub fs_type: String,
    pub label: Option<String>,
    /// Overwrite existing data with zeroes first.
    pub erase: bool,
    pub mount_point: Option<String>,
    pub mount_options: Option<String>,
}

/// Helpers that create, resize and check filesystems on a block.
#[async_trait]
pub trait FilesystemHelper: Send + Sync {
    async fn format(&self, block: &ObjectPath, request: &FormatRequest)
    -> Result<(), StorageError>;

    async fn resize(&self, block: &ObjectPath, target: ResizeTarget) -> Result<(), StorageError>;

    async fn repair(&self, block: &ObjectPath) -> Result<(), StorageError>;

    /// `None` when the service has no resize tooling for `fs_type`.
    async fn resize_support(&self, fs_type: &str) -> Result<Option<ResizeSupport>, StorageError>;

    async fn btrfs_subvolumes(
        &self,
        block: &ObjectPath,
    ) -> Result<Vec<BtrfsSubvolume>, StorageError>;
}
