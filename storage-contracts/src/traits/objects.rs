// SPDX-License-Identifier: GPL-3.0-only

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::Value;

use storage_types::{ChangeNotification, InterfaceKind, ObjectPath, Properties};

use crate::StorageError;

pub type ChangeStream = BoxStream<'static, ChangeNotification>;

/// The remote object system: enumeration, property reads, change
/// notifications and method invocation.
#[async_trait]
pub trait ObjectSource: Send + Sync {
    async fn list_objects(&self, kind: InterfaceKind) -> Result<Vec<ObjectPath>, StorageError>;

    async fn get_properties(
        &self,
        path: &ObjectPath,
        kind: InterfaceKind,
    ) -> Result<Properties, StorageError>;

    /// Invoke `method` on the `kind` interface of `path`. Arguments and the
    /// reply are JSON encoded.
    async fn call_method(
        &self,
        path: &ObjectPath,
        kind: InterfaceKind,
        method: &str,
        args: Value,
    ) -> Result<Value, StorageError>;

    async fn subscribe(&self) -> Result<ChangeStream, StorageError>;
}
