// SPDX-License-Identifier: GPL-3.0-only

pub mod error;
pub mod id;
pub mod operations;

pub use error::{StorageError, StorageErrorKind};
pub use id::OperationId;
pub use operations::{OperationEvent, OperationKind, OperationProgress};
