// SPDX-License-Identifier: GPL-3.0-only

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{OperationId, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Teardown,
    Resize,
    Format,
    Repair,
}

/// A phase change inside a running operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationProgress {
    pub operation_id: OperationId,
    pub operation: OperationKind,
    pub phase: String,
    pub steps_done: u32,
    pub steps_total: Option<u32>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "payload")]
pub enum OperationEvent {
    Progress(OperationProgress),
    Completed {
        operation_id: OperationId,
        operation: OperationKind,
    },
    Failed {
        operation_id: OperationId,
        operation: OperationKind,
        error: StorageError,
    },
}

impl OperationEvent {
    pub fn operation_id(&self) -> OperationId {
        match self {
            Self::Progress(progress) => progress.operation_id,
            Self::Completed { operation_id, .. } | Self::Failed { operation_id, .. } => {
                *operation_id
            }
        }
    }
}
