// SPDX-License-Identifier: GPL-3.0-only

use std::path::PathBuf;

use thiserror::Error;

use storage_contracts::{StorageError, StorageErrorKind};
use storage_types::{ObjectPath, UsageList};

#[derive(Debug, Error)]
pub enum CoreError {
    /// The operation is not possible for this device; shown to the user as is.
    #[error("{0}")]
    Excuse(String),

    #[error("{target} is in use: {summary}")]
    Blocked {
        target: ObjectPath,
        summary: String,
        usage: Box<UsageList>,
    },

    #[error("{0} is busy with another operation")]
    Busy(ObjectPath),

    #[error("object not found: {0}")]
    NotFound(ObjectPath),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Remote(#[from] StorageError),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("configuration error in {path:?}: {reason}")]
    Config { path: PathBuf, reason: String },
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    pub fn blocked(usage: UsageList) -> Self {
        let summary = usage
            .blocking_entries()
            .map(|entry| {
                entry
                    .reason
                    .clone()
                    .unwrap_or_else(|| format!("{} is in use", entry.block))
            })
            .collect::<Vec<_>>()
            .join("; ");
        Self::Blocked {
            target: usage.target.path().clone(),
            summary,
            usage: Box::new(usage),
        }
    }

    pub fn excuse(message: impl Into<String>) -> Self {
        Self::Excuse(message.into())
    }

    /// A state that the capability checks should have ruled out.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Remote(error) if error.is_auth_failure())
    }
}

impl CoreError {
    /// The error as reported to observers of an operation.
    pub fn to_storage_error(&self) -> StorageError {
        let kind = match self {
            CoreError::Excuse(_) => StorageErrorKind::Unsupported,
            CoreError::Blocked { .. } | CoreError::Busy(_) => StorageErrorKind::Busy,
            CoreError::NotFound(_) => StorageErrorKind::NotFound,
            CoreError::Cancelled => StorageErrorKind::Cancelled,
            CoreError::Remote(remote) => return remote.clone(),
            CoreError::Internal(_) => StorageErrorKind::Internal,
            CoreError::Config { .. } => StorageErrorKind::InvalidInput,
        };
        StorageError::new(kind, self.to_string())
    }
}

impl From<CoreError> for StorageError {
    fn from(error: CoreError) -> Self {
        error.to_storage_error()
    }
}

#[cfg(test)]
mod tests {
    use storage_types::{
        ActionVerb, UsageEntry, UsageKind, UsageRequest, UsageTarget,
    };

    use super::*;

    #[test]
    fn blocked_error_lists_reasons() {
        let target = ObjectPath::new("/block_devices/sdb");
        let mut usage = UsageList::new(
            UsageTarget::Block(target.clone()),
            UsageRequest::destructive(ActionVerb::Format),
        );
        usage.entries.push(
            UsageEntry::new(0, UsageKind::PoolMember, target.clone())
                .blocked("sdb is part of Stratis pool tank"),
        );

        let error = CoreError::blocked(usage);
        assert_eq!(
            error.to_string(),
            "/block_devices/sdb is in use: sdb is part of Stratis pool tank"
        );
        assert_eq!(StorageError::from(error).kind, StorageErrorKind::Busy);
    }

    #[test]
    fn remote_errors_pass_through_unchanged() {
        let remote = StorageError::new(StorageErrorKind::Timeout, "no reply");
        let converted = StorageError::from(CoreError::from(remote.clone()));
        assert_eq!(converted, remote);
    }
}
