// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};

use crate::path::ObjectPath;

/// An encryption layer on top of a backing block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoContainer {
    pub block: ObjectPath,
    /// Unlocked mapping, if any.
    pub cleartext: Option<ObjectPath>,
    /// Header bytes that are not available to the cleartext device.
    pub metadata_size: u64,
    pub hint_encryption_type: String,
}

impl CryptoContainer {
    pub fn is_unlocked(&self) -> bool {
        self.cleartext.is_some()
    }
}
