// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};

use crate::path::ObjectPath;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StratisPool {
    pub path: ObjectPath,
    pub name: String,
    pub uuid: String,
    pub total_physical_size: u64,
    pub total_physical_used: u64,
    pub encrypted: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockdevTier {
    #[default]
    Data,
    Cache,
}

impl BlockdevTier {
    pub fn from_code(code: u64) -> Self {
        if code == 1 { Self::Cache } else { Self::Data }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StratisBlockdev {
    pub path: ObjectPath,
    pub pool: Option<ObjectPath>,
    pub uuid: String,
    pub tier: BlockdevTier,
    /// Device node the blockdev lives on.
    pub physical_path: String,
    pub total_physical_size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StratisFilesystem {
    pub path: ObjectPath,
    pub pool: Option<ObjectPath>,
    pub name: String,
    pub devnode: String,
    pub size: u64,
    pub used: u64,
    pub size_limit: Option<u64>,
}
