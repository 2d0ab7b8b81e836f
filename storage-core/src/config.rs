// SPDX-License-Identifier: GPL-3.0-only

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use storage_types::MIB;

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggingLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LoggingLevel {
    pub fn as_directive(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

/// Tunables of the core, read from a TOML file. Missing keys take defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub log_level: LoggingLevel,

    /// Partition sizes are rounded to this many bytes.
    pub partition_alignment: u64,

    /// Unallocated gaps must be strictly larger than this to count as free space.
    pub min_free_space: u64,

    /// Filesystems mounted here are never unmounted by a teardown.
    pub protected_mount_points: Vec<String>,

    /// Ask the filesystem helper for subvolumes of newly seen Btrfs volumes.
    pub poll_btrfs: bool,

    /// Pause between stopping users of a mount and unmounting it.
    pub stop_grace_ms: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            log_level: LoggingLevel::Info,
            partition_alignment: MIB,
            min_free_space: MIB,
            protected_mount_points: ["/", "/usr", "/boot", "/var"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            poll_btrfs: true,
            stop_grace_ms: 0,
        }
    }
}

impl CoreConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|error| CoreError::Config {
            path: path.to_path_buf(),
            reason: error.to_string(),
        })?;
        toml::from_str(&raw).map_err(|error| CoreError::Config {
            path: path.to_path_buf(),
            reason: error.to_string(),
        })
    }

    pub fn is_protected_mount_point(&self, directory: &str) -> bool {
        self.protected_mount_points
            .iter()
            .any(|protected| protected == directory)
    }
}
