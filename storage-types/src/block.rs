// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};

use crate::path::ObjectPath;

/// Symlink prefix marking the device-mapper node of a multipath device.
pub const MULTIPATH_SYMLINK_PREFIX: &str = "/dev/disk/by-id/dm-uuid-mpath-";

/// What the probed content of a block is used for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdUsage {
    Filesystem,
    Crypto,
    Raid,
    Other,
    #[default]
    Unknown,
}

impl IdUsage {
    pub fn parse(value: &str) -> Self {
        match value {
            "filesystem" => Self::Filesystem,
            "crypto" => Self::Crypto,
            "raid" => Self::Raid,
            "other" => Self::Other,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigKind {
    Fstab,
    Crypttab,
}

/// A persistent configuration record (fstab or crypttab line) attached to a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub kind: ConfigKind,
    /// Mount directory for fstab entries.
    pub directory: Option<String>,
    pub options: String,
}

impl ConfigEntry {
    pub fn has_option(&self, option: &str) -> bool {
        self.options.split(',').any(|candidate| candidate == option)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub path: ObjectPath,
    pub device: String,
    pub preferred_device: String,
    pub symlinks: Vec<String>,
    pub size: u64,
    pub read_only: bool,
    pub drive: Option<ObjectPath>,
    pub id_usage: IdUsage,
    pub id_type: String,
    pub id_uuid: String,
    pub id_version: String,
    pub id_label: String,
    pub crypto_backing_device: Option<ObjectPath>,
    pub mdraid: Option<ObjectPath>,
    pub mdraid_member: Option<ObjectPath>,
    pub configuration: Vec<ConfigEntry>,
}

impl Block {
    pub fn is_multipath_master(&self) -> bool {
        self.symlinks
            .iter()
            .any(|link| link.starts_with(MULTIPATH_SYMLINK_PREFIX))
    }

    /// eMMC hardware boot and RPMB partitions (`mmcblk0boot1`, `mmcblk0rpmb`).
    pub fn is_emmc_special(&self) -> bool {
        let Some(name) = self.device.strip_prefix("/dev/mmcblk") else {
            return false;
        };
        let rest = name.trim_start_matches(|c: char| c.is_ascii_digit());
        if rest.len() == name.len() {
            return false;
        }
        match rest.strip_prefix("boot") {
            Some(index) => !index.is_empty() && index.chars().all(|c| c.is_ascii_digit()),
            None => rest == "rpmb",
        }
    }

    /// Device names this block answers to, without the `/dev/` prefix.
    pub fn slashdev_names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.device.as_str())
            .chain(std::iter::once(self.preferred_device.as_str()))
            .chain(self.symlinks.iter().map(String::as_str))
            .filter_map(|name| name.strip_prefix("/dev/"))
    }

    pub fn fstab_entries(&self) -> impl Iterator<Item = &ConfigEntry> {
        self.configuration
            .iter()
            .filter(|entry| entry.kind == ConfigKind::Fstab)
    }

    pub fn crypttab_entries(&self) -> impl Iterator<Item = &ConfigEntry> {
        self.configuration
            .iter()
            .filter(|entry| entry.kind == ConfigKind::Crypttab)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Drive {
    pub path: ObjectPath,
    pub vendor: String,
    pub model: String,
    pub serial: String,
    pub size: u64,
    pub removable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(device: &str) -> Block {
        Block {
            device: device.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn emmc_boot_partitions_are_special() {
        assert!(block("/dev/mmcblk0boot0").is_emmc_special());
        assert!(block("/dev/mmcblk12boot1").is_emmc_special());
        assert!(block("/dev/mmcblk0rpmb").is_emmc_special());
        assert!(!block("/dev/mmcblk0").is_emmc_special());
        assert!(!block("/dev/mmcblk0p1").is_emmc_special());
        assert!(!block("/dev/mmcblkboot0").is_emmc_special());
        assert!(!block("/dev/sda").is_emmc_special());
    }

    #[test]
    fn multipath_master_is_detected_by_symlink() {
        let mut master = block("/dev/dm-0");
        master.symlinks = vec!["/dev/disk/by-id/dm-uuid-mpath-3600".to_string()];
        assert!(master.is_multipath_master());
        assert!(!block("/dev/sdb").is_multipath_master());
    }

    #[test]
    fn option_lookup_matches_whole_words() {
        let entry = ConfigEntry {
            kind: ConfigKind::Fstab,
            directory: Some("/data".to_string()),
            options: "defaults,x-parent=abc,noauto".to_string(),
        };
        assert!(entry.has_option("noauto"));
        assert!(!entry.has_option("auto"));
    }
}
