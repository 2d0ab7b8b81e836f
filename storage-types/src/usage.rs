// SPDX-License-Identifier: GPL-3.0-only

//! Records describing what is using a device, computed per request.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::block::ConfigEntry;
use crate::filesystem::ProcessRef;
use crate::path::ObjectPath;

/// The user-facing action that needs the device free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionVerb {
    Format,
    Delete,
    Grow,
    Shrink,
    Deactivate,
    Lock,
    Stop,
    Repair,
}

impl fmt::Display for ActionVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self {
            Self::Format => "format",
            Self::Delete => "delete",
            Self::Grow => "grow",
            Self::Shrink => "shrink",
            Self::Deactivate => "deactivate",
            Self::Lock => "lock",
            Self::Stop => "stop",
            Self::Repair => "repair",
        };
        f.write_str(verb)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRequest {
    pub action: ActionVerb,
    /// Torn-down users are brought back once the action succeeds.
    pub temporary: bool,
}

impl UsageRequest {
    pub fn destructive(action: ActionVerb) -> Self {
        Self {
            action,
            temporary: false,
        }
    }

    pub fn temporary(action: ActionVerb) -> Self {
        Self {
            action,
            temporary: true,
        }
    }
}

/// The object an action is about to operate on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "path")]
pub enum UsageTarget {
    Block(ObjectPath),
    Drive(ObjectPath),
    LogicalVolume(ObjectPath),
    VolumeGroup(ObjectPath),
    StratisPool(ObjectPath),
    MdRaid(ObjectPath),
}

impl UsageTarget {
    pub fn path(&self) -> &ObjectPath {
        match self {
            Self::Block(path)
            | Self::Drive(path)
            | Self::LogicalVolume(path)
            | Self::VolumeGroup(path)
            | Self::StratisPool(path)
            | Self::MdRaid(path) => path,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UsageKind {
    Mounted,
    OpenFiles,
    /// Nothing active, but persistent configuration refers to the device.
    None,
    Swap,
    Crypto,
    PhysicalVolume,
    RaidMember,
    PoolMember,
    BtrfsDevice,
}

/// Reversible or destructive steps that free a device from one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TeardownVerb {
    StopProcesses,
    Unmount,
    RemoveConfig,
    SwapOff,
    Lock,
    RemoveFromGroup,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEntry {
    /// Stack depth above the target; the target itself is level 0.
    pub level: u32,
    pub kind: UsageKind,
    pub block: ObjectPath,
    /// Mount point for mounted filesystems and open files.
    pub location: Option<String>,
    pub verbs: Vec<TeardownVerb>,
    pub blocking: bool,
    /// Restored once the action succeeds.
    pub temporary: bool,
    /// Volume group, pool, array or btrfs uuid this entry is a member of.
    pub container: Option<String>,
    pub processes: Vec<ProcessRef>,
    pub configs: Vec<ConfigEntry>,
    /// Human readable reason when blocking.
    pub reason: Option<String>,
}

impl UsageEntry {
    pub fn new(level: u32, kind: UsageKind, block: ObjectPath) -> Self {
        Self {
            level,
            kind,
            block,
            location: None,
            verbs: Vec::new(),
            blocking: false,
            temporary: false,
            container: None,
            processes: Vec::new(),
            configs: Vec::new(),
            reason: None,
        }
    }

    pub fn blocked(mut self, reason: impl Into<String>) -> Self {
        self.blocking = true;
        self.verbs.clear();
        self.reason = Some(reason.into());
        self
    }

    pub fn has_verb(&self, verb: TeardownVerb) -> bool {
        self.verbs.contains(&verb)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageList {
    pub target: UsageTarget,
    pub request: UsageRequest,
    pub entries: Vec<UsageEntry>,
}

impl UsageList {
    pub fn new(target: UsageTarget, request: UsageRequest) -> Self {
        Self {
            target,
            request,
            entries: Vec::new(),
        }
    }

    pub fn blocking(&self) -> bool {
        self.entries.iter().any(|entry| entry.blocking)
    }

    pub fn needs_teardown(&self) -> bool {
        self.entries.iter().any(|entry| !entry.verbs.is_empty())
    }

    pub fn blocking_entries(&self) -> impl Iterator<Item = &UsageEntry> {
        self.entries.iter().filter(|entry| entry.blocking)
    }

    /// Entries from the deepest level to the shallowest, otherwise in discovery order.
    pub fn teardown_order(&self) -> Vec<&UsageEntry> {
        let mut ordered: Vec<&UsageEntry> = self.entries.iter().collect();
        ordered.sort_by(|a, b| b.level.cmp(&a.level));
        ordered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn teardown_order_is_deepest_first_and_stable() {
        let mut list = UsageList::new(
            UsageTarget::Block(ObjectPath::new("/b/sda1")),
            UsageRequest::temporary(ActionVerb::Shrink),
        );
        list.entries
            .push(UsageEntry::new(0, UsageKind::Crypto, ObjectPath::new("/b/sda1")));
        list.entries
            .push(UsageEntry::new(1, UsageKind::Mounted, ObjectPath::new("/b/dm-0")));
        list.entries
            .push(UsageEntry::new(1, UsageKind::Swap, ObjectPath::new("/b/dm-1")));

        let kinds: Vec<_> = list.teardown_order().iter().map(|entry| entry.kind).collect();
        assert_eq!(kinds, vec![UsageKind::Mounted, UsageKind::Swap, UsageKind::Crypto]);
        assert!(!list.blocking());
    }

    #[test]
    fn blocked_entry_drops_verbs() {
        let mut entry = UsageEntry::new(0, UsageKind::PoolMember, ObjectPath::new("/b/sdc"));
        entry.verbs.push(TeardownVerb::Unmount);
        let entry = entry.blocked("member of pool");
        assert!(entry.blocking);
        assert!(entry.verbs.is_empty());
    }
}
