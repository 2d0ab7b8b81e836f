// SPDX-License-Identifier: GPL-3.0-only

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use storage_types::ObjectPath;

use crate::error::{CoreError, Result};

/// Devices currently held by a running teardown.
///
/// Locks are all-or-nothing try-locks: a second operation touching any held
/// device fails with [`CoreError::Busy`] instead of waiting.
#[derive(Debug, Clone, Default)]
pub struct DeviceLocks {
    held: Arc<Mutex<BTreeSet<ObjectPath>>>,
}

impl DeviceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn held(&self) -> MutexGuard<'_, BTreeSet<ObjectPath>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn try_lock(&self, paths: impl IntoIterator<Item = ObjectPath>) -> Result<DeviceGuard> {
        let wanted: BTreeSet<ObjectPath> = paths.into_iter().collect();
        let mut held = self.held();
        if let Some(busy) = wanted.iter().find(|path| held.contains(*path)) {
            tracing::debug!(%busy, "device already locked by another operation");
            return Err(CoreError::Busy(busy.clone()));
        }
        held.extend(wanted.iter().cloned());
        Ok(DeviceGuard {
            locks: self.clone(),
            paths: wanted,
        })
    }

    pub fn is_locked(&self, path: &ObjectPath) -> bool {
        self.held().contains(path)
    }
}

/// Releases its devices when dropped.
#[derive(Debug)]
pub struct DeviceGuard {
    locks: DeviceLocks,
    paths: BTreeSet<ObjectPath>,
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        let mut held = self.locks.held();
        for path in &self.paths {
            held.remove(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(name: &str) -> ObjectPath {
        ObjectPath::new(format!("/block_devices/{name}"))
    }

    #[test]
    fn overlapping_sets_conflict() {
        let locks = DeviceLocks::new();
        let _first = locks.try_lock([path("sda1"), path("dm-0")]).expect("first");

        let error = locks
            .try_lock([path("dm-0"), path("sdb")])
            .expect_err("overlap");
        assert!(matches!(error, CoreError::Busy(busy) if busy == path("dm-0")));
        assert!(!locks.is_locked(&path("sdb")));
    }

    #[test]
    fn dropping_the_guard_releases() {
        let locks = DeviceLocks::new();
        drop(locks.try_lock([path("sda1")]).expect("first"));
        assert!(locks.try_lock([path("sda1")]).is_ok());
    }
}
