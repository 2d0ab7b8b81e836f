// SPDX-License-Identifier: GPL-3.0-only

//! Repairing degraded RAID volumes and dropping missing physical volumes.

use serde::{Deserialize, Serialize};

use storage_types::{
    ActionVerb, LvLayout, LvolStatus, ObjectPath, UsageList, UsageRequest, UsageTarget,
    bytes_to_pretty,
};

use crate::config::CoreConfig;
use crate::error::{CoreError, Result};
use crate::index::Index;
use crate::resize::PvSpace;
use crate::usage::resolve;

/// What a repair of a logical volume needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairPlan {
    pub lvol: ObjectPath,
    /// Bytes that have to be rebuilt on new physical volumes.
    pub missing: u64,
    /// Physical volumes that may receive the rebuilt data.
    pub usable: Vec<PvSpace>,
}

impl RepairPlan {
    pub fn available(&self) -> u64 {
        self.usable.iter().map(|space| space.free_size).sum()
    }

    /// Check that `selection` offers enough room, returning it for the repair call.
    pub fn validate(&self, selection: &[ObjectPath]) -> Result<Vec<ObjectPath>> {
        let mut selected = 0u64;
        for pv in selection {
            let Some(space) = self.usable.iter().find(|space| space.block == *pv) else {
                return Err(CoreError::excuse(format!(
                    "{pv} can not be used for this repair"
                )));
            };
            selected += space.free_size;
        }
        if selected < self.missing {
            return Err(CoreError::excuse(format!(
                "An additional {} must be selected",
                bytes_to_pretty(&(self.missing - selected), false)
            )));
        }
        Ok(selection.to_vec())
    }
}

/// Plan the repair of a RAID logical volume that lost some of its legs.
pub fn repair_plan(index: &Index, lvol: &ObjectPath) -> Result<RepairPlan> {
    let volume = index
        .lvols
        .get(lvol)
        .ok_or_else(|| CoreError::NotFound(lvol.clone()))?;
    let group = volume
        .group
        .as_ref()
        .ok_or_else(|| CoreError::NotFound(lvol.clone()))?;
    let Some(summary) = index
        .lvols_stripe_summary
        .get(lvol)
        .filter(|summary| summary.has_subvolumes)
    else {
        return Err(CoreError::excuse(format!(
            "{} has no redundancy to repair",
            volume.name
        )));
    };

    let missing = summary.missing_bytes();
    if missing == 0 {
        return Err(CoreError::excuse(format!("{} is not degraded", volume.name)));
    }

    // A PV already holding an intact leg can not take over a lost one.
    let usable: Vec<PvSpace> = index
        .group_pvols(group)
        .into_iter()
        .filter(|pvol| pvol.free_size > 0)
        .filter(|pvol| {
            !summary
                .legs
                .iter()
                .any(|leg| !leg.is_missing_data() && leg.pvs.contains_key(&pvol.block))
        })
        .map(|pvol| PvSpace {
            block: pvol.block.clone(),
            free_size: pvol.free_size,
        })
        .collect();

    let plan = RepairPlan {
        lvol: lvol.clone(),
        missing,
        usable,
    };
    if plan.available() < missing {
        return Err(CoreError::excuse(format!(
            "There is not enough space available that could be used for a repair. \
             At least {} are needed on physical volumes that are not already used for this logical volume.",
            bytes_to_pretty(&missing, false)
        )));
    }
    tracing::debug!(%lvol, missing, usable = plan.usable.len(), "repair planned");
    Ok(plan)
}

/// Logical volumes to delete before the missing PVs of a group are dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveMissingPlan {
    pub group: ObjectPath,
    /// Linear volumes that lost data; removing the missing PVs would drop them.
    pub lvols: Vec<ObjectPath>,
    /// What has to be torn down to delete them.
    pub usage: UsageList,
}

/// Plan the removal of a group's missing physical volumes.
///
/// Partial linear volumes are deleted explicitly first so their users can be
/// stopped and their configuration removed. Other layouts are left alone.
pub fn remove_missing_plan(
    index: &Index,
    config: &CoreConfig,
    group: &ObjectPath,
) -> Result<RemoveMissingPlan> {
    let vgroup = index
        .vgroups
        .get(group)
        .ok_or_else(|| CoreError::NotFound(group.clone()))?;
    if vgroup.missing_pvs.is_empty() {
        return Err(CoreError::excuse(format!(
            "{} is not missing any physical volumes",
            vgroup.name
        )));
    }

    let request = UsageRequest::destructive(ActionVerb::Delete);
    let mut usage = UsageList::new(UsageTarget::VolumeGroup(group.clone()), request);
    let lvols: Vec<ObjectPath> = index
        .group_lvols(group)
        .into_iter()
        .filter(|lvol| {
            lvol.layout == LvLayout::Linear
                && index.lvols_status.get(&lvol.path) == Some(&LvolStatus::Partial)
        })
        .map(|lvol| lvol.path.clone())
        .collect();

    for lvol in &lvols {
        let lvol_usage = resolve(
            index,
            config,
            &UsageTarget::LogicalVolume(lvol.clone()),
            request,
        );
        usage.entries.extend(lvol_usage.entries);
    }

    Ok(RemoveMissingPlan {
        group: group.clone(),
        lvols,
        usage,
    })
}
