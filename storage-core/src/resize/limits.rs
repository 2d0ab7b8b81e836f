// SPDX-License-Identifier: GPL-3.0-only

//! How far a volume can grow, and where new extents go.

use serde::{Deserialize, Serialize};

use storage_types::{GrowLimit, LogicalVolume, LvLayout, ObjectPath, StripeSummary};

use crate::error::{CoreError, Result};
use crate::index::Index;

use super::ResizeVolume;

/// A physical volume offered for new extents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PvSpace {
    pub block: ObjectPath,
    pub free_size: u64,
}

/// Usable size added by growing over PVs with `free_sizes` free bytes each.
///
/// Without legs the free space simply adds up. RAID layouts are limited by
/// their smallest PV; a layout that can not be built from that many PVs
/// yields zero.
pub fn max_grow_size(layout: &LvLayout, free_sizes: &[u64], has_legs: bool) -> u64 {
    if !has_legs {
        return free_sizes.iter().sum();
    }

    let count = free_sizes.len() as u64;
    let min = free_sizes.iter().copied().min().unwrap_or(0);
    match layout {
        LvLayout::Raid0 => count * min,
        LvLayout::Raid1 | LvLayout::Mirror if count >= 2 => min,
        LvLayout::Raid10 if count >= 4 => (count / 2) * min,
        LvLayout::Raid4 | LvLayout::Raid5 if count >= 3 => (count - 1) * min,
        LvLayout::Raid6 if count >= 5 => (count - 2) * min,
        _ => {
            tracing::error!(%layout, pvs = count, "can not compute grow size for this layout");
            0
        }
    }
}

/// Stripe legs of a RAID volume; `None` for layouts without redundancy legs.
pub(super) fn legs<'a>(index: &'a Index, lvol: &LogicalVolume) -> Option<&'a StripeSummary> {
    let redundant = matches!(
        lvol.layout,
        LvLayout::Raid0
            | LvLayout::Raid1
            | LvLayout::Raid10
            | LvLayout::Raid4
            | LvLayout::Raid5
            | LvLayout::Raid6
            | LvLayout::Mirror
    );
    if !redundant {
        return None;
    }
    index
        .lvols_stripe_summary
        .get(&lvol.path)
        .filter(|summary| summary.has_subvolumes)
}

/// Physical volumes of the volume's group that still have free space.
pub fn available_pvs(index: &Index, lvol: &LogicalVolume) -> Vec<PvSpace> {
    let Some(group) = &lvol.group else {
        return Vec::new();
    };
    index
        .group_pvols(group)
        .into_iter()
        .filter(|pvol| pvol.free_size > 0)
        .map(|pvol| PvSpace {
            block: pvol.block.clone(),
            free_size: pvol.free_size,
        })
        .collect()
}

/// Default PV selection for a grow.
///
/// Plain volumes get every PV with free space. RAID volumes get, per leg, the
/// PV the leg already lives on with the most free space, then other PVs until
/// there is one per leg.
pub fn initial_pvs(index: &Index, lvol: &LogicalVolume) -> Vec<PvSpace> {
    let spaces = available_pvs(index, lvol);
    let Some(summary) = legs(index, lvol) else {
        return spaces;
    };

    let mut selected: Vec<PvSpace> = Vec::new();
    for leg in &summary.legs {
        let best = spaces
            .iter()
            .filter(|space| leg.pvs.contains_key(&space.block))
            .max_by_key(|space| space.free_size);
        if let Some(best) = best
            && !selected.contains(best)
        {
            selected.push(best.clone());
        }
    }
    for space in &spaces {
        if selected.len() >= summary.legs.len() {
            break;
        }
        if !selected.contains(space) {
            selected.push(space.clone());
        }
    }
    selected
}

/// Map a PV selection to the argument of the volume resize.
///
/// RAID volumes need exactly one PV per leg: each leg first keeps a selected
/// PV it already uses, the remaining legs take the leftovers in order.
pub fn prepare_pvs(
    index: &Index,
    lvol: &LogicalVolume,
    selection: &[ObjectPath],
) -> Result<Vec<ObjectPath>> {
    let Some(summary) = legs(index, lvol) else {
        return Ok(selection.to_vec());
    };
    if selection.len() != summary.legs.len() {
        return Err(CoreError::excuse(format!(
            "Exactly {} physical volumes must be selected",
            summary.legs.len()
        )));
    }

    let mut assigned: Vec<Option<ObjectPath>> = vec![None; summary.legs.len()];
    for (slot, leg) in assigned.iter_mut().zip(&summary.legs) {
        *slot = leg
            .pvs
            .keys()
            .find(|pv| selection.contains(pv))
            .cloned();
    }
    // Two legs may share a PV; only the first one keeps it.
    for position in 0..assigned.len() {
        if let Some(pv) = assigned[position].clone()
            && assigned[..position].contains(&Some(pv))
        {
            assigned[position] = None;
        }
    }
    for position in 0..assigned.len() {
        if assigned[position].is_some() {
            continue;
        }
        let leftover = selection
            .iter()
            .find(|pv| !assigned.contains(&Some((*pv).clone())))
            .cloned();
        assigned[position] = leftover;
    }

    Ok(assigned.into_iter().flatten().collect())
}

/// Largest size the volume may grow to.
pub fn grow_limit(index: &Index, volume: &ResizeVolume) -> Option<GrowLimit> {
    match volume {
        ResizeVolume::Partition(block) => {
            let partition = index.partitions.get(block)?;
            Some(GrowLimit {
                max_size: partition.size + index.free_space_after_partition(block),
                unbounded: false,
            })
        }
        ResizeVolume::LogicalVolume(path) => {
            let lvol = index.lvols.get(path)?;
            if let Some(pool) = lvol.thin_pool.as_ref().and_then(|pool| index.lvols.get(pool)) {
                return Some(GrowLimit {
                    max_size: pool.size.saturating_mul(3),
                    unbounded: true,
                });
            }
            let free: Vec<u64> = initial_pvs(index, lvol)
                .iter()
                .map(|space| space.free_size)
                .collect();
            Some(GrowLimit {
                max_size: lvol.size + max_grow_size(&lvol.layout, &free, legs(index, lvol).is_some()),
                unbounded: false,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use storage_testing::fixtures::{
        SnapshotBuilder, block_path, linear_structure, lv_path, raid_structure,
    };
    use storage_types::MIB;

    use super::*;

    const GIB: u64 = 1024 * MIB;

    #[test]
    fn max_grow_arithmetic() {
        let free = [4 * GIB, 2 * GIB, 3 * GIB, 5 * GIB, 6 * GIB];
        assert_eq!(max_grow_size(&LvLayout::Linear, &free, false), 20 * GIB);
        assert_eq!(max_grow_size(&LvLayout::Raid0, &free[..3], true), 6 * GIB);
        assert_eq!(max_grow_size(&LvLayout::Raid1, &free[..2], true), 2 * GIB);
        assert_eq!(max_grow_size(&LvLayout::Raid10, &free[..4], true), 4 * GIB);
        assert_eq!(max_grow_size(&LvLayout::Raid5, &free[..3], true), 4 * GIB);
        assert_eq!(max_grow_size(&LvLayout::Raid6, &free, true), 6 * GIB);
    }

    #[test]
    fn too_few_members_yield_nothing() {
        assert_eq!(max_grow_size(&LvLayout::Raid1, &[GIB], true), 0);
        assert_eq!(max_grow_size(&LvLayout::Raid10, &[GIB; 3], true), 0);
        assert_eq!(max_grow_size(&LvLayout::Raid5, &[GIB; 2], true), 0);
        assert_eq!(max_grow_size(&LvLayout::Raid6, &[GIB; 4], true), 0);
        assert_eq!(max_grow_size(&LvLayout::Thin, &[GIB; 4], true), 0);
    }

    fn mirrored() -> Index {
        let snapshot = SnapshotBuilder::new()
            .block("sdb", 20 * GIB)
            .block("sdc", 20 * GIB)
            .block("sdd", 20 * GIB)
            .volume_group("vg0", 60 * GIB, 34 * GIB, 4 * MIB)
            .physical_volume("sdb", "vg0", 20 * GIB, 10 * GIB)
            .physical_volume("sdc", "vg0", 20 * GIB, 4 * GIB)
            .physical_volume("sdd", "vg0", 20 * GIB, 20 * GIB)
            .logical_volume(
                "vg0",
                "mirror",
                "raid1",
                10 * GIB,
                raid_structure(
                    "raid1",
                    10 * GIB,
                    &[&[(10 * GIB, Some("sdb"))], &[(10 * GIB, Some("sdc"))]],
                ),
            )
            .build();
        Index::build(&snapshot, MIB)
    }

    #[test]
    fn initial_selection_reuses_leg_pvs() {
        let index = mirrored();
        let lvol = &index.lvols[&lv_path("vg0", "mirror")];

        let blocks: Vec<_> = initial_pvs(&index, lvol)
            .into_iter()
            .map(|space| space.block)
            .collect();
        assert_eq!(blocks, vec![block_path("sdb"), block_path("sdc")]);

        let limit = grow_limit(&index, &ResizeVolume::LogicalVolume(lvol.path.clone()))
            .expect("limit");
        assert_eq!(limit.max_size, 14 * GIB);
        assert!(!limit.unbounded);
    }

    #[test]
    fn prepare_assigns_one_pv_per_leg() {
        let index = mirrored();
        let lvol = &index.lvols[&lv_path("vg0", "mirror")];

        let pvs = prepare_pvs(&index, lvol, &[block_path("sdd"), block_path("sdc")])
            .expect("selection");
        assert_eq!(pvs, vec![block_path("sdd"), block_path("sdc")]);

        let error = prepare_pvs(&index, lvol, &[block_path("sdd")]).expect_err("one short");
        assert_eq!(
            error.to_string(),
            "Exactly 2 physical volumes must be selected"
        );
    }

    #[test]
    fn thin_volume_may_overcommit() {
        let snapshot = SnapshotBuilder::new()
            .volume_group("vg0", 20 * GIB, 10 * GIB, 4 * MIB)
            .thin_pool("vg0", "pool", 8 * GIB)
            .thin_volume("vg0", "thin", "pool", 20 * GIB)
            .build();
        let index = Index::build(&snapshot, MIB);

        let limit = grow_limit(&index, &ResizeVolume::LogicalVolume(lv_path("vg0", "thin")))
            .expect("limit");
        assert_eq!(limit.max_size, 24 * GIB);
        assert!(limit.unbounded);
    }

    #[test]
    fn linear_volume_offers_all_free_space() {
        let snapshot = SnapshotBuilder::new()
            .block("sdb", 20 * GIB)
            .block("sdc", 20 * GIB)
            .volume_group("vg0", 40 * GIB, 25 * GIB, 4 * MIB)
            .physical_volume("sdb", "vg0", 20 * GIB, 5 * GIB)
            .physical_volume("sdc", "vg0", 20 * GIB, 20 * GIB)
            .logical_volume(
                "vg0",
                "data",
                "linear",
                15 * GIB,
                linear_structure(15 * GIB, &[(15 * GIB, Some("sdb"))]),
            )
            .build();
        let index = Index::build(&snapshot, MIB);

        let limit = grow_limit(&index, &ResizeVolume::LogicalVolume(lv_path("vg0", "data")))
            .expect("limit");
        assert_eq!(limit.max_size, 40 * GIB);
    }

    #[test]
    fn partition_grows_into_following_gap() {
        let snapshot = SnapshotBuilder::new()
            .block("sda", 1000 * MIB)
            .partition_table("sda", "gpt")
            .partition("sda1", "sda", MIB, 300 * MIB)
            .build();
        let index = Index::build(&snapshot, MIB);

        let limit = grow_limit(&index, &ResizeVolume::Partition(block_path("sda1"))).expect("limit");
        assert_eq!(limit.max_size, 999 * MIB);
    }
}
