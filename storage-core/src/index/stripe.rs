// SPDX-License-Identifier: GPL-3.0-only

use storage_types::{LogicalVolume, LvLayout, LvolStatus, LvmStructure, StripeLeg, StripeSummary};

/// Distribution of a logical volume over its physical volumes.
///
/// Plain layouts sum their segments into one leg. RAID layouts get one leg
/// per data sub-volume, with the matching metadata sub-volume folded in.
/// `None` when the structure is absent or too incomplete to tell.
pub fn summarize(lvol: &LogicalVolume) -> Option<StripeSummary> {
    let structure = lvol.structure.as_ref()?;

    if lvol.layout != LvLayout::Thin
        && let Some(segments) = &structure.segments
    {
        return Some(StripeSummary {
            legs: vec![StripeLeg::from_segments(structure.size, segments)],
            has_subvolumes: false,
        });
    }

    let data = structure.data.as_ref()?;
    let metadata = structure.metadata.as_deref().unwrap_or_default();
    if !metadata.is_empty() && metadata.len() != data.len() {
        return None;
    }

    let empty = LvmStructure::default();
    let mut legs = Vec::with_capacity(data.len());
    for (position, data_leg) in data.iter().enumerate() {
        let meta_leg = metadata.get(position).unwrap_or(&empty);
        let data_segments = data_leg.segments.as_ref()?;
        let meta_segments = match metadata.get(position) {
            Some(leg) => leg.segments.as_deref()?,
            None => &[],
        };
        legs.push(StripeLeg::from_segments(
            data_leg.size.saturating_add(meta_leg.size),
            data_segments.iter().chain(meta_segments),
        ));
    }

    Some(StripeSummary {
        legs,
        has_subvolumes: true,
    })
}

/// Redundancy health derived from how many legs lack data.
pub fn status(layout: &LvLayout, summary: &StripeSummary) -> LvolStatus {
    if !summary.has_subvolumes {
        return if summary.missing_bytes() > 0 {
            LvolStatus::Partial
        } else {
            LvolStatus::Healthy
        };
    }

    let total = summary.legs.len();
    let missing = summary.missing_legs();
    if missing == 0 {
        return LvolStatus::Healthy;
    }

    match layout {
        LvLayout::Raid1 | LvLayout::Mirror if total > missing => LvolStatus::Degraded,
        LvLayout::Raid10 if missing <= 1 => LvolStatus::Degraded,
        // Whether each mirror pair kept a survivor depends on which legs are gone.
        LvLayout::Raid10 if missing <= total / 2 => LvolStatus::DegradedMaybePartial,
        LvLayout::Raid4 | LvLayout::Raid5 if missing <= 1 => LvolStatus::Degraded,
        LvLayout::Raid6 if missing <= 2 => LvolStatus::Degraded,
        _ => LvolStatus::Partial,
    }
}
