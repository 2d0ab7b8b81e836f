// SPDX-License-Identifier: GPL-3.0-only

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::path::ObjectPath;

/// Logical volume layout as reported by LVM.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LvLayout {
    #[default]
    Linear,
    Raid0,
    Raid1,
    Raid10,
    Raid4,
    Raid5,
    Raid6,
    Mirror,
    Thin,
    ThinPool,
    Vdo,
    VdoPool,
    Other(String),
}

impl LvLayout {
    pub fn parse(value: &str) -> Self {
        match value {
            "linear" | "" => Self::Linear,
            "raid0" => Self::Raid0,
            "raid1" => Self::Raid1,
            "raid10" => Self::Raid10,
            "raid4" => Self::Raid4,
            "raid5" | "raid5_ls" | "raid5_la" | "raid5_rs" | "raid5_ra" | "raid5_n" => Self::Raid5,
            "raid6" | "raid6_zr" | "raid6_nr" | "raid6_nc" => Self::Raid6,
            "mirror" => Self::Mirror,
            "thin" => Self::Thin,
            "pool" | "thin-pool" => Self::ThinPool,
            "vdo" => Self::Vdo,
            "vdo-pool" | "vdopool" => Self::VdoPool,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for LvLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Linear => "linear",
            Self::Raid0 => "raid0",
            Self::Raid1 => "raid1",
            Self::Raid10 => "raid10",
            Self::Raid4 => "raid4",
            Self::Raid5 => "raid5",
            Self::Raid6 => "raid6",
            Self::Mirror => "mirror",
            Self::Thin => "thin",
            Self::ThinPool => "pool",
            Self::Vdo => "vdo",
            Self::VdoPool => "vdopool",
            Self::Other(other) => other,
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeGroup {
    pub path: ObjectPath,
    pub name: String,
    pub size: u64,
    pub free_size: u64,
    pub extent_size: u64,
    /// Identifiers of physical volumes LVM knows about but cannot find.
    pub missing_pvs: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalVolume {
    pub block: ObjectPath,
    pub group: Option<ObjectPath>,
    pub size: u64,
    pub free_size: u64,
}

impl PhysicalVolume {
    pub fn used_size(&self) -> u64 {
        self.size.saturating_sub(self.free_size)
    }
}

/// A contiguous run of extents. `pv == None` marks extents on a missing PV.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub start: u64,
    pub size: u64,
    pub pv: Option<ObjectPath>,
}

/// Physical layout of a logical volume, possibly nested for RAID legs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LvmStructure {
    pub layout_type: String,
    pub size: u64,
    pub segments: Option<Vec<Segment>>,
    pub data: Option<Vec<LvmStructure>>,
    pub metadata: Option<Vec<LvmStructure>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalVolume {
    pub path: ObjectPath,
    pub name: String,
    pub group: Option<ObjectPath>,
    pub size: u64,
    pub layout: LvLayout,
    pub thin_pool: Option<ObjectPath>,
    pub active: bool,
    pub structure: Option<LvmStructure>,
}

impl LogicalVolume {
    pub fn is_thin_pool(&self) -> bool {
        self.layout == LvLayout::ThinPool
    }
}

/// Key of a stripe-summary entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StripeKey {
    Pv(ObjectPath),
    Missing,
}

/// Bytes of one leg, per physical volume, plus whatever could not be located.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StripeLeg {
    pub pvs: BTreeMap<ObjectPath, u64>,
    pub missing: u64,
}

impl StripeLeg {
    /// Sum segment sizes per PV against the nominal size of the leg.
    pub fn from_segments<'a>(nominal: u64, segments: impl IntoIterator<Item = &'a Segment>) -> Self {
        let mut leg = Self::default();
        let mut total: u64 = 0;
        for segment in segments {
            let key = match &segment.pv {
                Some(pv) => StripeKey::Pv(pv.clone()),
                None => StripeKey::Missing,
            };
            leg.add(key, segment.size);
            total = total.saturating_add(segment.size);
        }
        if total < nominal {
            leg.missing += nominal - total;
        }
        leg
    }

    fn add(&mut self, key: StripeKey, bytes: u64) {
        match key {
            StripeKey::Pv(pv) => *self.pvs.entry(pv).or_default() += bytes,
            StripeKey::Missing => self.missing += bytes,
        }
    }

    pub fn get(&self, key: &StripeKey) -> u64 {
        match key {
            StripeKey::Pv(pv) => self.pvs.get(pv).copied().unwrap_or(0),
            StripeKey::Missing => self.missing,
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = (StripeKey, u64)> + '_ {
        self.pvs
            .iter()
            .map(|(pv, bytes)| (StripeKey::Pv(pv.clone()), *bytes))
            .chain((self.missing > 0).then_some((StripeKey::Missing, self.missing)))
    }

    pub fn total(&self) -> u64 {
        self.pvs.values().sum::<u64>() + self.missing
    }

    pub fn is_missing_data(&self) -> bool {
        self.missing > 0
    }
}

/// Per-leg distribution of a logical volume over its physical volumes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StripeSummary {
    pub legs: Vec<StripeLeg>,
    /// True when derived from data/metadata sub-volumes (RAID legs), false
    /// for a single leg summed from plain segments.
    pub has_subvolumes: bool,
}

impl StripeSummary {
    pub fn missing_legs(&self) -> usize {
        self.legs.iter().filter(|leg| leg.is_missing_data()).count()
    }

    pub fn missing_bytes(&self) -> u64 {
        self.legs.iter().map(|leg| leg.missing).sum()
    }
}

/// Redundancy health of a logical volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LvolStatus {
    Healthy,
    Degraded,
    /// Too many raid10 legs are missing to know whether every mirror pair
    /// still has one survivor.
    DegradedMaybePartial,
    Partial,
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn shortfall_is_recorded_as_missing() {
        let pv_b = ObjectPath::new("/pvs/b");
        let segments = [Segment {
            start: 0,
            size: 4 * GIB,
            pv: Some(pv_b.clone()),
        }];
        let leg = StripeLeg::from_segments(10 * GIB, &segments);

        assert_eq!(leg.get(&StripeKey::Pv(pv_b)), 4 * GIB);
        assert_eq!(leg.get(&StripeKey::Missing), 6 * GIB);
        assert_eq!(leg.total(), 10 * GIB);
        assert_eq!(leg.entries().count(), 2);
    }

    #[test]
    fn layout_names_parse_to_families() {
        assert_eq!(LvLayout::parse("raid5_ls"), LvLayout::Raid5);
        assert_eq!(LvLayout::parse("pool"), LvLayout::ThinPool);
        assert_eq!(LvLayout::parse("cache"), LvLayout::Other("cache".to_string()));
        assert_eq!(LvLayout::Raid10.to_string(), "raid10");
    }
}
