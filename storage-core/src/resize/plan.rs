// SPDX-License-Identifier: GPL-3.0-only

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use storage_types::{
    DeviceKind, ObjectPath, ResizeDirection, ResizeTarget, bytes_to_pretty, round_down, round_up,
};

use crate::config::CoreConfig;
use crate::error::{CoreError, Result};
use crate::index::Index;

use super::info::get_resize_info;
use super::limits::{grow_limit, initial_pvs, legs, max_grow_size, prepare_pvs};
use super::{ResizeOptions, ResizeVolume};

/// One remote action of a resize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "step")]
pub enum Step {
    /// Repair the filesystem first when it turns out to be unmounted.
    RepairIfOffline { block: ObjectPath },
    ResizeFilesystem {
        block: ObjectPath,
        target: ResizeTarget,
    },
    ResizeCrypto {
        block: ObjectPath,
        target: ResizeTarget,
    },
    ResizeLogicalVolume {
        lvol: ObjectPath,
        size: u64,
        pvs: Option<Vec<ObjectPath>>,
    },
    ResizePartition { block: ObjectPath, size: u64 },
    GrowVdo { vdo: ObjectPath },
    GrowStratisBlockdev { pool: ObjectPath, uuid: String },
}

fn target_label(target: &ResizeTarget) -> String {
    match target {
        ResizeTarget::Fill => "fill".to_string(),
        ResizeTarget::Bytes(bytes) => bytes_to_pretty(bytes, false),
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RepairIfOffline { block } => {
                write!(f, "repair filesystem on {} if offline", block.basename())
            }
            Self::ResizeFilesystem { block, target } => write!(
                f,
                "resize filesystem on {} to {}",
                block.basename(),
                target_label(target)
            ),
            Self::ResizeCrypto { block, target } => write!(
                f,
                "resize encryption on {} to {}",
                block.basename(),
                target_label(target)
            ),
            Self::ResizeLogicalVolume { lvol, size, .. } => write!(
                f,
                "resize logical volume {} to {}",
                lvol.basename(),
                bytes_to_pretty(size, false)
            ),
            Self::ResizePartition { block, size } => write!(
                f,
                "resize partition {} to {}",
                block.basename(),
                bytes_to_pretty(size, false)
            ),
            Self::GrowVdo { vdo } => write!(f, "grow VDO volume {}", vdo.basename()),
            Self::GrowStratisBlockdev { pool, uuid } => {
                write!(f, "grow blockdev {uuid} of Stratis pool {}", pool.basename())
            }
        }
    }
}

/// Ordered steps of a resize plus what has to happen around them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizePlan {
    pub volume: ResizeVolume,
    pub direction: ResizeDirection,
    pub current_size: u64,
    /// Requested size after rounding to the volume's granularity.
    pub target_size: u64,
    pub block: ObjectPath,
    /// Encrypted block whose resize may need a passphrase.
    pub crypto_block: Option<ObjectPath>,
    /// The content must be unmounted for the duration of the steps.
    pub needs_unmount: bool,
    /// LUKS2 headers need a passphrase to be resized.
    pub passphrase_hint: bool,
    pub steps: Vec<Step>,
}

/// A content shrink the capability checks should have rejected.
fn disallowed(message: &str) -> CoreError {
    tracing::error!(message, "resize plan reached a disallowed step");
    debug_assert!(false, "disallowed resize step: {message}");
    CoreError::internal(message)
}

/// The encrypted container on `block`, if any, with its cleartext and header size.
fn content_of(index: &Index, block: &ObjectPath) -> Result<(ObjectPath, Option<u64>)> {
    match index.crypto.get(block) {
        Some(crypto) => {
            let cleartext = crypto
                .cleartext
                .clone()
                .ok_or_else(|| CoreError::excuse("Unlock before resizing"))?;
            Ok((cleartext, Some(crypto.metadata_size)))
        }
        None => Ok((block.clone(), None)),
    }
}

fn content_steps(
    index: &Index,
    content: &ObjectPath,
    direction: ResizeDirection,
    available: u64,
    target: ResizeTarget,
) -> Result<Vec<Step>> {
    if index.filesystems.contains_key(content) {
        return Ok(vec![
            Step::RepairIfOffline {
                block: content.clone(),
            },
            Step::ResizeFilesystem {
                block: content.clone(),
                target,
            },
        ]);
    }

    if let Some(vdo) = index
        .blocks_vdo
        .get(content)
        .and_then(|vdo| index.vdos.get(vdo))
    {
        return match available.cmp(&vdo.physical_size) {
            Ordering::Greater => Ok(vec![Step::GrowVdo {
                vdo: vdo.path.clone(),
            }]),
            Ordering::Less => Err(disallowed("VDO backing devices can not be made smaller")),
            Ordering::Equal => Ok(Vec::new()),
        };
    }

    if let Some(blockdev) = index
        .blocks_stratis_blockdev
        .get(content)
        .and_then(|blockdev| index.stratis_blockdevs.get(blockdev))
    {
        return match available.cmp(&blockdev.total_physical_size) {
            Ordering::Greater => {
                let pool = blockdev.pool.clone().ok_or_else(|| {
                    CoreError::internal(format!("blockdev {} has no pool", blockdev.uuid))
                })?;
                Ok(vec![Step::GrowStratisBlockdev {
                    pool,
                    uuid: blockdev.uuid.clone(),
                }])
            }
            Ordering::Less => Err(disallowed("Stratis blockdevs can not be made smaller")),
            Ordering::Equal => Ok(Vec::new()),
        };
    }

    match index.kind(content).map(DeviceKind::content) {
        Some(DeviceKind::Unformatted) => Ok(Vec::new()),
        _ if direction == ResizeDirection::Shrink => {
            Err(disallowed("Unrecognized data can not be made smaller here"))
        }
        _ => Ok(Vec::new()),
    }
}

/// Size that just holds the volume's content.
pub fn shrink_to_fit_size(index: &Index, volume: &ResizeVolume) -> Result<u64> {
    let block = volume
        .block(index)
        .ok_or_else(|| CoreError::excuse("Activate before resizing"))?;
    let (content, overhead) = content_of(index, &block)?;

    let stratis = index
        .blocks_stratis_blockdev
        .get(&content)
        .and_then(|blockdev| index.stratis_blockdevs.get(blockdev))
        .map(|blockdev| blockdev.total_physical_size);
    let vdo = index
        .blocks_vdo
        .get(&content)
        .and_then(|vdo| index.vdos.get(vdo))
        .map(|vdo| vdo.physical_size);
    let filesystem = index
        .filesystems
        .get(&content)
        .map(|filesystem| filesystem.size);

    match stratis.or(vdo).or(filesystem) {
        Some(size) => Ok(size + overhead.unwrap_or(0)),
        None => {
            tracing::warn!(%block, "no content size to shrink to");
            Err(CoreError::excuse("Couldn't determine size to shrink to"))
        }
    }
}

/// Largest size for `volume` given an explicit PV selection, or the default one.
fn max_size(index: &Index, volume: &ResizeVolume, pvs: Option<&[ObjectPath]>) -> Option<(u64, bool)> {
    if let (ResizeVolume::LogicalVolume(path), Some(selection)) = (volume, pvs) {
        let lvol = index.lvols.get(path)?;
        if lvol.thin_pool.is_none() {
            let free: Vec<u64> = selection
                .iter()
                .filter_map(|pv| index.pvols.get(pv))
                .map(|pvol| pvol.free_size)
                .collect();
            let extra = max_grow_size(&lvol.layout, &free, legs(index, lvol).is_some());
            return Some((lvol.size + extra, false));
        }
    }
    grow_limit(index, volume).map(|limit| (limit.max_size, limit.unbounded))
}

/// Plan resizing `volume` to `target_size` bytes.
///
/// Capability problems are returned as [`CoreError::Excuse`] before any
/// step exists. The content is resized to `Fill` when growing and to the
/// target minus the encryption header when shrinking.
pub fn plan(
    index: &Index,
    config: &CoreConfig,
    volume: &ResizeVolume,
    target_size: u64,
    options: &ResizeOptions,
) -> Result<ResizePlan> {
    let current = volume
        .size(index)
        .ok_or_else(|| CoreError::NotFound(volume.path().clone()))?;
    let direction = ResizeDirection::between(current, target_size);
    let granularity = volume.size_step(index, config.partition_alignment);
    let target = match direction {
        ResizeDirection::Shrink => round_up(target_size, granularity).min(current),
        ResizeDirection::Grow => round_down(target_size, granularity).max(current),
    };
    if target == 0 {
        return Err(CoreError::excuse("Size can not be zero"));
    }

    let block = volume.block(index);
    let info = get_resize_info(index, block.as_ref(), options.to_fit);
    if let Some(excuse) = info.excuse(direction) {
        return Err(CoreError::excuse(excuse));
    }
    let block = block.ok_or_else(|| CoreError::excuse("Activate before resizing"))?;
    let name = index.display_name(volume.path());

    if target > current
        && let Some((max, unbounded)) = max_size(index, volume, options.pvs.as_deref())
        && !unbounded
        && target > max
    {
        return Err(CoreError::excuse(format!(
            "{name} can not be larger than {}",
            bytes_to_pretty(&max, false)
        )));
    }

    if options.to_fit && direction == ResizeDirection::Shrink {
        let fit = shrink_to_fit_size(index, volume)?;
        if target < fit {
            return Err(CoreError::excuse(format!(
                "{name} can not be made smaller than {}",
                bytes_to_pretty(&fit, false)
            )));
        }
    }

    let (content, overhead) = content_of(index, &block)?;
    let available = target.checked_sub(overhead.unwrap_or(0)).ok_or_else(|| {
        CoreError::excuse(format!("{name} is too small for its encryption header"))
    })?;
    let inner = match direction {
        ResizeDirection::Grow => ResizeTarget::Fill,
        ResizeDirection::Shrink => ResizeTarget::Bytes(available),
    };

    let content_steps = content_steps(index, &content, direction, available, inner)?;
    let crypto_step = overhead.map(|_| Step::ResizeCrypto {
        block: block.clone(),
        target: inner,
    });
    let volume_step = if target == current {
        None
    } else {
        Some(match volume {
            ResizeVolume::Partition(block) => Step::ResizePartition {
                block: block.clone(),
                size: target,
            },
            ResizeVolume::LogicalVolume(path) => Step::ResizeLogicalVolume {
                lvol: path.clone(),
                size: target,
                pvs: volume_pvs(index, path, direction, options)?,
            },
        })
    };

    let steps: Vec<Step> = match direction {
        ResizeDirection::Shrink => content_steps
            .into_iter()
            .chain(crypto_step)
            .chain(volume_step)
            .collect(),
        ResizeDirection::Grow => volume_step
            .into_iter()
            .chain(crypto_step)
            .chain(content_steps)
            .collect(),
    };

    let passphrase_hint = overhead.is_some()
        && index
            .blocks
            .get(&block)
            .is_some_and(|device| device.id_type == "crypto_LUKS" && device.id_version == "2");
    let needs_unmount =
        info.needs_unmount(direction) && !(options.to_fit && direction == ResizeDirection::Shrink);

    tracing::debug!(
        volume = %volume.path(),
        ?direction,
        current,
        target,
        steps = steps.len(),
        "planned resize"
    );

    Ok(ResizePlan {
        volume: volume.clone(),
        direction,
        current_size: current,
        target_size: target,
        crypto_block: overhead.map(|_| block.clone()),
        block,
        needs_unmount,
        passphrase_hint,
        steps,
    })
}

/// PVs for a logical volume grow; `None` lets the volume manager choose.
fn volume_pvs(
    index: &Index,
    path: &ObjectPath,
    direction: ResizeDirection,
    options: &ResizeOptions,
) -> Result<Option<Vec<ObjectPath>>> {
    if direction == ResizeDirection::Shrink || options.to_fit {
        return Ok(None);
    }
    let lvol = index
        .lvols
        .get(path)
        .ok_or_else(|| CoreError::NotFound(path.clone()))?;
    match &options.pvs {
        Some(selection) => prepare_pvs(index, lvol, selection).map(Some),
        None if legs(index, lvol).is_some() => {
            let selection: Vec<ObjectPath> = initial_pvs(index, lvol)
                .into_iter()
                .map(|space| space.block)
                .collect();
            prepare_pvs(index, lvol, &selection).map(Some)
        }
        None => Ok(None),
    }
}
