// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};

/// Size passed to content and encryption resizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeTarget {
    /// Take all space the container offers.
    Fill,
    Bytes(u64),
}

impl ResizeTarget {
    /// The service encodes "fill" as zero.
    pub fn as_wire(self) -> u64 {
        match self {
            Self::Fill => 0,
            Self::Bytes(bytes) => bytes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeDirection {
    Shrink,
    Grow,
}

impl ResizeDirection {
    /// Equal sizes take the grow path so that content can be grown to fit.
    pub fn between(current: u64, target: u64) -> Self {
        if target < current { Self::Shrink } else { Self::Grow }
    }
}

/// Whether a device can be resized, and what it takes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeInfo {
    pub can_shrink: bool,
    pub can_grow: bool,
    pub shrink_needs_unmount: bool,
    pub grow_needs_unmount: bool,
    pub shrink_excuse: Option<String>,
    pub grow_excuse: Option<String>,
}

impl ResizeInfo {
    /// Neither direction possible, for the same reason.
    pub fn unsupported(excuse: impl Into<String>) -> Self {
        let excuse = excuse.into();
        Self {
            shrink_excuse: Some(excuse.clone()),
            grow_excuse: Some(excuse),
            ..Default::default()
        }
    }

    pub fn excuse(&self, direction: ResizeDirection) -> Option<&str> {
        match direction {
            ResizeDirection::Shrink => self.shrink_excuse.as_deref(),
            ResizeDirection::Grow => self.grow_excuse.as_deref(),
        }
    }

    pub fn needs_unmount(&self, direction: ResizeDirection) -> bool {
        match direction {
            ResizeDirection::Shrink => self.shrink_needs_unmount,
            ResizeDirection::Grow => self.grow_needs_unmount,
        }
    }
}

/// A volume whose content does not fill it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnusedSpace {
    /// Space available to the content, encryption overhead already removed.
    pub volume_size: u64,
    pub content_size: u64,
}

impl UnusedSpace {
    pub fn unused(&self) -> u64 {
        self.volume_size.saturating_sub(self.content_size)
    }
}

/// Upper bound for a grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrowLimit {
    pub max_size: u64,
    /// Thin volumes may be overcommitted past `max_size`.
    pub unbounded: bool,
}
