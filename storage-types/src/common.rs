// SPDX-License-Identifier: GPL-3.0-only

//! Common utility types shared across models

use num_format::{Locale, ToFormattedString};
use serde::{Deserialize, Serialize};

/// One mebibyte. Partition boundaries are aligned to it.
pub const MIB: u64 = 1024 * 1024;

/// A byte range representing a contiguous region of a device
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    /// Start byte (inclusive)
    pub start: u64,

    /// End byte (exclusive)
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, size: u64) -> Self {
        Self {
            start,
            end: start.saturating_add(size),
        }
    }

    /// Get the size of this range in bytes
    pub fn size(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// Whether `other` lies completely inside this range
    pub fn contains(&self, other: &ByteRange) -> bool {
        other.start >= self.start && other.end <= self.end
    }
}

/// Round `value` down to a multiple of `step`. A zero step leaves the value untouched.
pub fn round_down(value: u64, step: u64) -> u64 {
    if step == 0 {
        return value;
    }
    value - value % step
}

/// Round `value` up to a multiple of `step`, saturating at the largest multiple.
pub fn round_up(value: u64, step: u64) -> u64 {
    if step == 0 {
        return value;
    }
    match value % step {
        0 => value,
        rest => value
            .checked_add(step - rest)
            .unwrap_or_else(|| round_down(u64::MAX, step)),
    }
}

/// Convert bytes to human-readable format (e.g., "1.50 GB")
pub fn bytes_to_pretty(bytes: &u64, add_bytes: bool) -> String {
    const UNITS: [&str; 9] = ["B", "KB", "MB", "GB", "TB", "PB", "EB", "ZB", "YB"];

    let mut steps = 0;
    let mut val: f64 = *bytes as f64;

    while val > 1024. && steps < UNITS.len() - 1 {
        val /= 1024.;
        steps += 1;
    }

    if add_bytes {
        let bytes_str = bytes.to_formatted_string(&Locale::en);
        format!("{:.2} {} ({} bytes)", val, UNITS[steps], bytes_str)
    } else {
        format!("{:.2} {}", val, UNITS[steps])
    }
}
