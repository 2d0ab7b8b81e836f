// SPDX-License-Identifier: GPL-3.0-only

use tracing_subscriber::{EnvFilter, fmt};

use crate::config::LoggingLevel;

/// Install a stderr subscriber. `RUST_LOG` overrides the configured level.
///
/// Calling it twice is harmless; the second subscriber is dropped.
pub fn init(level: LoggingLevel) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "storage_core={level},storage_inspect={level},warn",
            level = level.as_directive()
        ))
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
