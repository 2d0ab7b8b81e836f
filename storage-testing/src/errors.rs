// SPDX-License-Identifier: GPL-3.0-only

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TestingError {
    #[error("fixture io error for {path:?}: {reason}")]
    FixtureIo { path: PathBuf, reason: String },
    #[error("invalid fixture {path:?}: {reason}")]
    FixtureInvalid { path: PathBuf, reason: String },
}

pub type Result<T> = std::result::Result<T, TestingError>;
