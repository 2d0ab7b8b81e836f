// SPDX-License-Identifier: GPL-3.0-only

//! Orchestration core of the storage manager.
//!
//! The [`store::Store`] mirrors the remote object tree and derives an
//! [`index::Index`] from it. Usage resolution, resize planning and the
//! teardown orchestrator all work on index snapshots and reach the live
//! system only through the collaborator contracts of `storage-contracts`.

pub mod config;
pub mod error;
pub mod index;
pub mod locks;
pub mod logging;
pub mod maintenance;
pub mod resize;
pub mod runner;
pub mod service;
pub mod store;
pub mod teardown;
pub mod usage;

pub use config::{CoreConfig, LoggingLevel};
pub use error::{CoreError, Result};
pub use index::Index;
pub use service::{Collaborators, StorageCore};
pub use store::Store;
pub use teardown::{Teardown, TeardownOutcome, TeardownState};
