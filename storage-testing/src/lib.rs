// SPDX-License-Identifier: GPL-3.0-only

//! Test doubles for the storage core.
//!
//! - [`fixtures::SnapshotBuilder`] assembles object snapshots the way the
//!   storage service would report them.
//! - [`fakes`] implements every collaborator contract in memory and records
//!   each mutating call into a shared [`ledger::CallLedger`].

pub mod errors;
pub mod fakes;
pub mod fixtures;
pub mod ledger;

pub use fakes::{
    FakeFilesystemHelper, FakeMountHelper, FakeMountTable, FakeObjectSource, FakePassphrase,
    Fakes,
};
pub use fixtures::SnapshotBuilder;
pub use ledger::{Call, CallLedger};
