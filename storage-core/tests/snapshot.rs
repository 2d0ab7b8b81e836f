// SPDX-License-Identifier: GPL-3.0-only

use std::path::{Path, PathBuf};

use storage_core::usage::resolve;
use storage_core::{CoreConfig, Index};
use storage_testing::errors::TestingError;
use storage_testing::fixtures::{block_path, drive_path, load_snapshot};
use storage_types::{ActionVerb, UsageRequest, UsageTarget};

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

#[test]
fn saved_snapshot_builds_the_drive_index() {
    let snapshot = load_snapshot(&fixture("laptop.json")).expect("fixture");
    let config = CoreConfig::default();
    let index = Index::build(&snapshot, config.min_free_space);

    assert!(!index.broken_multipath_present);
    assert_eq!(
        index.drives_block.get(&drive_path("ssd0")),
        Some(&block_path("nvme0n1"))
    );
    assert_eq!(index.partitions.len(), 2);
    assert_eq!(
        index.blocks_cleartext.get(&block_path("nvme0n1p2")),
        Some(&block_path("dm-0"))
    );
}

#[test]
fn wiping_the_system_drive_is_refused() {
    let snapshot = load_snapshot(&fixture("laptop.json")).expect("fixture");
    let config = CoreConfig::default();
    let index = Index::build(&snapshot, config.min_free_space);

    let usage = resolve(
        &index,
        &config,
        &UsageTarget::Drive(drive_path("ssd0")),
        UsageRequest::destructive(ActionVerb::Format),
    );

    assert!(usage.blocking());
    let blocked: Vec<_> = usage
        .blocking_entries()
        .filter_map(|entry| entry.location.as_deref())
        .collect();
    assert_eq!(blocked, vec!["/"]);
    assert!(
        usage
            .entries
            .iter()
            .any(|entry| entry.location.as_deref() == Some("/boot/efi") && !entry.blocking)
    );
}

#[test]
fn missing_fixture_is_an_io_error() {
    let error = load_snapshot(&fixture("absent.json")).expect_err("no such fixture");
    assert!(matches!(error, TestingError::FixtureIo { .. }));
}
