// SPDX-FileCopyrightText: 2026 tabpatch contributors
// SPDX-License-Identifier: GPL-3.0-only

mod common;

use std::sync::atomic::AtomicBool;

use assert_matches::assert_matches;
use tabpatch::patch::{
    rollback::{self, ArbEntry, ArbStatus, SyncMode},
    sign,
};

const BOOT_SIZE: u64 = 64 * 1024;

fn boot(index: u64) -> tabpatch::format::image::PartitionImage {
    let key = common::test_key();
    common::appended_image("boot", b"boot image payload", BOOT_SIZE, index, Some(&key))
}

#[test]
fn target_index_modes() {
    assert_eq!(rollback::target_index(5, 3, SyncMode::Match).unwrap(), 5);
    assert_eq!(rollback::target_index(5, 7, SyncMode::Match).unwrap(), 7);
    assert_eq!(rollback::target_index(5, 5, SyncMode::Match).unwrap(), 5);

    assert_eq!(rollback::target_index(5, 3, SyncMode::LockHigher).unwrap(), 6);
    assert_eq!(rollback::target_index(5, 5, SyncMode::LockHigher).unwrap(), 6);
    assert_eq!(rollback::target_index(5, 9, SyncMode::LockHigher).unwrap(), 9);
    assert_matches!(
        rollback::target_index(u64::MAX, 0, SyncMode::LockHigher),
        Err(rollback::Error::IndexOverflow(u64::MAX))
    );
}

#[test]
fn raise_lower_index() {
    let key = common::test_key();
    let cancel_signal = AtomicBool::new(false);
    let current = boot(5);
    let new = boot(3);

    let (synced, outcome) =
        rollback::sync_image(&current, new.clone(), SyncMode::Match, Some(&key), &cancel_signal)
            .unwrap();

    assert!(outcome.changed);
    assert_eq!(outcome.previous, 3);
    assert_eq!(outcome.index, 5);
    assert_eq!(synced.header().unwrap().rollback_index, 5);

    // Same size and payload, valid signature.
    assert_eq!(synced.len(), new.len());
    assert_eq!(synced.payload(), new.payload());
    let public_key = sign::verify_image(&synced, &cancel_signal).unwrap();
    assert_eq!(public_key, Some(key.to_public_key()));
}

#[test]
fn never_lowers_index() {
    let cancel_signal = AtomicBool::new(false);
    let current = boot(3);
    let new = boot(5);

    // No key is needed when nothing changes.
    let (synced, outcome) =
        rollback::sync_image(&current, new.clone(), SyncMode::Match, None, &cancel_signal)
            .unwrap();

    assert!(!outcome.changed);
    assert_eq!(outcome.index, 5);
    assert_eq!(synced, new);
}

#[test]
fn lock_higher() {
    let key = common::test_key();
    let cancel_signal = AtomicBool::new(false);

    let vbmeta = |index| common::vbmeta_image(vec![], index, Some(&key), 8192);
    let current = vbmeta(4);

    let (synced, outcome) = rollback::sync_image(
        &current,
        vbmeta(4),
        SyncMode::LockHigher,
        Some(&key),
        &cancel_signal,
    )
    .unwrap();

    assert_eq!(outcome.index, 5);
    assert_eq!(synced.len(), 8192);
    assert_eq!(synced.header().unwrap().rollback_index, 5);
    sign::verify_image(&synced, &cancel_signal).unwrap();
}

#[test]
fn missing_key() {
    let cancel_signal = AtomicBool::new(false);

    assert_matches!(
        rollback::sync_image(&boot(5), boot(3), SyncMode::Match, None, &cancel_signal),
        Err(rollback::Error::Sign(sign::Error::KeyRequired(_)))
    );
}

#[test]
fn disjoint_locations() {
    let cancel_signal = AtomicBool::new(false);

    let at_location = |location| {
        let image = common::vbmeta_image(vec![], 1, None, 4096);
        let mut header = image.header().unwrap().clone();
        header.rollback_index_location = location;
        image.with_header(&header).unwrap()
    };

    assert_matches!(
        rollback::sync_image(&at_location(1), at_location(2), SyncMode::Match, None, &cancel_signal),
        Err(rollback::Error::SlotMismatch { .. })
    );
}

#[test]
fn arb_status() {
    let entry = |partition: &str, current, new| ArbEntry {
        partition: partition.to_owned(),
        current,
        new,
    };

    assert_eq!(
        rollback::status(&[entry("boot", 5, Some(5)), entry("vbmeta_system", 2, Some(2))]),
        ArbStatus::Match,
    );
    assert_eq!(
        rollback::status(&[entry("boot", 5, Some(3)), entry("vbmeta_system", 2, Some(2))]),
        ArbStatus::NeedsPatch,
    );
    assert_eq!(
        rollback::status(&[entry("boot", 5, None), entry("vbmeta_system", 2, Some(2))]),
        ArbStatus::MissingNew,
    );
}
