// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-FileCopyrightText: 2026 tabpatch contributors
// SPDX-License-Identifier: GPL-3.0-only

mod common;

use std::{collections::BTreeMap, sync::atomic::AtomicBool};

use assert_matches::assert_matches;
use tabpatch::{
    crypto::KeyRing,
    format::{
        avb::{self, AlgorithmType, Descriptor},
        image::{self, FormatIssue, ImageKind, PartitionImage},
    },
    patch::sign::{self, AlgorithmPolicy, NoContent},
};

const PARTITION_SIZE: u64 = 64 * 1024;

fn payload() -> Vec<u8> {
    (0..20_000u32).map(|i| (i % 241) as u8).collect()
}

#[test]
fn appended_image_round_trip() {
    let key = common::test_key();
    let image = common::appended_image("boot", &payload(), PARTITION_SIZE, 3, Some(&key));

    assert_eq!(image.kind(), ImageKind::Appended);
    assert_eq!(image.len(), PARTITION_SIZE);
    assert_eq!(image.payload(), payload().as_slice());

    let footer = image.footer().unwrap();
    assert_eq!(footer.original_image_size, payload().len() as u64);
    assert_eq!(footer.vbmeta_offset % 4096, 0);

    let reparsed = PartitionImage::parse(image.serialize().to_vec()).unwrap();
    assert_eq!(reparsed, image);
    assert_eq!(reparsed.serialize(), image.serialize());
    assert_eq!(reparsed.header().unwrap().rollback_index, 3);
}

#[test]
fn vbmeta_and_raw_images() {
    let vbmeta = common::vbmeta_image(vec![], 0, None, 4096);
    assert_eq!(vbmeta.kind(), ImageKind::Vbmeta);
    assert!(vbmeta.payload().is_empty());

    let raw = PartitionImage::parse(vec![0x42; 8192]).unwrap();
    assert_eq!(raw.kind(), ImageKind::Raw);
    assert_eq!(raw.payload().len(), 8192);
    assert!(raw.header().is_none());
}

#[test]
fn malformed_footer_offset() {
    let image = common::appended_image("boot", &payload(), PARTITION_SIZE, 0, None);
    let mut data = image.into_bytes();

    // original_image_size is past the footer.
    let footer_offset = data.len() - avb::Footer::SIZE;
    data[footer_offset + 12..footer_offset + 20].copy_from_slice(&u64::MAX.to_be_bytes());

    let error = PartitionImage::parse(data).unwrap_err();
    assert_eq!(error.offset(), Some(footer_offset as u64));
    assert_matches!(
        error,
        image::Error::Format {
            issue: FormatIssue::OutOfBounds {
                field: "original_image_size",
                ..
            },
            ..
        }
    );
}

#[test]
fn verify_signed_image() {
    let key = common::test_key();
    let cancel_signal = AtomicBool::new(false);
    let image = common::appended_image("boot", &payload(), PARTITION_SIZE, 0, Some(&key));

    let public_key = sign::verify_image(&image, &cancel_signal).unwrap();
    assert_eq!(public_key, Some(key.to_public_key()));

    // Payload no longer matches the descriptor.
    let mut data = image.clone().into_bytes();
    data[100] ^= 0xff;
    let tampered = PartitionImage::parse(data).unwrap();
    assert_matches!(
        sign::verify_image(&tampered, &cancel_signal),
        Err(sign::Error::Verify(p, avb::Error::DigestMismatch { .. })) if p == "boot"
    );

    // Header no longer matches the signature.
    let mut header = image.header().unwrap().clone();
    header.rollback_index += 1;
    assert_matches!(header.verify(), Err(avb::Error::DigestMismatch { .. }));
}

#[test]
fn resign_updates_digests() {
    let key = common::test_key();
    let cancel_signal = AtomicBool::new(false);

    let old = b"old vendor_boot".to_vec();
    let new = b"new vendor_boot contents".to_vec();
    let descriptor = common::hash_descriptor("vendor_boot", &old);
    let vbmeta = common::vbmeta_image(vec![Descriptor::Hash(descriptor)], 0, Some(&key), 8192);

    let contents = BTreeMap::from([("vendor_boot".to_owned(), new)]);
    let resigned = sign::resign_image(
        &vbmeta,
        &contents,
        Some(&key),
        AlgorithmPolicy::Keep,
        &cancel_signal,
    )
    .unwrap();

    assert_eq!(resigned.len(), vbmeta.len());
    let header = resigned.header().unwrap();
    assert_eq!(header.algorithm_type, AlgorithmType::Sha256Rsa4096);

    let public_key = sign::verify(header, &contents, &cancel_signal).unwrap();
    assert_eq!(public_key, Some(key.to_public_key()));

    let stale = BTreeMap::from([("vendor_boot".to_owned(), old)]);
    assert_matches!(
        sign::verify(header, &stale, &cancel_signal),
        Err(sign::Error::Verify(..))
    );

    // Descriptors for slotted partitions match unslotted contents.
    let descriptor = common::hash_descriptor("vendor_boot_a", b"x");
    let vbmeta = common::vbmeta_image(vec![Descriptor::Hash(descriptor)], 0, None, 4096);
    let header = sign::resign(
        vbmeta.header().unwrap(),
        &contents,
        None,
        AlgorithmPolicy::Keep,
        &cancel_signal,
    )
    .unwrap();
    sign::verify(&header, &contents, &cancel_signal).unwrap();
    assert_matches!(
        sign::verify(&header, &stale, &cancel_signal),
        Err(sign::Error::Verify(p, _)) if p == "vendor_boot_a"
    );
}

#[test]
fn algorithm_policies() {
    let key = common::test_key();
    let small_key = common::other_key();
    let cancel_signal = AtomicBool::new(false);
    let vbmeta = common::vbmeta_image(vec![], 1, Some(&key), 8192);
    let header = vbmeta.header().unwrap();

    assert_matches!(
        sign::resign(header, &NoContent, Some(&small_key), AlgorithmPolicy::Keep, &cancel_signal),
        Err(sign::Error::KeyMismatch {
            key_bits: 2048,
            algorithm: AlgorithmType::Sha256Rsa4096,
        })
    );
    assert_matches!(
        sign::resign(header, &NoContent, None, AlgorithmPolicy::Keep, &cancel_signal),
        Err(sign::Error::KeyRequired(AlgorithmType::Sha256Rsa4096))
    );

    let resigned = sign::resign(
        header,
        &NoContent,
        Some(&small_key),
        AlgorithmPolicy::FromKey,
        &cancel_signal,
    )
    .unwrap();
    assert_eq!(resigned.algorithm_type, AlgorithmType::Sha256Rsa2048);
    assert_eq!(resigned.verify().unwrap(), Some(small_key.to_public_key()));

    let unsigned =
        sign::resign(header, &NoContent, None, AlgorithmPolicy::Unsigned, &cancel_signal).unwrap();
    assert_eq!(unsigned.algorithm_type, AlgorithmType::None);
    assert!(unsigned.signature.is_empty());
    assert_eq!(unsigned.verify().unwrap(), None);
}

#[test]
fn key_selection() {
    let key = common::test_key();
    let signed = common::vbmeta_image(vec![], 0, Some(&key), 8192);
    let other = common::vbmeta_image(vec![], 0, Some(&common::other_key()), 8192);
    let unsigned = common::vbmeta_image(vec![], 0, None, 4096);

    let keys = common::test_key_ring();
    let fingerprint = key.fingerprint().unwrap();

    let selected = sign::select_key(&keys, signed.header().unwrap(), false).unwrap();
    assert_eq!(selected.unwrap().fingerprint().unwrap(), fingerprint);

    assert_matches!(sign::select_key(&keys, unsigned.header().unwrap(), false), Ok(None));

    assert_matches!(
        sign::select_key(&keys, other.header().unwrap(), false),
        Err(sign::Error::UnknownKey(_))
    );
    let fallback = sign::select_key(&keys, other.header().unwrap(), true).unwrap();
    assert_eq!(fallback.unwrap().fingerprint().unwrap(), fingerprint);

    assert_matches!(
        sign::select_key(&KeyRing::new(), other.header().unwrap(), true),
        Err(sign::Error::UnknownKey(_))
    );
}

#[test]
fn seal_appended_payload() {
    let key = common::test_key();
    let cancel_signal = AtomicBool::new(false);
    let image = common::appended_image("vendor_boot", &payload(), PARTITION_SIZE, 2, Some(&key));

    let mut new_payload = payload();
    new_payload.truncate(12_345);
    let sealed = sign::seal_appended(
        &image,
        new_payload.clone(),
        Some(&key),
        AlgorithmPolicy::Keep,
        &cancel_signal,
    )
    .unwrap();

    assert_eq!(sealed.len(), image.len());
    assert_eq!(sealed.payload(), new_payload.as_slice());
    assert_eq!(sealed.header().unwrap().rollback_index, 2);
    sign::verify_image(&sealed, &cancel_signal).unwrap();

    let vbmeta = common::vbmeta_image(vec![], 0, None, 4096);
    assert_matches!(
        sign::seal_appended(&vbmeta, vec![1], None, AlgorithmPolicy::Keep, &cancel_signal),
        Err(sign::Error::Image(image::Error::NotAppended))
    );
}
