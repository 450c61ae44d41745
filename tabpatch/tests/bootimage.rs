/*
 * SPDX-FileCopyrightText: 2026 tabpatch contributors
 * SPDX-License-Identifier: GPL-3.0-only
 */

mod common;

use std::sync::atomic::AtomicBool;

use assert_matches::assert_matches;
use tabpatch::{
    format::{
        avb::{Descriptor, Header},
        bootimage::{
            BootImage, BootImageExt, BootImageV0Through2, BootImageV3Through4, V1Extra, V2Extra,
            V4Extra,
        },
        image::{ImageKind, PartitionImage},
    },
    patch::{
        kernel::{self, Error},
        sign::{self, AlgorithmPolicy},
    },
};

const PARTITION_SIZE: u64 = 128 * 1024;

fn kernel_blob(version: &str, len: usize) -> Vec<u8> {
    let banner = format!("Linux version {version}-android14 (build@host) #1 SMP PREEMPT");
    let mut data = vec![0x1fu8; len];
    data[100..100 + banner.len()].copy_from_slice(banner.as_bytes());
    data
}

fn boot_v2() -> BootImage {
    let mut boot = BootImageV0Through2 {
        kernel_addr: 0x8000,
        ramdisk_addr: 0x0100_0000,
        second_addr: 0,
        tags_addr: 0x100,
        page_size: 2048,
        os_version: 0x1a00_0000,
        name: "tablet".to_owned(),
        cmdline: "console=ttyMSM0".to_owned(),
        id: [7; 8],
        extra_cmdline: String::new(),
        kernel: kernel_blob("5.10.66", 5000),
        ramdisk: vec![0x22; 3000],
        second: vec![],
        v1_extra: Some(V1Extra {
            recovery_dtbo_offset: 0,
            recovery_dtbo: vec![0x33; 100],
        }),
        v2_extra: Some(V2Extra {
            dtb_addr: 0x0140_0000,
            dtb: vec![0x44; 700],
        }),
    };

    if let Some(offset) = boot.computed_recovery_dtbo_offset() {
        if let Some(v1) = &mut boot.v1_extra {
            v1.recovery_dtbo_offset = offset;
        }
    }

    BootImage::V0Through2(boot)
}

fn boot_v4() -> BootImage {
    let key = common::test_key();

    let mut signature = Header {
        descriptors: vec![Descriptor::Hash(common::hash_descriptor("boot", &[]))],
        ..Default::default()
    };
    signature.set_algo_for_key(&key).unwrap();

    let mut boot = BootImageV3Through4 {
        os_version: 0x1c00_0000,
        reserved: [0; 4],
        cmdline: String::new(),
        v4_extra: Some(V4Extra {
            signature: Some(signature),
        }),
        kernel: kernel_blob("5.15.94", 9000),
        ramdisk: vec![],
    };
    assert!(boot.sign(&key).unwrap());

    BootImage::V3Through4(boot)
}

/// Check the v4 boot signature against the rest of the image.
fn verify_boot_signature(boot: &BootImage) {
    let BootImage::V3Through4(b) = boot else {
        panic!("Unexpected boot image type");
    };
    let header = b.v4_extra.as_ref().unwrap().signature.as_ref().unwrap();
    header.verify().unwrap().unwrap();

    let Descriptor::Hash(descriptor) = &header.descriptors[0] else {
        panic!("Unexpected descriptor type");
    };

    // The signature is the last page.
    let data = boot.to_bytes().unwrap();
    descriptor.verify(&data[..data.len() - 4096]).unwrap();
}

#[test]
fn boot_image_round_trip() {
    for (boot, version, page_size) in [(boot_v2(), 2, 2048), (boot_v4(), 4, 4096)] {
        assert_eq!(boot.header_version(), version);
        assert_eq!(boot.page_size(), page_size);

        let data = boot.to_bytes().unwrap();
        assert_eq!(data.len() % page_size as usize, 0);

        let parsed = BootImage::parse(&data).unwrap();
        assert_eq!(parsed, boot);
        assert_eq!(parsed.to_bytes().unwrap(), data);
    }

    verify_boot_signature(&boot_v4());
}

#[test]
fn zeroed_boot_signature() {
    let mut boot = boot_v4();
    let mut data = boot.to_bytes().unwrap();
    let len = data.len();
    data[len - 4096..].fill(0);

    // Treated as unsigned, with the signature slot still present.
    let parsed = BootImage::parse(&data).unwrap();
    assert!(!parsed.has_signature());
    assert_eq!(parsed.header_version(), 4);

    assert!(boot.clear_signature());
    assert_eq!(parsed, boot);
    assert!(!boot.sign(&common::test_key()).unwrap());
}

#[test]
fn detect_kernel_version() {
    assert_eq!(
        kernel::kernel_version(boot_v2().kernel()).as_deref(),
        Some("5.10.66"),
    );
    assert_eq!(
        kernel::kernel_version(boot_v4().kernel()).as_deref(),
        Some("5.15.94"),
    );
    assert_eq!(kernel::kernel_version(b"no banner here"), None);
}

#[test]
fn replace_kernel_in_signed_image() {
    let key = common::test_key();
    let cancel_signal = AtomicBool::new(false);

    for boot in [boot_v2(), boot_v4()] {
        let payload = boot.to_bytes().unwrap();
        let image = common::appended_image("boot", &payload, PARTITION_SIZE, 4, Some(&key));

        let new_kernel = kernel_blob("6.1.23", 12_345);
        let patched = kernel::replace_kernel(
            &image,
            new_kernel.clone(),
            Some(&key),
            AlgorithmPolicy::Keep,
            &cancel_signal,
        )
        .unwrap();

        assert_eq!(patched.kind(), ImageKind::Appended);
        assert_eq!(patched.len(), image.len());
        assert_eq!(patched.header().unwrap().rollback_index, 4);
        sign::verify_image(&patched, &cancel_signal).unwrap();

        let new_boot = kernel::boot_image(&patched).unwrap();
        assert_eq!(new_boot.kernel(), new_kernel.as_slice());
        assert_eq!(
            kernel::kernel_version(new_boot.kernel()).as_deref(),
            Some("6.1.23"),
        );

        // Everything other than the kernel is carried over. A v4 boot
        // signature is re-signed over the new kernel.
        let mut expected = boot.clone();
        expected.set_kernel(new_kernel);
        assert_eq!(new_boot.has_signature(), boot.has_signature());
        if expected.sign(&key).unwrap() {
            verify_boot_signature(&new_boot);
        }
        assert_eq!(new_boot, expected);
    }
}

#[test]
fn recovery_dtbo_offset_follows_kernel() {
    let mut boot = boot_v2();
    boot.set_kernel(vec![0x66; 10_000]);

    let BootImage::V0Through2(b) = &boot else {
        panic!("Unexpected boot image type");
    };
    let v1 = b.v1_extra.as_ref().unwrap();
    assert_eq!(
        Some(v1.recovery_dtbo_offset),
        b.computed_recovery_dtbo_offset(),
    );

    // Header, kernel, ramdisk. No second stage.
    assert_eq!(v1.recovery_dtbo_offset, 2048 + 10_240 + 4096);

    let data = boot.to_bytes().unwrap();
    assert_eq!(BootImage::parse(&data).unwrap(), boot);
}

#[test]
fn replace_kernel_in_raw_dump() {
    let cancel_signal = AtomicBool::new(false);
    let mut payload = boot_v4().to_bytes().unwrap();
    payload.resize(PARTITION_SIZE as usize, 0);
    let image = PartitionImage::raw(payload);

    let patched = kernel::replace_kernel(
        &image,
        kernel_blob("6.1.23", 4000),
        None,
        AlgorithmPolicy::Keep,
        &cancel_signal,
    )
    .unwrap();

    assert_eq!(patched.kind(), ImageKind::Raw);
    assert_eq!(patched.len(), PARTITION_SIZE);

    let new_boot = kernel::boot_image(&patched).unwrap();
    assert_eq!(
        kernel::kernel_version(new_boot.kernel()).as_deref(),
        Some("6.1.23"),
    );

    // Without a key, the stale boot signature is removed.
    assert!(boot_v4().has_signature());
    assert!(!new_boot.has_signature());
}

#[test]
fn invalid_kernel_or_boot_image() {
    let cancel_signal = AtomicBool::new(false);
    let payload = boot_v4().to_bytes().unwrap();
    let image = common::appended_image("boot", &payload, PARTITION_SIZE, 0, None);

    assert_matches!(
        kernel::replace_kernel(&image, vec![], None, AlgorithmPolicy::Keep, &cancel_signal),
        Err(Error::EmptyKernel)
    );

    let not_boot = PartitionImage::raw(vec![0u8; 8192]);
    assert_matches!(
        kernel::replace_kernel(
            &not_boot,
            kernel_blob("6.1.23", 4000),
            None,
            AlgorithmPolicy::Keep,
            &cancel_signal,
        ),
        Err(Error::UnsupportedBootFormat(_))
    );
}
