// SPDX-FileCopyrightText: 2026 tabpatch contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::sync::{LazyLock, atomic::AtomicBool};

use regex::bytes::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    crypto::RsaSigningKey,
    format::{
        bootimage::{self, BootImage, BootImageExt},
        image::{ImageKind, PartitionImage},
    },
    patch::sign::{self, AlgorithmPolicy},
};

static VERSION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Linux version ([0-9]+\.[0-9]+\.[0-9]+)").expect("Invalid regex")
});

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unsupported boot image format")]
    UnsupportedBootFormat(#[source] bootimage::Error),
    #[error("Boot image error")]
    BootImage(#[from] bootimage::Error),
    #[error("Kernel is empty")]
    EmptyKernel,
    #[error("Failed to re-seal boot image")]
    Sign(#[from] sign::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Extract `X.Y.Z` from the `Linux version X.Y.Z` banner in a kernel image.
pub fn kernel_version(blob: &[u8]) -> Option<String> {
    VERSION_REGEX
        .captures(blob)
        .and_then(|c| c.get(1))
        .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned())
}

fn parse_boot(data: &[u8]) -> Result<BootImage> {
    BootImage::parse(data).map_err(|e| match e {
        bootimage::Error::UnknownFormat
        | bootimage::Error::UnknownMagic(_)
        | bootimage::Error::UnknownHeaderVersion(_) => Error::UnsupportedBootFormat(e),
        e => Error::BootImage(e),
    })
}

/// Parse the boot image inside a partition image.
pub fn boot_image(image: &PartitionImage) -> Result<BootImage> {
    parse_boot(image.payload())
}

/// Replace the kernel of a boot partition. Later segments keep their page
/// alignment. An appended AVB image is re-sealed at the same partition size.
pub fn replace_kernel(
    image: &PartitionImage,
    new_kernel: Vec<u8>,
    key: Option<&RsaSigningKey>,
    policy: AlgorithmPolicy,
    cancel_signal: &AtomicBool,
) -> Result<PartitionImage> {
    if new_kernel.is_empty() {
        return Err(Error::EmptyKernel);
    }

    let mut boot = boot_image(image)?;

    debug!(
        "Boot image v{}, page size {}",
        boot.header_version(),
        boot.page_size(),
    );

    let old_kernel = boot.set_kernel(new_kernel);
    info!(
        "Replacing kernel {} ({} bytes) with {} ({} bytes)",
        kernel_version(&old_kernel).as_deref().unwrap_or("unknown"),
        old_kernel.len(),
        kernel_version(boot.kernel()).as_deref().unwrap_or("unknown"),
        boot.kernel().len(),
    );

    // The v4 boot signature covers the kernel.
    match key {
        Some(key) => {
            if boot.sign(key)? {
                debug!("Re-signed boot image signature");
            }
        }
        None => {
            if boot.clear_signature() {
                warn!("No key for the boot image signature; removing it");
            }
        }
    }

    let payload = boot.to_bytes()?;

    let result = match image.kind() {
        ImageKind::Appended => sign::seal_appended(image, payload, key, policy, cancel_signal)?,
        ImageKind::Raw | ImageKind::Vbmeta => {
            // Keep raw dumps at their partition size when the new image fits.
            let mut payload = payload;
            if (payload.len() as u64) < image.len() {
                payload.resize(image.len() as usize, 0);
            }
            PartitionImage::raw(payload)
        }
    };

    Ok(result)
}
