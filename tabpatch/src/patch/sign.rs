// SPDX-FileCopyrightText: 2026 tabpatch contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Recomputing descriptor digests and re-signing vbmeta headers.

use std::{
    collections::{BTreeMap, HashMap},
    sync::atomic::AtomicBool,
};

use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::{
    crypto::{self, KeyRing, RsaSigningKey},
    format::{
        avb::{self, AlgorithmType, AppendedDescriptorMut, AppendedDescriptorRef, Descriptor, Header},
        image::{self, PartitionImage},
    },
    util,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("{key_bits}-bit key does not match algorithm {algorithm:?}")]
    KeyMismatch {
        key_bits: usize,
        algorithm: AlgorithmType,
    },
    #[error("Signing key required for algorithm {0:?}")]
    KeyRequired(AlgorithmType),
    #[error("No private key for AVB public key with fingerprint {0}")]
    UnknownKey(String),
    #[error("Failed to update {0:?} descriptor")]
    Descriptor(String, #[source] avb::Error),
    #[error("Failed to verify {0:?} descriptor")]
    Verify(String, #[source] avb::Error),
    #[error("AVB error")]
    Avb(#[from] avb::Error),
    #[error("Image error")]
    Image(#[from] image::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// How the algorithm id of a re-signed header is chosen.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub enum AlgorithmPolicy {
    /// Keep the algorithm declared in the header. The key must match it.
    #[default]
    Keep,
    /// Derive the algorithm from the key size.
    FromKey,
    /// Strip the signature and mark the header as unsigned.
    Unsigned,
}

/// Provides the current contents of partitions referenced by descriptors.
pub trait ContentSource {
    fn content(&self, partition: &str) -> Option<&[u8]>;
}

impl<S: AsRef<[u8]>> ContentSource for BTreeMap<String, S> {
    fn content(&self, partition: &str) -> Option<&[u8]> {
        self.get(partition).map(|s| s.as_ref())
    }
}

impl<S: AsRef<[u8]>> ContentSource for HashMap<String, S> {
    fn content(&self, partition: &str) -> Option<&[u8]> {
        self.get(partition).map(|s| s.as_ref())
    }
}

/// No partition contents. Every descriptor keeps its digest.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoContent;

impl ContentSource for NoContent {
    fn content(&self, _partition: &str) -> Option<&[u8]> {
        None
    }
}

/// Look up by exact name first, then by the name without a slot suffix.
fn lookup<'a>(contents: &'a impl ContentSource, partition: &str) -> Option<&'a [u8]> {
    contents
        .content(partition)
        .or_else(|| contents.content(util::strip_slot_suffix(partition)))
}

fn key_mismatch(e: avb::Error) -> Error {
    match e {
        avb::Error::IncorrectKeySize(size, algorithm) => Error::KeyMismatch {
            key_bits: size * 8,
            algorithm,
        },
        e => e.into(),
    }
}

/// Apply the algorithm policy and sign in place.
pub fn sign_header(
    header: &mut Header,
    key: Option<&RsaSigningKey>,
    policy: AlgorithmPolicy,
) -> Result<()> {
    match policy {
        AlgorithmPolicy::Unsigned => {
            header.algorithm_type = AlgorithmType::None;
            header.clear_sig();
        }
        AlgorithmPolicy::FromKey => {
            let key = key.ok_or(Error::KeyRequired(header.algorithm_type))?;
            header.set_algo_for_key(key)?;
            header.sign(key).map_err(key_mismatch)?;
        }
        AlgorithmPolicy::Keep => {
            if header.algorithm_type == AlgorithmType::None {
                header.clear_sig();
            } else {
                let key = key.ok_or(Error::KeyRequired(header.algorithm_type))?;
                header.sign(key).map_err(key_mismatch)?;
            }
        }
    }

    debug!("Signed header with {:?}", header.algorithm_type);

    Ok(())
}

/// Return a copy of `header` with every hash and hash tree descriptor digest
/// recomputed from `contents` and a fresh signature. Descriptors whose
/// partition is not in `contents` keep their existing digest.
pub fn resign(
    header: &Header,
    contents: &impl ContentSource,
    key: Option<&RsaSigningKey>,
    policy: AlgorithmPolicy,
    cancel_signal: &AtomicBool,
) -> Result<Header> {
    let mut header = header.clone();

    for descriptor in &mut header.descriptors {
        match descriptor {
            Descriptor::Hash(d) => {
                if let Some(data) = lookup(contents, &d.partition_name) {
                    debug!("Updating hash descriptor: {:?}", d.partition_name);
                    d.update(data)
                        .map_err(|e| Error::Descriptor(d.partition_name.clone(), e))?;
                }
            }
            Descriptor::HashTree(d) => {
                if let Some(data) = lookup(contents, &d.partition_name) {
                    debug!("Updating hash tree descriptor: {:?}", d.partition_name);
                    d.update(data, cancel_signal)
                        .map_err(|e| Error::Descriptor(d.partition_name.clone(), e))?;
                }
            }
            _ => {}
        }
    }

    sign_header(&mut header, key, policy)?;

    Ok(header)
}

/// Check the header signature and every descriptor with supplied contents.
/// Returns the public key that signed the header, if it is signed.
pub fn verify(
    header: &Header,
    contents: &impl ContentSource,
    cancel_signal: &AtomicBool,
) -> Result<Option<RsaPublicKey>> {
    let public_key = header.verify()?;

    for descriptor in &header.descriptors {
        match descriptor {
            Descriptor::Hash(d) => {
                if let Some(data) = lookup(contents, &d.partition_name) {
                    d.verify(data)
                        .map_err(|e| Error::Verify(d.partition_name.clone(), e))?;
                }
            }
            Descriptor::HashTree(d) => {
                if let Some(data) = lookup(contents, &d.partition_name) {
                    d.verify(data, None, cancel_signal)
                        .map_err(|e| Error::Verify(d.partition_name.clone(), e))?;
                }
            }
            _ => {}
        }
    }

    Ok(public_key)
}

/// Verify a whole partition image. For appended images, the payload is
/// checked against the image's own descriptor.
pub fn verify_image(
    image: &PartitionImage,
    cancel_signal: &AtomicBool,
) -> Result<Option<RsaPublicKey>> {
    let header = image.header().ok_or(image::Error::NoHeader)?;
    let public_key = header.verify()?;

    if image.footer().is_some() {
        match header.appended_descriptor()? {
            AppendedDescriptorRef::Hash(d) => d
                .verify(image.payload())
                .map_err(|e| Error::Verify(d.partition_name.clone(), e))?,
            AppendedDescriptorRef::HashTree(d) => d
                .verify(image.payload(), image.hash_tree(), cancel_signal)
                .map_err(|e| Error::Verify(d.partition_name.clone(), e))?,
        }
    }

    Ok(public_key)
}

/// Rebuild an appended image around a new payload at the same partition
/// size. Hash tree images get a freshly generated tree.
pub fn seal_appended(
    image: &PartitionImage,
    payload: Vec<u8>,
    key: Option<&RsaSigningKey>,
    policy: AlgorithmPolicy,
    cancel_signal: &AtomicBool,
) -> Result<PartitionImage> {
    if image.footer().is_none() {
        return Err(image::Error::NotAppended.into());
    }

    let mut header = image.header().ok_or(image::Error::NoHeader)?.clone();
    let mut data = payload;

    match header.appended_descriptor_mut()? {
        AppendedDescriptorMut::Hash(d) => {
            d.update(&data)
                .map_err(|e| Error::Descriptor(d.partition_name.clone(), e))?;
        }
        AppendedDescriptorMut::HashTree(d) => {
            let tree = d
                .update(&data, cancel_signal)
                .map_err(|e| Error::Descriptor(d.partition_name.clone(), e))?;
            data.extend_from_slice(&tree);
        }
    }

    sign_header(&mut header, key, policy)?;

    Ok(PartitionImage::assemble_appended(data, &header, image.len())?)
}

/// Re-sign a root vbmeta image. The image keeps its size.
pub fn resign_image(
    image: &PartitionImage,
    contents: &impl ContentSource,
    key: Option<&RsaSigningKey>,
    policy: AlgorithmPolicy,
    cancel_signal: &AtomicBool,
) -> Result<PartitionImage> {
    let header = image.header().ok_or(image::Error::NoHeader)?;
    let header = resign(header, contents, key, policy, cancel_signal)?;

    Ok(image.with_header(&header)?)
}

/// Find the private key for a header's embedded public key. Unsigned headers
/// need no key. With `use_fallback`, headers without a known key use the key
/// ring's fallback key.
pub fn select_key<'a>(
    keys: &'a KeyRing,
    header: &Header,
    use_fallback: bool,
) -> Result<Option<&'a RsaSigningKey>> {
    if header.algorithm_type == AlgorithmType::None {
        return Ok(None);
    }

    let key = if use_fallback {
        keys.for_avb_key_or_fallback(&header.public_key)
    } else {
        keys.for_avb_key(&header.public_key)
    };

    key.map(Some)
        .ok_or_else(|| Error::UnknownKey(crypto::avb_key_fingerprint(&header.public_key)))
}
