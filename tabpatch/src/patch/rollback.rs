// SPDX-FileCopyrightText: 2026 tabpatch contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Carrying a device's rollback index over into newer images so that the
//! bootloader accepts them.

use std::{collections::BTreeSet, sync::atomic::AtomicBool};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    crypto::RsaSigningKey,
    format::{
        avb::Header,
        image::{self, PartitionImage},
    },
    patch::sign::{self, AlgorithmPolicy, ContentSource},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Source locations {source_slots:?} and target locations {target_slots:?} are disjoint")]
    SlotMismatch {
        source_slots: Vec<u32>,
        target_slots: Vec<u32>,
    },
    #[error("Rollback index {0} cannot be raised further")]
    IndexOverflow(u64),
    #[error("Failed to re-sign target")]
    Sign(#[from] sign::Error),
    #[error("Image error")]
    Image(#[from] image::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub enum SyncMode {
    /// Raise the target to the source index if it is lower. Never lowers.
    #[default]
    Match,
    /// Make the target index strictly greater than the source index.
    LockHigher,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SyncOutcome {
    pub header: Header,
    pub previous: u64,
    pub index: u64,
    pub changed: bool,
}

/// Rollback index locations a header is tied to: its own location and the
/// location of every chained partition.
pub fn rollback_slots(header: &Header) -> BTreeSet<u32> {
    header.rollback_index_locations().collect()
}

/// The index the target should end up with.
pub fn target_index(source: u64, target: u64, mode: SyncMode) -> Result<u64> {
    match mode {
        SyncMode::Match => Ok(source.max(target)),
        SyncMode::LockHigher if target > source => Ok(target),
        SyncMode::LockHigher => source.checked_add(1).ok_or(Error::IndexOverflow(source)),
    }
}

/// Copy the source rollback index into the target. If the target already
/// satisfies `mode`, it is returned unchanged and is not re-signed.
pub fn sync_index(
    source: &Header,
    target: &Header,
    mode: SyncMode,
    key: Option<&RsaSigningKey>,
    contents: &impl ContentSource,
    cancel_signal: &AtomicBool,
) -> Result<SyncOutcome> {
    let source_slots = rollback_slots(source);
    let target_slots = rollback_slots(target);

    if source_slots.is_disjoint(&target_slots) {
        return Err(Error::SlotMismatch {
            source_slots: source_slots.into_iter().collect(),
            target_slots: target_slots.into_iter().collect(),
        });
    }

    let previous = target.rollback_index;
    let index = target_index(source.rollback_index, previous, mode)?;

    if index == previous {
        debug!("Rollback index {previous} already satisfies {mode:?}");

        return Ok(SyncOutcome {
            header: target.clone(),
            previous,
            index,
            changed: false,
        });
    }

    info!("Changing rollback index from {previous} to {index}");

    let mut header = target.clone();
    header.rollback_index = index;
    let header = sign::resign(
        &header,
        contents,
        key,
        AlgorithmPolicy::Keep,
        cancel_signal,
    )?;

    Ok(SyncOutcome {
        header,
        previous,
        index,
        changed: true,
    })
}

/// [`sync_index`] for whole images. Appended images keep their payload, and
/// vbmeta images keep their size.
pub fn sync_image(
    source: &PartitionImage,
    target: PartitionImage,
    mode: SyncMode,
    key: Option<&RsaSigningKey>,
    cancel_signal: &AtomicBool,
) -> Result<(PartitionImage, SyncOutcome)> {
    let source_header = source.header().ok_or(image::Error::NoHeader)?;
    let target_header = target.header().ok_or(image::Error::NoHeader)?;

    let outcome = sync_index(
        source_header,
        target_header,
        mode,
        key,
        &sign::NoContent,
        cancel_signal,
    )?;

    if !outcome.changed {
        return Ok((target, outcome));
    }

    let image = target.with_header(&outcome.header)?;

    Ok((image, outcome))
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum ArbStatus {
    /// The new images carry the same indices as the device.
    Match,
    /// At least one index differs and the new images must be patched.
    NeedsPatch,
    /// A new image is missing.
    MissingNew,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ArbEntry {
    pub partition: String,
    pub current: u64,
    pub new: Option<u64>,
}

pub fn status(entries: &[ArbEntry]) -> ArbStatus {
    if entries.iter().any(|e| e.new.is_none()) {
        ArbStatus::MissingNew
    } else if entries.iter().all(|e| e.new == Some(e.current)) {
        ArbStatus::Match
    } else {
        ArbStatus::NeedsPatch
    }
}
