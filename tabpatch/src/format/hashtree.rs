// SPDX-FileCopyrightText: 2023 Andrew Gunnerson
// SPDX-FileCopyrightText: 2026 tabpatch contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{io, ops::Range, sync::atomic::AtomicBool};

use num_traits::ToPrimitive;
use rayon::{
    iter::{IndexedParallelIterator, ParallelIterator},
    slice::{ParallelSlice, ParallelSliceMut},
};
use ring::digest::{Algorithm, Context};
use thiserror::Error;

use crate::{format::padding, stream};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Hash tree should have size {expected} for input size {input}, but has size {actual}")]
    InvalidHashTreeSize {
        input: u64,
        expected: usize,
        actual: usize,
    },
    #[error("Expected root digest {expected}, but have {actual}")]
    InvalidRootDigest { expected: String, actual: String },
    #[error("Hash tree data does not match the input data")]
    InvalidHashTree,
    #[error("Block size must be non-zero")]
    ZeroBlockSize,
    #[error("{0:?} field is out of bounds")]
    FieldOutOfBounds(&'static str),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// dm-verity style hash tree over an in-memory image.
pub struct HashTree {
    block_size: u32,
    salted_context: Context,
}

impl HashTree {
    pub fn new(block_size: u32, algorithm: &'static Algorithm, salt: &[u8]) -> Self {
        let mut salted_context = Context::new(algorithm);
        salted_context.update(salt);

        Self {
            block_size,
            salted_context,
        }
    }

    fn digest_size(&self) -> usize {
        self.salted_context
            .algorithm()
            .output_len()
            .next_power_of_two()
    }

    /// Compute the offset ranges of each level within the hash tree data,
    /// bottom level first. The bottom level is stored at the end of the data.
    pub fn compute_level_offsets(&self, image_size: u64) -> Result<Vec<Range<usize>>> {
        if self.block_size == 0 {
            return Err(Error::ZeroBlockSize);
        }

        let block_size = u64::from(self.block_size);
        let digest_size = self.digest_size() as u64;
        let mut ranges = vec![];
        let mut level_size = image_size;

        while level_size > block_size {
            let blocks = level_size.div_ceil(block_size);
            level_size = blocks
                .checked_mul(digest_size)
                .and_then(|s| padding::round(s, block_size))
                .ok_or(Error::FieldOutOfBounds("level_size"))?;

            let level_size_usize = level_size
                .to_usize()
                .ok_or(Error::FieldOutOfBounds("level_size"))?;

            ranges.push(0..level_size_usize);
        }

        let mut offset = 0;
        for range in ranges.iter_mut().rev() {
            let level_size = range.end - range.start;
            range.start += offset;
            range.end += offset;
            offset += level_size;
        }

        Ok(ranges)
    }

    /// Hash `input` block by block into `level_data`. Short trailing blocks
    /// are zero padded before hashing.
    fn hash_level(
        &self,
        input: &[u8],
        mut level_data: &mut [u8],
        cancel_signal: &AtomicBool,
    ) -> io::Result<()> {
        let digest_size = self.digest_size();
        let mut buf = vec![0u8; self.block_size as usize];

        for block in input.chunks(self.block_size as usize) {
            stream::check_cancel(cancel_signal)?;

            buf[..block.len()].copy_from_slice(block);
            buf[block.len()..].fill(0);

            let mut context = self.salted_context.clone();
            context.update(&buf);
            let digest = context.finish();

            let (node, rest) = level_data.split_at_mut(digest_size);
            node[..digest.as_ref().len()].copy_from_slice(digest.as_ref());
            node[digest.as_ref().len()..].fill(0);
            level_data = rest;
        }

        Ok(())
    }

    /// Hash the bottom level in parallel.
    fn hash_bottom_level(
        &self,
        input: &[u8],
        level_data: &mut [u8],
        cancel_signal: &AtomicBool,
    ) -> io::Result<()> {
        const BLOCKS_PER_TASK: usize = 1024;

        let digest_size = self.digest_size();
        let in_chunk = BLOCKS_PER_TASK * self.block_size as usize;
        let used = input.len().div_ceil(self.block_size as usize) * digest_size;

        level_data[..used]
            .par_chunks_mut(BLOCKS_PER_TASK * digest_size)
            .zip(input.par_chunks(in_chunk))
            .map(|(out_data, in_data)| self.hash_level(in_data, out_data, cancel_signal))
            .collect::<io::Result<()>>()
    }

    fn calculate(
        &self,
        input: &[u8],
        level_offsets: &[Range<usize>],
        hash_tree_data: &mut [u8],
        cancel_signal: &AtomicBool,
    ) -> Result<Vec<u8>> {
        // Small images are hashed directly.
        let Some(top) = level_offsets.last() else {
            let mut context = self.salted_context.clone();
            context.update(input);
            return Ok(context.finish().as_ref().to_vec());
        };

        for (i, level_range) in level_offsets.iter().enumerate() {
            let (front, back) = hash_tree_data.split_at_mut(level_range.end);
            let level_data = &mut front[level_range.clone()];

            if i == 0 {
                self.hash_bottom_level(input, level_data, cancel_signal)?;
            } else {
                let prev_range = &level_offsets[i - 1];
                let prev_data = &back[..prev_range.end - prev_range.start];

                self.hash_level(prev_data, level_data, cancel_signal)?;
            }
        }

        let mut context = self.salted_context.clone();
        context.update(&hash_tree_data[top.clone()]);

        Ok(context.finish().as_ref().to_vec())
    }

    /// Generate the hash tree for `input`. Returns the root digest and the
    /// hash tree data.
    pub fn generate(&self, input: &[u8], cancel_signal: &AtomicBool) -> Result<(Vec<u8>, Vec<u8>)> {
        let offsets = self.compute_level_offsets(input.len() as u64)?;
        let hash_tree_size = offsets.first().map_or(0, |r| r.end);
        let mut hash_tree_data = vec![0u8; hash_tree_size];

        let root_digest = self.calculate(input, &offsets, &mut hash_tree_data, cancel_signal)?;

        Ok((root_digest, hash_tree_data))
    }

    /// Verify `input` against the expected root digest and hash tree data.
    pub fn verify(
        &self,
        input: &[u8],
        root_digest: &[u8],
        hash_tree_data: &[u8],
        cancel_signal: &AtomicBool,
    ) -> Result<()> {
        let (actual_root, actual_tree) = self.generate(input, cancel_signal)?;

        if actual_tree.len() != hash_tree_data.len() {
            return Err(Error::InvalidHashTreeSize {
                input: input.len() as u64,
                expected: actual_tree.len(),
                actual: hash_tree_data.len(),
            });
        } else if actual_root != root_digest {
            return Err(Error::InvalidRootDigest {
                expected: hex::encode(root_digest),
                actual: hex::encode(actual_root),
            });
        } else if actual_tree != hash_tree_data {
            return Err(Error::InvalidHashTree);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;

    #[test]
    fn level_offsets() {
        let tree = HashTree::new(4096, &ring::digest::SHA256, b"");

        // Fits in a single block: no tree.
        assert!(tree.compute_level_offsets(4096).unwrap().is_empty());

        // 2 blocks: 1 level with 2 digests, padded to a block.
        assert_eq!(tree.compute_level_offsets(8192).unwrap(), vec![0..4096]);

        // 129 blocks: bottom level spans 2 blocks, top level 1 block.
        assert_eq!(
            tree.compute_level_offsets(129 * 4096).unwrap(),
            vec![4096..12288, 0..4096],
        );
    }

    #[test]
    fn generate_and_verify() {
        let cancel_signal = AtomicBool::new(false);
        let tree = HashTree::new(4096, &ring::digest::SHA256, b"salt");
        let data: Vec<u8> = (0..3 * 4096 + 100).map(|i| (i % 251) as u8).collect();

        let (root, tree_data) = tree.generate(&data, &cancel_signal).unwrap();
        assert_eq!(root.len(), 32);
        assert_eq!(tree_data.len(), 4096);

        tree.verify(&data, &root, &tree_data, &cancel_signal)
            .unwrap();

        let mut modified = data.clone();
        modified[5000] ^= 1;
        assert!(matches!(
            tree.verify(&modified, &root, &tree_data, &cancel_signal),
            Err(Error::InvalidRootDigest { .. }),
        ));
    }

    #[test]
    fn small_image_is_hashed_directly() {
        let cancel_signal = AtomicBool::new(false);
        let tree = HashTree::new(4096, &ring::digest::SHA256, b"salt");

        let (root, tree_data) = tree.generate(b"tiny", &cancel_signal).unwrap();
        assert!(tree_data.is_empty());

        let mut context = Context::new(&ring::digest::SHA256);
        context.update(b"salt");
        context.update(b"tiny");
        assert_eq!(root, context.finish().as_ref());
    }
}
