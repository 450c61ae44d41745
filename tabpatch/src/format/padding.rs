// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-FileCopyrightText: 2026 tabpatch contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Alignment helpers for block-structured images and sector-sized device
//! transfers.

use std::io::{self, Read, Seek, Write};

use num_traits::PrimInt;

use crate::stream::{ReadDiscardExt, WriteZerosExt};

/// Number of bytes needed to bring `offset` up to a multiple of `block_size`.
pub fn calc<N: PrimInt>(offset: N, block_size: N) -> N {
    let r = offset % block_size;
    if r == N::zero() {
        N::zero()
    } else {
        block_size - r
    }
}

/// Round up to the next multiple of `block_size`. Returns `None` on overflow.
pub fn round<N: PrimInt>(offset: N, block_size: N) -> Option<N> {
    offset.checked_add(&calc(offset, block_size))
}

/// Zero-extend `data` to a multiple of `block_size`. Returns the number of
/// bytes added.
pub fn pad_vec(data: &mut Vec<u8>, block_size: usize) -> usize {
    let padding = calc(data.len(), block_size);
    data.resize(data.len() + padding, 0);
    padding
}

/// Skip to the next block boundary. [`Seek`] is only used to query the
/// current position.
pub fn read_discard(mut reader: impl Read + Seek, block_size: u64) -> io::Result<u64> {
    let padding = calc(reader.stream_position()?, block_size);
    reader.read_discard_exact(padding)?;

    Ok(padding)
}

/// Zero-fill to the next block boundary. [`Seek`] is only used to query the
/// current position.
pub fn write_zeros(mut writer: impl Write + Seek, block_size: u64) -> io::Result<u64> {
    let padding = calc(writer.stream_position()?, block_size);
    writer.write_zeros_exact(padding)?;

    Ok(padding)
}

/// Fixed-size, NUL-padded fields.
pub trait ZeroPadding {
    /// Strip trailing NUL bytes. Interior NULs are kept.
    fn trim_end_padding(&self) -> &[u8];

    /// Copy into a zero-filled array. Returns `None` if the data is too long.
    fn to_padded_array<const N: usize>(&self) -> Option<[u8; N]>;
}

impl ZeroPadding for [u8] {
    fn trim_end_padding(&self) -> &[u8] {
        let end = self.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
        &self[..end]
    }

    fn to_padded_array<const N: usize>(&self) -> Option<[u8; N]> {
        let mut result = [0u8; N];
        result.get_mut(..self.len())?.copy_from_slice(self);
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn alignment() {
        assert_eq!(calc(0u64, 4096), 0);
        assert_eq!(calc(1u64, 4096), 4095);
        assert_eq!(round(4097u32, 4096), Some(8192));
        assert_eq!(round(u32::MAX, 4096), None);

        let mut data = vec![1u8; 513];
        assert_eq!(pad_vec(&mut data, 512), 511);
        assert_eq!(data.len(), 1024);
        assert_eq!(data[513..], [0u8; 511]);
        assert_eq!(pad_vec(&mut data, 512), 0);
    }

    #[test]
    fn stream_padding() {
        let mut writer = Cursor::new(vec![1u8; 3]);
        writer.set_position(3);
        assert_eq!(write_zeros(&mut writer, 8).unwrap(), 5);
        assert_eq!(writer.get_ref().len(), 8);

        let mut reader = Cursor::new(vec![0u8; 16]);
        reader.set_position(9);
        assert_eq!(read_discard(&mut reader, 8).unwrap(), 7);
        assert_eq!(reader.position(), 16);
    }

    #[test]
    fn nul_padded_fields() {
        assert_eq!(b"ab\0c\0\0".trim_end_padding(), b"ab\0c");
        assert_eq!(b"\0\0".trim_end_padding(), b"");
        assert_eq!(b"ab".to_padded_array::<4>(), Some(*b"ab\0\0"));
        assert_eq!(b"abcde".to_padded_array::<4>(), None);
    }
}
