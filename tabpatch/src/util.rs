/*
 * SPDX-FileCopyrightText: 2023 Andrew Gunnerson
 * SPDX-FileCopyrightText: 2026 tabpatch contributors
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{fmt, ops::RangeBounds};

use num_traits::PrimInt;
use thiserror::Error;

pub const ZEROS: [u8; 16384] = [0u8; 16384];

/// A small wrapper to format a number as a size in bytes.
#[derive(Clone, Copy)]
pub struct NumBytes<T: PrimInt>(pub T);

impl<T: PrimInt + fmt::Debug> fmt::Debug for NumBytes<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == T::one() {
            write!(f, "<{:?} byte>", self.0)
        } else {
            write!(f, "<{:?} bytes>", self.0)
        }
    }
}

#[derive(Debug, Error)]
#[error("{value} not in range {range}")]
pub struct OutOfBoundsError {
    value: String,
    range: String,
}

/// Ensure that an integer is within the specified range. The error message
/// includes both the value and the range.
pub fn check_bounds<T, R>(value: T, range: R) -> Result<T, OutOfBoundsError>
where
    T: PrimInt + fmt::Debug,
    R: RangeBounds<T> + fmt::Debug,
{
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(OutOfBoundsError {
            value: format!("{value:?}"),
            range: format!("{range:?}"),
        })
    }
}

/// Check if a byte slice is all zeros.
pub fn is_zero(mut buf: &[u8]) -> bool {
    while !buf.is_empty() {
        let n = buf.len().min(ZEROS.len());
        if buf[..n] != ZEROS[..n] {
            return false;
        }

        buf = &buf[n..];
    }

    true
}

/// Strip an A/B slot suffix (`_a` or `_b`) from a partition name.
pub fn strip_slot_suffix(name: &str) -> &str {
    name.strip_suffix("_a")
        .or_else(|| name.strip_suffix("_b"))
        .unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds() {
        assert_eq!(check_bounds(5u32, 0..10).unwrap(), 5);
        assert!(check_bounds(10u32, 0..10).is_err());
        assert!(check_bounds(10u64, ..=10).is_ok());
    }

    #[test]
    fn slot_suffix() {
        assert_eq!(strip_slot_suffix("boot_a"), "boot");
        assert_eq!(strip_slot_suffix("vbmeta_system_b"), "vbmeta_system");
        assert_eq!(strip_slot_suffix("userdata"), "userdata");
    }
}
