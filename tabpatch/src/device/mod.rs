// SPDX-FileCopyrightText: 2026 tabpatch contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::collections::{BTreeMap, btree_map};

use serde::Serialize;

use crate::format::rawprogram::ProgramEntry;

pub mod firehose;
pub mod sahara;
pub mod session;
pub mod transport;

pub use session::{DeviceSession, Error, SessionParams, SessionState};
pub use transport::{SerialTransport, Transport};

/// Where a partition lives on the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct PartitionLocation {
    pub lun: u32,
    pub start_sector: u64,
    pub num_sectors: u64,
    pub sector_size: u32,
    /// Size declared by the program XML, used to verify dumps.
    pub expected_size: Option<u64>,
}

impl PartitionLocation {
    pub fn byte_len(&self) -> u64 {
        self.num_sectors.saturating_mul(self.sector_size.into())
    }
}

impl From<&PartitionLocation> for firehose::SectorRange {
    fn from(value: &PartitionLocation) -> Self {
        Self {
            lun: value.lun,
            start_sector: value.start_sector,
            num_sectors: value.num_sectors,
            sector_size: value.sector_size,
        }
    }
}

/// Partition name to location mapping, usually built from the program XML
/// files of a firmware package.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartitionTable {
    entries: BTreeMap<String, PartitionLocation>,
}

impl PartitionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from `<program>` entries. Entries without a label or
    /// with a start sector relative to the end of the disk are skipped. If a
    /// label appears more than once, the first occurrence wins.
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a ProgramEntry>) -> Self {
        let mut table = Self::new();

        for entry in entries {
            let Some(start_sector) = entry.start_sector else {
                continue;
            };
            if entry.label.is_empty() || table.entries.contains_key(&entry.label) {
                continue;
            }

            table.insert(
                &entry.label,
                PartitionLocation {
                    lun: entry.lun,
                    start_sector,
                    num_sectors: entry.num_sectors,
                    sector_size: entry.sector_size,
                    expected_size: entry.expected_size(),
                },
            );
        }

        table
    }

    pub fn insert(&mut self, name: &str, location: PartitionLocation) {
        self.entries.insert(name.to_owned(), location);
    }

    /// Look up `name`. If there is no exact match, the name with the `slot`
    /// suffix is tried. Without a slot, `_a` and then `_b` are tried.
    pub fn resolve(&self, name: &str, slot: Option<&str>) -> Option<(&str, &PartitionLocation)> {
        let slots = match slot {
            Some(s) => vec![s],
            None => vec!["a", "b"],
        };

        std::iter::once(name.to_owned())
            .chain(slots.into_iter().map(|s| format!("{name}_{s}")))
            .find_map(|n| self.entries.get_key_value(&n))
            .map(|(k, v)| (k.as_str(), v))
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, PartitionLocation> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
