// SPDX-FileCopyrightText: 2026 tabpatch contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Deciding which images get written to which partitions, and in what order.

use std::{
    cmp::Ordering,
    collections::{BTreeMap, btree_map},
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    format::rawprogram::{self, ProgramEntry},
    util,
};

/// Partitions that must be written first, in order. These are what the
/// device needs to reach download mode again if flashing is interrupted.
pub const PRIORITY: &[&str] = &[
    "xbl",
    "xbl_config",
    "abl",
    "tz",
    "hyp",
    "devcfg",
    "aop",
    "aop_config",
    "keymaster",
    "cpucp",
    "shrm",
    "qupfw",
    "uefi",
    "uefisecapp",
    "imagefv",
    "featenabler",
    "multiimgoem",
    "vbmeta",
    "vbmeta_system",
    "dtbo",
    "boot",
    "init_boot",
    "vendor_boot",
];

/// Where an image comes from, plus the location hints from the program XML.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageSource {
    pub path: PathBuf,
    pub lun: Option<u32>,
    pub start_sector: Option<u64>,
}

impl ImageSource {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lun: None,
            start_sector: None,
        }
    }
}

/// Partition name to image mapping.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImageSet {
    images: BTreeMap<String, ImageSource>,
}

impl ImageSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `*.img` file in `dir`, named after the file stem.
    pub fn scan_dir(dir: &Path) -> io::Result<Self> {
        let mut set = Self::new();

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().is_none_or(|e| e != "img") {
                continue;
            }

            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                set.insert(stem, ImageSource::new(path.clone()));
            }
        }

        Ok(set)
    }

    /// Build from `<program>` entries. `resolve` maps an entry's filename to
    /// an existing file and returns `None` if it is not available. Entries
    /// without a label or filename are skipped. The first entry for a label
    /// wins.
    pub fn from_program<'a>(
        entries: impl IntoIterator<Item = &'a ProgramEntry>,
        mut resolve: impl FnMut(&str) -> Option<PathBuf>,
    ) -> Self {
        let mut set = Self::new();

        for entry in entries {
            if entry.label.is_empty()
                || entry.filename.is_empty()
                || set.images.contains_key(&entry.label)
            {
                continue;
            }

            let Some(path) = resolve(&entry.filename) else {
                debug!("Skipping {:?}: {:?} not found", entry.label, entry.filename);
                continue;
            };

            set.insert(
                &entry.label,
                ImageSource {
                    path,
                    lun: Some(entry.lun),
                    start_sector: entry.start_sector,
                },
            );
        }

        set
    }

    pub fn insert(&mut self, name: &str, source: ImageSource) {
        self.images.insert(name.to_owned(), source);
    }

    pub fn get(&self, name: &str) -> Option<&ImageSource> {
        self.images.get(name)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, ImageSource> {
        self.images.iter()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct FlashPlanEntry {
    pub partition: String,
    pub source: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_sector: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lun: Option<u32>,
    pub wipe_eligible: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct FlashPlan {
    pub wipe: bool,
    #[serde(default)]
    pub entries: Vec<FlashPlanEntry>,
}

impl FlashPlan {
    pub fn to_toml(&self) -> Result<String, toml_edit::ser::Error> {
        toml_edit::ser::to_string_pretty(self)
    }

    pub fn from_toml(data: &str) -> Result<Self, toml_edit::de::Error> {
        toml_edit::de::from_str(data)
    }

    pub fn partitions(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.partition.as_str())
    }
}

/// Position in [`PRIORITY`], ignoring the slot suffix.
pub fn priority(partition: &str) -> Option<usize> {
    let base = util::strip_slot_suffix(partition);

    PRIORITY.iter().position(|p| *p == base)
}

fn compare(a: &str, b: &str) -> Ordering {
    match (priority(a), priority(b)) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

/// Order every image in `set` for flashing. userdata and metadata are only
/// included when `wipe` is set.
pub fn build(set: &ImageSet, wipe: bool) -> FlashPlan {
    let mut entries = set
        .iter()
        .filter_map(|(name, source)| {
            let wipe_eligible = rawprogram::is_wipe_only(name);
            if wipe_eligible && !wipe {
                debug!("Excluding {name:?} without wipe");
                return None;
            }

            Some(FlashPlanEntry {
                partition: name.clone(),
                source: source.path.clone(),
                start_sector: source.start_sector,
                lun: source.lun,
                wipe_eligible,
            })
        })
        .collect::<Vec<_>>();

    entries.sort_by(|a, b| compare(&a.partition, &b.partition));

    FlashPlan { wipe, entries }
}
