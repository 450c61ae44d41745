// SPDX-FileCopyrightText: 2026 tabpatch contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Country code records in devinfo/persist and the region strings in
//! vendor_boot.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    ops::Range,
    str::FromStr,
};

use memchr::memmem;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid country code: {0:?}")]
    InvalidCode(String),
    #[error("No region layout applies to this image")]
    NoLayout,
    #[error("Region pattern not found (layouts: {layouts:?}, expected: {expected:?}, found: {found})")]
    PatternNotFound {
        layouts: Vec<String>,
        expected: Option<usize>,
        found: usize,
    },
    #[error("Region records disagree on the current code: {0:?}")]
    AmbiguousPattern(Vec<CountryCode>),
    #[error("Pattern swap {from} -> {to} changes the length")]
    SwapLength { from: String, to: String },
    #[error("None of the region patterns were found")]
    SwapPatternNotFound,
}

type Result<T> = std::result::Result<T, Error>;

/// Two uppercase ASCII letters.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct CountryCode([u8; 2]);

impl CountryCode {
    pub fn from_bytes(bytes: [u8; 2]) -> Option<Self> {
        bytes
            .iter()
            .all(|b| b.is_ascii_uppercase())
            .then_some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 2] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        // Always ASCII.
        std::str::from_utf8(&self.0).unwrap_or("??")
    }
}

impl FromStr for CountryCode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_ascii_uppercase();

        <[u8; 2]>::try_from(upper.as_bytes())
            .ok()
            .and_then(Self::from_bytes)
            .ok_or_else(|| Error::InvalidCode(s.to_owned()))
    }
}

impl TryFrom<String> for CountryCode {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<CountryCode> for String {
    fn from(value: CountryCode) -> Self {
        value.as_str().to_owned()
    }
}

impl fmt::Debug for CountryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl fmt::Display for CountryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bytes at a fixed offset that identify a firmware branch's layout.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct Discriminator {
    pub offset: u64,
    #[serde(with = "hex")]
    pub magic: Vec<u8>,
}

impl Discriminator {
    pub fn matches(&self, data: &[u8]) -> bool {
        usize::try_from(self.offset)
            .ok()
            .and_then(|o| data.get(o..))
            .is_some_and(|d| d.starts_with(&self.magic))
    }
}

/// How a country code record is laid out: `prefix`, two code bytes, then
/// `suffix`.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct RegionLayout {
    pub name: String,
    #[serde(default)]
    pub discriminator: Option<Discriminator>,
    #[serde(with = "hex")]
    pub prefix: Vec<u8>,
    #[serde(with = "hex")]
    pub suffix: Vec<u8>,
    /// Only search within this byte range.
    #[serde(default)]
    pub window: Option<Range<u64>>,
    /// Exact number of records the layout must contain.
    #[serde(default)]
    pub expected_count: Option<usize>,
}

/// A country code record. `offset` points at the code bytes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct RegionMatch {
    pub offset: u64,
    pub code: CountryCode,
}

impl RegionLayout {
    pub fn applies_to(&self, data: &[u8]) -> bool {
        self.discriminator.as_ref().is_none_or(|d| d.matches(data))
    }

    fn window_range(&self, len: usize) -> Range<usize> {
        match &self.window {
            Some(w) => {
                let start = usize::try_from(w.start).unwrap_or(usize::MAX).min(len);
                let end = usize::try_from(w.end).unwrap_or(usize::MAX).min(len);
                start..end.max(start)
            }
            None => 0..len,
        }
    }

    /// Find every record. When `known` is not empty, only codes in it count.
    pub fn scan(&self, data: &[u8], known: &BTreeSet<CountryCode>) -> Vec<RegionMatch> {
        let range = self.window_range(data.len());
        let base = range.start;
        let window = &data[range];
        let head = self.prefix.len() + 2;

        // The suffix is the most selective part of the default layouts.
        memmem::find_iter(window, &self.suffix)
            .filter(|&pos| pos >= head)
            .filter_map(|pos| {
                let start = pos - head;
                if &window[start..start + self.prefix.len()] != self.prefix.as_slice() {
                    return None;
                }

                let code_pos = start + self.prefix.len();
                let code = CountryCode::from_bytes([window[code_pos], window[code_pos + 1]])?;
                if !known.is_empty() && !known.contains(&code) {
                    return None;
                }

                Some(RegionMatch {
                    offset: (base + code_pos) as u64,
                    code,
                })
            })
            .collect()
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Detection {
    pub layout: String,
    pub code: CountryCode,
    pub matches: Vec<RegionMatch>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RegionPatch {
    pub data: Vec<u8>,
    pub layout: String,
    pub previous: CountryCode,
    pub target: CountryCode,
    pub count: usize,
    pub changed: bool,
}

/// Replacement of one byte pattern by another of the same length.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct PatternSwap {
    #[serde(with = "hex")]
    pub from: Vec<u8>,
    #[serde(with = "hex")]
    pub to: Vec<u8>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum ConvertOutcome {
    Converted { count: usize },
    AlreadyConverted,
}

/// Swap every occurrence of each pattern. Matches are located in the input
/// before anything is replaced. If nothing is replaced but some replacement
/// patterns are already present, the data is reported as already converted.
pub fn swap_patterns(mut data: Vec<u8>, swaps: &[PatternSwap]) -> Result<(Vec<u8>, ConvertOutcome)> {
    for swap in swaps {
        if swap.from.len() != swap.to.len() || swap.from.is_empty() {
            return Err(Error::SwapLength {
                from: hex::encode(&swap.from),
                to: hex::encode(&swap.to),
            });
        }
    }

    let positions = swaps
        .iter()
        .map(|s| memmem::find_iter(&data, &s.from).collect::<Vec<_>>())
        .collect::<Vec<_>>();
    let count = positions.iter().map(|p| p.len()).sum::<usize>();

    if count > 0 {
        for (swap, positions) in swaps.iter().zip(positions) {
            debug!(
                "Replacing {} occurrences of {}",
                positions.len(),
                hex::encode_upper(&swap.from),
            );

            for pos in positions {
                data[pos..pos + swap.to.len()].copy_from_slice(&swap.to);
            }
        }

        return Ok((data, ConvertOutcome::Converted { count }));
    }

    if swaps
        .iter()
        .any(|s| memmem::find(&data, &s.to).is_some())
    {
        Ok((data, ConvertOutcome::AlreadyConverted))
    } else {
        Err(Error::SwapPatternNotFound)
    }
}

/// Detects and rewrites country code records using a list of layouts.
#[derive(Clone, Debug, Default)]
pub struct RegionPatcher {
    layouts: Vec<RegionLayout>,
    known_codes: BTreeMap<CountryCode, String>,
    swaps: Vec<PatternSwap>,
}

impl RegionPatcher {
    pub fn new(layouts: Vec<RegionLayout>, known_codes: BTreeMap<CountryCode, String>) -> Self {
        Self {
            layouts,
            known_codes,
            swaps: vec![],
        }
    }

    /// Set the byte pattern swaps used by [`Self::convert_rom`].
    pub fn with_swaps(mut self, swaps: Vec<PatternSwap>) -> Self {
        self.swaps = swaps;
        self
    }

    pub fn layouts(&self) -> &[RegionLayout] {
        &self.layouts
    }

    pub fn country_name(&self, code: CountryCode) -> Option<&str> {
        self.known_codes.get(&code).map(|s| s.as_str())
    }

    /// Find the current code. Layouts whose discriminator does not match are
    /// skipped. The first remaining layout with any record is used.
    pub fn detect(&self, data: &[u8]) -> Result<Detection> {
        let known = self.known_codes.keys().copied().collect::<BTreeSet<_>>();
        let candidates = self
            .layouts
            .iter()
            .filter(|l| l.applies_to(data))
            .collect::<Vec<_>>();

        if candidates.is_empty() {
            return Err(Error::NoLayout);
        }

        let Some((layout, matches)) = candidates
            .iter()
            .map(|l| (*l, l.scan(data, &known)))
            .find(|(_, m)| !m.is_empty())
        else {
            return Err(Error::PatternNotFound {
                layouts: candidates.iter().map(|l| l.name.clone()).collect(),
                expected: None,
                found: 0,
            });
        };

        if let Some(expected) = layout.expected_count {
            if matches.len() != expected {
                return Err(Error::PatternNotFound {
                    layouts: vec![layout.name.clone()],
                    expected: Some(expected),
                    found: matches.len(),
                });
            }
        }

        let codes = matches
            .iter()
            .map(|m| m.code)
            .collect::<BTreeSet<_>>();
        if codes.len() != 1 {
            return Err(Error::AmbiguousPattern(codes.into_iter().collect()));
        }

        let code = matches[0].code;
        debug!(
            "Detected {code} in {} records using layout {:?}",
            matches.len(),
            layout.name,
        );

        Ok(Detection {
            layout: layout.name.clone(),
            code,
            matches,
        })
    }

    /// Rewrite every record to `target`. Only the code bytes change. If the
    /// records already hold `target`, the data is returned untouched.
    pub fn patch_region(&self, data: Vec<u8>, target: CountryCode) -> Result<RegionPatch> {
        let detection = self.detect(&data)?;
        let count = detection.matches.len();

        if detection.code == target {
            return Ok(RegionPatch {
                data,
                layout: detection.layout,
                previous: detection.code,
                target,
                count,
                changed: false,
            });
        }

        let mut data = data;
        for m in &detection.matches {
            let offset = m.offset as usize;
            data[offset..offset + 2].copy_from_slice(target.as_bytes());
        }

        Ok(RegionPatch {
            data,
            layout: detection.layout,
            previous: detection.code,
            target,
            count,
            changed: true,
        })
    }

    /// Convert a vendor_boot payload from one ROM region to another by
    /// swapping the configured byte patterns.
    pub fn convert_rom(&self, data: Vec<u8>) -> Result<(Vec<u8>, ConvertOutcome)> {
        swap_patterns(data, &self.swaps)
    }
}
