// SPDX-FileCopyrightText: 2026 tabpatch contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Offsets, byte patterns, country codes, and key mappings. The built-in
//! defaults are embedded in the binary and a config file only needs to
//! contain the values it changes.

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use toml_edit::{DocumentMut, TableLike};

use crate::{
    crypto::{self, KeyRing},
    device::{PartitionTable, SessionParams},
    patch::region::{CountryCode, PatternSwap, RegionLayout, RegionPatcher},
};

pub const DEFAULT_CONFIG: &str = include_str!("../config/tabpatch.toml");

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read config: {0:?}")]
    Read(PathBuf, #[source] io::Error),
    #[error("Invalid TOML syntax")]
    Syntax(#[from] toml_edit::TomlError),
    #[error("Invalid config values")]
    Deserialize(#[from] toml_edit::de::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Firehose programmer filename inside the image directory.
    pub loader: String,
    pub memory: String,
    pub max_payload_size: usize,
    pub handshake_timeout_ms: u64,
    pub io_timeout_ms: u64,
    /// Slot to use when a partition has no unslotted entry.
    pub slot: Option<String>,
    /// Serial port to use instead of searching by USB ID.
    pub port: Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        let params = SessionParams::default();

        Self {
            loader: "xbl_s_devprg_ns.melf".to_owned(),
            memory: params.memory,
            max_payload_size: params.max_payload_size,
            handshake_timeout_ms: params.handshake_timeout.as_millis() as u64,
            io_timeout_ms: params.io_timeout.as_millis() as u64,
            slot: None,
            port: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct KeyConfig {
    /// AVB public key fingerprint to private key path.
    pub map: BTreeMap<String, PathBuf>,
    /// Fingerprint of the key used for boot images without an embedded key.
    pub fallback_boot_key: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RegionConfig {
    pub layouts: Vec<RegionLayout>,
    pub swaps: Vec<PatternSwap>,
    pub codes: BTreeMap<CountryCode, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub keys: KeyConfig,
    pub region: RegionConfig,
}

/// Merge `overlay` into `base`. Tables are merged recursively and every
/// other value, including arrays of tables, replaces the original.
fn merge(base: &mut dyn TableLike, overlay: &dyn TableLike) {
    for (key, item) in overlay.iter() {
        let nested = item.is_table_like() && base.get(key).is_some_and(|i| i.is_table_like());

        if nested {
            if let (Some(dst), Some(src)) = (
                base.get_mut(key).and_then(|i| i.as_table_like_mut()),
                item.as_table_like(),
            ) {
                merge(dst, src);
            }
        } else {
            base.insert(key, item.clone());
        }
    }
}

impl Config {
    /// The built-in configuration.
    pub fn builtin() -> Result<Self> {
        Ok(toml_edit::de::from_str(DEFAULT_CONFIG)?)
    }

    /// Apply `contents` on top of the built-in configuration.
    pub fn from_overrides(contents: &str) -> Result<Self> {
        let mut document: DocumentMut = DEFAULT_CONFIG.parse()?;
        let overlay: DocumentMut = contents.parse()?;

        merge(document.as_table_mut(), overlay.as_table());

        Ok(toml_edit::de::from_str(&document.to_string())?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| Error::Read(path.to_owned(), e))?;

        Self::from_overrides(&contents)
    }

    pub fn region_patcher(&self) -> RegionPatcher {
        RegionPatcher::new(self.region.layouts.clone(), self.region.codes.clone())
            .with_swaps(self.region.swaps.clone())
    }

    /// Load the mapped keys. Relative paths are resolved against `base_dir`.
    pub fn key_ring(&self, base_dir: &Path) -> std::result::Result<KeyRing, crypto::Error> {
        KeyRing::load(
            &self.keys.map,
            self.keys.fallback_boot_key.as_deref(),
            base_dir,
        )
    }

    pub fn session_params(&self, partitions: PartitionTable) -> SessionParams {
        SessionParams {
            memory: self.device.memory.clone(),
            max_payload_size: self.device.max_payload_size,
            handshake_timeout: Duration::from_millis(self.device.handshake_timeout_ms),
            io_timeout: Duration::from_millis(self.device.io_timeout_ms),
            slot: self.device.slot.clone(),
            partitions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_config() {
        let config = Config::builtin().unwrap();

        assert_eq!(config.device, DeviceConfig::default());
        assert_eq!(
            config.keys.fallback_boot_key.as_deref(),
            Some("2597c218aae470a130f61162feaae70afd97f011"),
        );
        assert_eq!(config.keys.map.len(), 2);

        let names = config
            .region
            .layouts
            .iter()
            .map(|l| l.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, ["country-marker-legacy", "country-marker"]);
        assert_eq!(config.region.layouts[1].suffix, b"XX\0");

        assert_eq!(config.region.swaps.len(), 2);
        assert_eq!(config.region.swaps[0].from, b".ROW");
        assert_eq!(config.region.swaps[0].to, b".PRC");

        let cn: CountryCode = "CN".parse().unwrap();
        let kr: CountryCode = "KR".parse().unwrap();
        assert_eq!(config.region.codes.get(&cn).map(|s| s.as_str()), Some("China"));
        assert_eq!(config.region.codes.get(&kr).map(|s| s.as_str()), Some("Korea"));
        assert_eq!(config.region.codes.len(), 89);
    }

    #[test]
    fn overrides_are_merged() {
        let config = Config::from_overrides(
            r#"
            [device]
            memory = "eMMC"
            slot = "b"

            [region.codes]
            XK = "Kosovo"

            [[region.layouts]]
            name = "custom"
            prefix = "ff"
            suffix = "ee"
            window = { start = 0, end = 4096 }
            "#,
        )
        .unwrap();

        assert_eq!(config.device.memory, "eMMC");
        assert_eq!(config.device.slot.as_deref(), Some("b"));
        assert_eq!(config.device.loader, "xbl_s_devprg_ns.melf");
        assert_eq!(config.region.codes.len(), 90);
        assert_eq!(config.region.layouts.len(), 1);
        assert_eq!(config.region.layouts[0].window, Some(0..4096));
        assert_eq!(config.region.swaps.len(), 2);
    }

    #[test]
    fn invalid_override() {
        assert!(matches!(
            Config::from_overrides("[region.codes]\nCHN = \"China\"\n"),
            Err(Error::Deserialize(_)),
        ));
        assert!(matches!(
            Config::from_overrides("[device"),
            Err(Error::Syntax(_)),
        ));
    }
}
