// SPDX-FileCopyrightText: 2026 tabpatch contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{fmt, path::PathBuf, str::FromStr};

use serde::Serialize;
use thiserror::Error;

use crate::patch::{region::CountryCode, rollback::SyncMode};

#[derive(Debug, Error)]
#[error("Unknown task: {0:?}")]
pub struct UnknownTask(String);

/// Named units of work run by [`super::Pipeline`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Task {
    /// Convert vendor_boot to the target ROM region and re-sign vbmeta.
    ConvertRegion,
    /// Decrypt `.x` program files and rewrite them for the wipe setting.
    ModifyXml,
    /// Patch the country code in dumped devinfo and persist.
    PatchDevinfo,
    /// Carry the device's rollback indices into the new boot and
    /// vbmeta_system.
    ArbBypass,
    /// Swap the kernel of a boot image.
    Root,
    /// Dump devinfo, persist, boot, and vbmeta_system.
    Dump,
    /// Write the firmware set and patched outputs.
    Flash,
    /// Full conversion with a data wipe.
    Install,
    /// Full conversion keeping user data.
    Update,
    /// Write backed up dumps back to the device.
    Rescue,
}

impl Task {
    pub const ALL: [Self; 10] = [
        Self::ConvertRegion,
        Self::ModifyXml,
        Self::PatchDevinfo,
        Self::ArbBypass,
        Self::Root,
        Self::Dump,
        Self::Flash,
        Self::Install,
        Self::Update,
        Self::Rescue,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::ConvertRegion => "convert-region",
            Self::ModifyXml => "modify-xml",
            Self::PatchDevinfo => "patch-devinfo",
            Self::ArbBypass => "arb-bypass",
            Self::Root => "root",
            Self::Dump => "dump",
            Self::Flash => "flash",
            Self::Install => "install",
            Self::Update => "update",
            Self::Rescue => "rescue",
        }
    }

    pub fn needs_device(self) -> bool {
        matches!(
            self,
            Self::Dump | Self::Flash | Self::Install | Self::Update | Self::Rescue,
        )
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Task {
    type Err = UnknownTask;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.name() == s)
            .ok_or_else(|| UnknownTask(s.to_owned()))
    }
}

/// Operator choices for a task run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskSettings {
    /// Country code to write into devinfo and persist.
    pub region: Option<CountryCode>,
    /// Flash userdata and metadata. Forced on by install and off by update.
    pub wipe: bool,
    pub skip_rollback: bool,
    pub rollback_mode: SyncMode,
    /// Overrides the configured slot.
    pub slot: Option<String>,
    /// Reboot the device after device tasks.
    pub reset_after: bool,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            region: None,
            wipe: false,
            skip_rollback: false,
            rollback_mode: SyncMode::Match,
            slot: None,
            reset_after: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Status {
    Success,
    InputMissing,
    FormatError,
    DeviceError,
    SignatureError,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TaskReport {
    pub task: Task,
    pub status: Status,
    /// Stage that failed, if any.
    pub stage: Option<String>,
    pub detail: String,
    pub outputs: Vec<PathBuf>,
}

impl TaskReport {
    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}
