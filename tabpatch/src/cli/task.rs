// SPDX-FileCopyrightText: 2026 tabpatch contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    path::PathBuf,
    sync::{Arc, atomic::AtomicBool},
};

use anyhow::{Context, Result, bail};
use clap::Parser;

use crate::{
    cli::{args::ConfigGroup, status, warning},
    patch::{region::CountryCode, rollback::SyncMode},
    pipeline::{Pipeline, SerialConnector, Task, TaskSettings, Workspace},
};

pub fn task_main(
    cli: &TaskCli,
    config_group: &ConfigGroup,
    cancel_signal: &Arc<AtomicBool>,
) -> Result<()> {
    let config = config_group.load()?;
    let keys = config_group.key_ring(&config)?;

    let settings = TaskSettings {
        region: cli.region,
        wipe: cli.wipe,
        skip_rollback: cli.skip_rollback,
        rollback_mode: if cli.lock_higher {
            SyncMode::LockHigher
        } else {
            SyncMode::Match
        },
        slot: cli.slot.clone().or_else(|| config.device.slot.clone()),
        reset_after: !cli.no_reset,
    };

    let mut connector = SerialConnector {
        port: cli.port.clone().or_else(|| config.device.port.clone()),
    };

    if cli.task.needs_device() {
        warning!("Do not disconnect the device until the task finishes");
    }

    let pipeline = Pipeline::new(
        Workspace::new(&cli.workspace),
        config,
        keys,
        settings,
        cancel_signal.clone(),
    );
    let report = pipeline.run(cli.task, &mut connector);

    let data = toml_edit::ser::to_string_pretty(&report).context("Failed to serialize report")?;
    print!("{data}");

    if !report.is_success() {
        bail!(
            "Task {} failed in stage {}: {:?}",
            report.task,
            report.stage.as_deref().unwrap_or("unknown"),
            report.status,
        );
    }

    for path in &report.outputs {
        status!("Wrote {path:?}");
    }

    Ok(())
}

/// Run a workflow against a workspace directory.
#[derive(Debug, Parser)]
pub struct TaskCli {
    /// Task to run.
    ///
    /// One of convert-region, modify-xml, patch-devinfo, arb-bypass, root,
    /// dump, flash, install, update, or rescue.
    #[arg(value_name = "TASK")]
    task: Task,

    /// Workspace directory.
    #[arg(short, long, value_name = "DIR", value_parser, default_value = ".")]
    workspace: PathBuf,

    /// Country code written to devinfo and persist.
    #[arg(short, long, value_name = "CODE")]
    region: Option<CountryCode>,

    /// Erase user data and patch devinfo and persist.
    #[arg(long)]
    wipe: bool,

    /// Do not dump or patch rollback indices.
    #[arg(long)]
    skip_rollback: bool,

    /// Raise rollback indices above the device's instead of matching them.
    #[arg(long)]
    lock_higher: bool,

    /// Slot to use for partitions that only exist with a slot suffix.
    #[arg(long, value_name = "SLOT")]
    slot: Option<String>,

    /// Leave the device in download mode when done.
    #[arg(long)]
    no_reset: bool,

    /// Serial port of the device. Detected by USB ID by default.
    #[arg(long, value_name = "PORT")]
    port: Option<String>,
}
