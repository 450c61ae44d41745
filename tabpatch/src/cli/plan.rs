// SPDX-FileCopyrightText: 2026 tabpatch contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    path::PathBuf,
    sync::{Arc, atomic::AtomicBool},
};

use anyhow::{Context, Result};
use clap::Parser;

use crate::{
    cli::args::{self, ConfigGroup},
    crypto::KeyRing,
    pipeline::{Pipeline, TaskSettings, Workspace},
};

pub fn plan_main(
    cli: &PlanCli,
    config_group: &ConfigGroup,
    cancel_signal: &Arc<AtomicBool>,
) -> Result<()> {
    let settings = TaskSettings {
        wipe: cli.wipe,
        slot: cli.slot.clone(),
        ..Default::default()
    };
    let pipeline = Pipeline::new(
        Workspace::new(&cli.workspace),
        config_group.load()?,
        KeyRing::new(),
        settings,
        cancel_signal.clone(),
    );

    let plan = pipeline
        .plan()
        .with_context(|| format!("Failed to build flash plan: {:?}", cli.workspace))?;
    let data = plan.to_toml().context("Failed to serialize flash plan")?;

    match &cli.output {
        Some(path) => args::write_file(path, data.as_bytes())?,
        None => print!("{data}"),
    }

    Ok(())
}

/// Show which images would be flashed and in what order.
#[derive(Debug, Parser)]
pub struct PlanCli {
    /// Workspace directory.
    #[arg(short, long, value_name = "DIR", value_parser, default_value = ".")]
    workspace: PathBuf,

    /// Include partitions that erase user data.
    #[arg(long)]
    wipe: bool,

    /// Slot used to place images that the program XML does not locate.
    #[arg(long, value_name = "SLOT")]
    slot: Option<String>,

    /// Path to output TOML. Printed to stdout by default.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: Option<PathBuf>,
}
