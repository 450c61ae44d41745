// SPDX-FileCopyrightText: 2026 tabpatch contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use crate::{
    cli::{
        args::{self, ConfigGroup},
        status,
    },
    patch::{
        rollback::{self, ArbEntry, SyncMode},
        sign,
    },
};

fn rollback_index(path: &Path) -> Result<u64> {
    let image = args::read_image(path)?;
    let header = image
        .header()
        .with_context(|| format!("Image has no vbmeta header: {path:?}"))?;

    Ok(header.rollback_index)
}

fn status_subcommand(cli: &StatusCli) -> Result<()> {
    let mut entries = vec![];

    for (name, path) in &cli.current {
        let new = cli
            .new
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, p)| rollback_index(p))
            .transpose()?;

        entries.push(ArbEntry {
            partition: name.clone(),
            current: rollback_index(path)?,
            new,
        });
    }

    for entry in &entries {
        match entry.new {
            Some(new) => println!("{}: {} -> {new}", entry.partition, entry.current),
            None => println!("{}: {} -> (missing)", entry.partition, entry.current),
        }
    }

    status!("Status: {:?}", rollback::status(&entries));

    Ok(())
}

fn sync_subcommand(
    cli: &SyncCli,
    config_group: &ConfigGroup,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let source = args::read_image(&cli.source)?;
    let target = args::read_image(&cli.target)?;
    let mode = SyncMode::from(cli.mode);

    let source_index = source.header().context("Source has no vbmeta header")?.rollback_index;
    let target_header = target.header().context("Target has no vbmeta header")?;
    let index = rollback::target_index(source_index, target_header.rollback_index, mode)?;

    // Only unchanged images can be handled without a signing key.
    let keys;
    let key = if index != target_header.rollback_index {
        let config = config_group.load()?;
        keys = config_group.key_ring(&config)?;
        sign::select_key(&keys, target_header, cli.fallback)?
    } else {
        None
    };

    let (image, outcome) = rollback::sync_image(&source, target, mode, key, cancel_signal)
        .with_context(|| format!("Failed to sync rollback index: {:?}", cli.target))?;

    if outcome.changed {
        status!("Rollback index {} -> {}", outcome.previous, outcome.index);
    } else {
        status!("Rollback index {} is unchanged", outcome.index);
    }

    args::write_file(&cli.output, image.serialize())
}

pub fn arb_main(cli: &ArbCli, config: &ConfigGroup, cancel_signal: &AtomicBool) -> Result<()> {
    match &cli.command {
        ArbCommand::Status(c) => status_subcommand(c),
        ArbCommand::Sync(c) => sync_subcommand(c, config, cancel_signal),
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    /// Raise the target index to the source index.
    #[default]
    Match,
    /// Raise the target index above the source index.
    LockHigher,
}

impl From<ModeArg> for SyncMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Match => Self::Match,
            ModeArg::LockHigher => Self::LockHigher,
        }
    }
}

/// Compare the rollback indices of the flashed and new images.
#[derive(Debug, Parser)]
struct StatusCli {
    /// Image dumped from the device.
    #[arg(long, value_name = "NAME=FILE", value_parser = args::parse_named_path, required = true)]
    current: Vec<(String, PathBuf)>,

    /// Image that is about to be flashed.
    #[arg(long, value_name = "NAME=FILE", value_parser = args::parse_named_path)]
    new: Vec<(String, PathBuf)>,
}

/// Copy the rollback index of one image into another.
#[derive(Debug, Parser)]
struct SyncCli {
    /// Image carrying the index to match, usually a dump from the device.
    #[arg(short, long, value_name = "FILE", value_parser)]
    source: PathBuf,

    /// Image to update.
    #[arg(short, long, value_name = "FILE", value_parser)]
    target: PathBuf,

    /// Path to output image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    #[arg(long, value_name = "MODE", value_enum, default_value_t)]
    mode: ModeArg,

    /// Use the fallback boot key if no key matches the target.
    #[arg(long)]
    fallback: bool,
}

#[derive(Debug, Subcommand)]
enum ArbCommand {
    Status(StatusCli),
    Sync(SyncCli),
}

/// Inspect and synchronize anti-rollback indices.
#[derive(Debug, Parser)]
pub struct ArbCli {
    #[command(subcommand)]
    command: ArbCommand,
}
