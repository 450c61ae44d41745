// SPDX-FileCopyrightText: 2026 tabpatch contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::{
    cli::{
        args::{self, ConfigGroup},
        status,
    },
    config::Config,
    device::{DeviceSession, PartitionTable, SerialTransport},
    format::rawprogram,
};

#[derive(Debug, Args)]
struct SessionGroup {
    /// Path to the flash loader.
    #[arg(long, value_name = "FILE", value_parser)]
    loader: PathBuf,

    /// Program XML describing the partition layout.
    #[arg(long, value_name = "FILE", value_parser)]
    program: Vec<PathBuf>,

    /// Serial port of the device. Detected by USB ID by default.
    #[arg(long, value_name = "PORT")]
    port: Option<String>,

    /// Slot to use for partitions that only exist with a slot suffix.
    #[arg(long, value_name = "SLOT")]
    slot: Option<String>,
}

impl SessionGroup {
    fn open(&self, config: &Config) -> Result<DeviceSession<SerialTransport>> {
        let loader = fs::read(&self.loader)
            .with_context(|| format!("Failed to read loader: {:?}", self.loader))?;

        let mut entries = vec![];
        for path in &self.program {
            let xml = fs::read_to_string(path)
                .with_context(|| format!("Failed to read program XML: {path:?}"))?;
            entries.extend(
                rawprogram::parse(&xml)
                    .with_context(|| format!("Failed to parse program XML: {path:?}"))?,
            );
        }

        let mut params = config.session_params(PartitionTable::from_entries(&entries));
        if self.slot.is_some() {
            params.slot.clone_from(&self.slot);
        }

        let port = self.port.clone().or_else(|| config.device.port.clone());

        DeviceSession::open(SerialTransport::new(port), &loader, params)
            .context("Failed to open device session")
    }
}

fn dump_subcommand(cli: &DumpCli, config: &Config) -> Result<()> {
    let mut session = cli.session.open(config)?;

    fs::create_dir_all(&cli.output_dir)
        .with_context(|| format!("Failed to create directory: {:?}", cli.output_dir))?;

    for name in &cli.partition {
        let data = session
            .read_partition(name)
            .with_context(|| format!("Failed to dump partition: {name}"))?;
        let path = cli.output_dir.join(format!("{name}.img"));

        args::write_file(&path, &data)?;
        status!("Dumped {name} to {path:?}");
    }

    if cli.reset {
        session.reset().context("Failed to reset device")?;
    }

    Ok(())
}

fn write_subcommand(cli: &WriteCli, config: &Config) -> Result<()> {
    let data =
        fs::read(&cli.input).with_context(|| format!("Failed to read image: {:?}", cli.input))?;
    let mut session = cli.session.open(config)?;

    session
        .write_partition(&cli.partition, &data)
        .with_context(|| format!("Failed to write partition: {}", cli.partition))?;
    status!("Wrote {:?} to {}", cli.input, cli.partition);

    if cli.reset {
        session.reset().context("Failed to reset device")?;
    }

    Ok(())
}

fn reset_subcommand(cli: &ResetCli, config: &Config) -> Result<()> {
    let mut session = cli.session.open(config)?;
    session.reset().context("Failed to reset device")?;
    status!("Device is rebooting");

    Ok(())
}

pub fn device_main(cli: &DeviceCli, config_group: &ConfigGroup) -> Result<()> {
    let config = config_group.load()?;

    match &cli.command {
        DeviceCommand::Dump(c) => dump_subcommand(c, &config),
        DeviceCommand::Write(c) => write_subcommand(c, &config),
        DeviceCommand::Reset(c) => reset_subcommand(c, &config),
    }
}

/// Read partitions from the device.
#[derive(Debug, Parser)]
struct DumpCli {
    #[command(flatten)]
    session: SessionGroup,

    /// Partition to dump.
    #[arg(short, long, value_name = "NAME", required = true)]
    partition: Vec<String>,

    /// Directory for the dumped images.
    #[arg(short, long, value_name = "DIR", value_parser, default_value = ".")]
    output_dir: PathBuf,

    /// Reboot the device afterwards.
    #[arg(long)]
    reset: bool,
}

/// Write an image to a partition.
#[derive(Debug, Parser)]
struct WriteCli {
    #[command(flatten)]
    session: SessionGroup,

    /// Partition to write.
    #[arg(short, long, value_name = "NAME")]
    partition: String,

    /// Path to input image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Reboot the device afterwards.
    #[arg(long)]
    reset: bool,
}

/// Reboot the device.
#[derive(Debug, Parser)]
struct ResetCli {
    #[command(flatten)]
    session: SessionGroup,
}

#[derive(Debug, Subcommand)]
enum DeviceCommand {
    Dump(DumpCli),
    Write(WriteCli),
    Reset(ResetCli),
}

/// Talk to a device in emergency download mode.
#[derive(Debug, Parser)]
pub struct DeviceCli {
    #[command(subcommand)]
    command: DeviceCommand,
}
