// SPDX-FileCopyrightText: 2026 tabpatch contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{fs, path::PathBuf, sync::atomic::AtomicBool};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::{
    cli::{
        args::{self, ConfigGroup},
        status,
    },
    patch::region::{ConvertOutcome, CountryCode},
    pipeline,
};

fn detect_subcommand(cli: &DetectCli, config_group: &ConfigGroup) -> Result<()> {
    let patcher = config_group.load()?.region_patcher();
    let data =
        fs::read(&cli.input).with_context(|| format!("Failed to read image: {:?}", cli.input))?;

    let detection = patcher
        .detect(&data)
        .with_context(|| format!("Failed to detect region: {:?}", cli.input))?;

    status!(
        "Region {} ({}) in {} records, layout {:?}",
        detection.code,
        patcher.country_name(detection.code).unwrap_or("unknown"),
        detection.matches.len(),
        detection.layout,
    );

    for m in &detection.matches {
        println!("  {:#x}", m.offset);
    }

    Ok(())
}

fn patch_subcommand(cli: &PatchCli, config_group: &ConfigGroup) -> Result<()> {
    let patcher = config_group.load()?.region_patcher();
    let data =
        fs::read(&cli.input).with_context(|| format!("Failed to read image: {:?}", cli.input))?;

    let patch = patcher
        .patch_region(data, cli.region)
        .with_context(|| format!("Failed to patch region: {:?}", cli.input))?;

    if patch.changed {
        status!(
            "Changed region {} -> {} in {} records",
            patch.previous,
            patch.target,
            patch.count,
        );
    } else {
        status!("Region is already {}", patch.target);
    }

    args::write_file(&cli.output, &patch.data)
}

fn convert_subcommand(
    cli: &ConvertCli,
    config_group: &ConfigGroup,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let config = config_group.load()?;
    let keys = config_group.key_ring(&config)?;
    let vendor_boot = args::read_image(&cli.vendor_boot)?;
    let vbmeta = args::read_image(&cli.vbmeta)?;

    let (vendor_boot, vbmeta, outcome) = pipeline::convert_images(
        &config.region_patcher(),
        &keys,
        vendor_boot,
        vbmeta,
        cancel_signal,
    )
    .context("Failed to convert vendor_boot")?;

    match outcome {
        ConvertOutcome::Converted { count } => status!("Replaced {count} region patterns"),
        ConvertOutcome::AlreadyConverted => status!("vendor_boot is already converted"),
    }

    fs::create_dir_all(&cli.output_dir)
        .with_context(|| format!("Failed to create directory: {:?}", cli.output_dir))?;
    args::write_file(&cli.output_dir.join("vendor_boot.img"), vendor_boot.serialize())?;
    args::write_file(&cli.output_dir.join("vbmeta.img"), vbmeta.serialize())?;

    Ok(())
}

pub fn region_main(
    cli: &RegionCli,
    config: &ConfigGroup,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    match &cli.command {
        RegionCommand::Detect(c) => detect_subcommand(c, config),
        RegionCommand::Patch(c) => patch_subcommand(c, config),
        RegionCommand::Convert(c) => convert_subcommand(c, config, cancel_signal),
    }
}

/// Show the region code stored in a devinfo or persist dump.
#[derive(Debug, Parser)]
struct DetectCli {
    /// Path to input dump.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,
}

/// Rewrite every region record in a devinfo or persist dump.
#[derive(Debug, Parser)]
struct PatchCli {
    /// Path to input dump.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output dump.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    /// Target country code, eg. `KR`.
    #[arg(short, long, value_name = "CODE")]
    region: CountryCode,
}

/// Convert a vendor_boot image to the global ROM and re-sign vbmeta.
#[derive(Debug, Parser)]
struct ConvertCli {
    /// Path to input vendor_boot image.
    #[arg(long, value_name = "FILE", value_parser)]
    vendor_boot: PathBuf,

    /// Path to input vbmeta image.
    #[arg(long, value_name = "FILE", value_parser)]
    vbmeta: PathBuf,

    /// Directory for the converted images.
    #[arg(short, long, value_name = "DIR", value_parser)]
    output_dir: PathBuf,
}

#[derive(Debug, Subcommand)]
enum RegionCommand {
    Detect(DetectCli),
    Patch(PatchCli),
    Convert(ConvertCli),
}

/// Detect and patch region codes.
#[derive(Debug, Parser)]
pub struct RegionCli {
    #[command(subcommand)]
    command: RegionCommand,
}
