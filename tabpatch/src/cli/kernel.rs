// SPDX-FileCopyrightText: 2026 tabpatch contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{fs, path::PathBuf, sync::atomic::AtomicBool};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::{
    cli::{
        args::{self, ConfigGroup},
        status, warning,
    },
    format::image::PartitionImage,
    patch::{
        kernel,
        sign::{self, AlgorithmPolicy},
    },
};

fn version_subcommand(cli: &VersionCli) -> Result<()> {
    let data =
        fs::read(&cli.input).with_context(|| format!("Failed to read file: {:?}", cli.input))?;

    // Boot images are searched through their kernel section.
    let version = match kernel::kernel_version(&data) {
        Some(v) => Some(v),
        None => PartitionImage::parse(data)
            .ok()
            .and_then(|i| kernel::boot_image(&i).ok())
            .and_then(|b| kernel::kernel_version(b.kernel())),
    };

    match version {
        Some(v) => println!("{v}"),
        None => warning!("No kernel version string found"),
    }

    Ok(())
}

fn replace_subcommand(
    cli: &ReplaceCli,
    config_group: &ConfigGroup,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let boot = args::read_image(&cli.input)?;
    let new_kernel = fs::read(&cli.kernel)
        .with_context(|| format!("Failed to read kernel: {:?}", cli.kernel))?;

    let config = config_group.load()?;
    let keys = config_group.key_ring(&config)?;
    let key = match boot.header() {
        Some(h) => sign::select_key(&keys, h, true)?,
        None => None,
    };

    let patched =
        kernel::replace_kernel(&boot, new_kernel, key, AlgorithmPolicy::Keep, cancel_signal)
            .with_context(|| format!("Failed to replace kernel: {:?}", cli.input))?;

    args::write_file(&cli.output, patched.serialize())?;
    status!("Wrote {:?}", cli.output);

    Ok(())
}

pub fn kernel_main(
    cli: &KernelCli,
    config: &ConfigGroup,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    match &cli.command {
        KernelCommand::Version(c) => version_subcommand(c),
        KernelCommand::Replace(c) => replace_subcommand(c, config, cancel_signal),
    }
}

/// Print the Linux version string of a kernel or boot image.
#[derive(Debug, Parser)]
struct VersionCli {
    /// Path to kernel or boot image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,
}

/// Replace the kernel in a boot image.
#[derive(Debug, Parser)]
struct ReplaceCli {
    /// Path to input boot image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to new kernel.
    #[arg(short, long, value_name = "FILE", value_parser)]
    kernel: PathBuf,

    /// Path to output boot image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,
}

#[derive(Debug, Subcommand)]
enum KernelCommand {
    Version(VersionCli),
    Replace(ReplaceCli),
}

/// Inspect and replace boot image kernels.
#[derive(Debug, Parser)]
pub struct KernelCli {
    #[command(subcommand)]
    command: KernelCommand,
}
