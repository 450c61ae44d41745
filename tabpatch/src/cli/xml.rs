// SPDX-FileCopyrightText: 2026 tabpatch contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::{
    cli::{args, status},
    format::rawprogram,
};

fn decrypt_subcommand(cli: &DecryptCli) -> Result<()> {
    let data =
        fs::read(&cli.input).with_context(|| format!("Failed to read file: {:?}", cli.input))?;
    let xml = rawprogram::decrypt_x(&data)
        .with_context(|| format!("Failed to decrypt: {:?}", cli.input))?;

    args::write_file(&cli.output, &xml)?;
    status!("Decrypted {:?} to {:?}", cli.input, cli.output);

    Ok(())
}

fn wipe_subcommand(cli: &WipeCli) -> Result<()> {
    let xml = fs::read_to_string(&cli.input)
        .with_context(|| format!("Failed to read XML: {:?}", cli.input))?;
    let (xml, count) = rawprogram::strip_wipe(&xml)
        .with_context(|| format!("Failed to rewrite XML: {:?}", cli.input))?;

    args::write_file(&cli.output, xml.as_bytes())?;
    status!("Skipped {count} user data entries");

    Ok(())
}

pub fn xml_main(cli: &XmlCli) -> Result<()> {
    match &cli.command {
        XmlCommand::Decrypt(c) => decrypt_subcommand(c),
        XmlCommand::Wipe(c) => wipe_subcommand(c),
    }
}

/// Decrypt an encrypted `.x` program file.
#[derive(Debug, Parser)]
struct DecryptCli {
    /// Path to input `.x` file.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output XML.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,
}

/// Keep user data by removing the files for userdata and metadata.
#[derive(Debug, Parser)]
struct WipeCli {
    /// Path to input program XML.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output program XML.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,
}

#[derive(Debug, Subcommand)]
enum XmlCommand {
    Decrypt(DecryptCli),
    Wipe(WipeCli),
}

/// Decrypt and rewrite program XML files.
#[derive(Debug, Parser)]
pub struct XmlCli {
    #[command(subcommand)]
    command: XmlCommand,
}
