// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-FileCopyrightText: 2026 tabpatch contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{collections::BTreeMap, fs, path::PathBuf, sync::atomic::AtomicBool};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

use crate::{
    cli::{
        args::{self, ConfigGroup},
        status, warning,
    },
    crypto,
    format::{
        avb::{self, Footer, Header},
        image::ImageKind,
    },
    patch::sign::{self, AlgorithmPolicy},
};

#[derive(Serialize)]
struct AvbInfo<'a> {
    kind: String,
    image_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    public_key_sha1: Option<String>,
    header: &'a Header,
    #[serde(skip_serializing_if = "Option::is_none")]
    footer: Option<&'a Footer>,
}

fn read_contents(partitions: &[(String, PathBuf)]) -> Result<BTreeMap<String, Vec<u8>>> {
    partitions
        .iter()
        .map(|(name, path)| {
            let data = fs::read(path)
                .with_context(|| format!("Failed to read partition image: {path:?}"))?;
            Ok((name.clone(), data))
        })
        .collect()
}

fn info_subcommand(cli: &InfoCli) -> Result<()> {
    let image = args::read_image(&cli.input)?;
    let header = image
        .header()
        .with_context(|| format!("Image has no vbmeta header: {:?}", cli.input))?;

    let info = AvbInfo {
        kind: format!("{:?}", image.kind()),
        image_size: image.len(),
        public_key_sha1: (!header.public_key.is_empty())
            .then(|| crypto::avb_key_fingerprint(&header.public_key)),
        header,
        footer: image.footer(),
    };

    let data = toml_edit::ser::to_string_pretty(&info)
        .with_context(|| format!("Failed to serialize AVB info: {:?}", cli.input))?;
    print!("{data}");

    Ok(())
}

fn verify_subcommand(cli: &VerifyCli, cancel_signal: &AtomicBool) -> Result<()> {
    let image = args::read_image(&cli.input)?;

    let public_key = match image.kind() {
        ImageKind::Vbmeta => {
            let contents = read_contents(&cli.partition)?;
            let header = image.header().context("Image has no vbmeta header")?;
            sign::verify(header, &contents, cancel_signal)
        }
        _ => sign::verify_image(&image, cancel_signal),
    }
    .with_context(|| format!("Failed to verify image: {:?}", cli.input))?;

    let Some(public_key) = public_key else {
        warning!("Image is not signed");
        return Ok(());
    };

    let blob = avb::encode_public_key(&public_key).context("Failed to encode public key")?;
    let fingerprint = crypto::avb_key_fingerprint(&blob);

    if let Some(path) = &cli.public_key {
        let expected = crypto::read_pem_public_key_file(path)
            .with_context(|| format!("Failed to load public key: {path:?}"))?;

        if expected != public_key {
            bail!("Image is signed by {fingerprint}, which does not match {path:?}");
        }
    }

    status!("Signature is valid: {fingerprint}");

    Ok(())
}

fn resign_subcommand(
    cli: &ResignCli,
    config_group: &ConfigGroup,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let config = config_group.load()?;
    let keys = config_group.key_ring(&config)?;
    let image = args::read_image(&cli.input)?;
    let header = image.header().context("Image has no vbmeta header")?;

    let key = match cli.algorithm {
        AlgorithmArg::Unsigned => None,
        AlgorithmArg::Keep => sign::select_key(&keys, header, cli.fallback)?,
        AlgorithmArg::FromKey => keys.for_avb_key_or_fallback(&header.public_key),
    };
    let policy = AlgorithmPolicy::from(cli.algorithm);

    let new_image = match image.kind() {
        ImageKind::Vbmeta => {
            let contents = read_contents(&cli.partition)?;
            sign::resign_image(&image, &contents, key, policy, cancel_signal)
        }
        ImageKind::Appended => {
            sign::seal_appended(&image, image.payload().to_vec(), key, policy, cancel_signal)
        }
        ImageKind::Raw => bail!("Image has no AVB metadata: {:?}", cli.input),
    }
    .with_context(|| format!("Failed to re-sign image: {:?}", cli.input))?;

    args::write_file(&cli.output, new_image.serialize())?;
    status!("Wrote {:?}", cli.output);

    Ok(())
}

pub fn avb_main(cli: &AvbCli, config: &ConfigGroup, cancel_signal: &AtomicBool) -> Result<()> {
    match &cli.command {
        AvbCommand::Info(c) => info_subcommand(c),
        AvbCommand::Verify(c) => verify_subcommand(c, cancel_signal),
        AvbCommand::Resign(c) => resign_subcommand(c, config, cancel_signal),
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
enum AlgorithmArg {
    /// Keep the existing algorithm. Unsigned images stay unsigned.
    #[default]
    Keep,
    /// Pick the algorithm that matches the signing key.
    FromKey,
    /// Remove the signature.
    Unsigned,
}

impl From<AlgorithmArg> for AlgorithmPolicy {
    fn from(value: AlgorithmArg) -> Self {
        match value {
            AlgorithmArg::Keep => Self::Keep,
            AlgorithmArg::FromKey => Self::FromKey,
            AlgorithmArg::Unsigned => Self::Unsigned,
        }
    }
}

/// Display AVB header and footer information.
#[derive(Debug, Parser)]
struct InfoCli {
    /// Path to input AVB image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,
}

/// Verify the vbmeta signature and descriptor digests.
///
/// For appended images, the image's own payload is checked. For vbmeta
/// images, only the descriptors of partitions passed via --partition are
/// checked.
#[derive(Debug, Parser)]
struct VerifyCli {
    /// Path to input AVB image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to the expected public key in PEM format.
    #[arg(short, long, value_name = "FILE", value_parser)]
    public_key: Option<PathBuf>,

    /// Partition contents to check against the vbmeta descriptors.
    #[arg(long, value_name = "NAME=FILE", value_parser = args::parse_named_path)]
    partition: Vec<(String, PathBuf)>,
}

/// Recompute digests and re-sign an image.
///
/// The signing key is selected from the configured key ring by the public
/// key embedded in the image.
#[derive(Debug, Parser)]
struct ResignCli {
    /// Path to input AVB image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output AVB image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    /// Partition contents whose digests are updated in a vbmeta image.
    #[arg(long, value_name = "NAME=FILE", value_parser = args::parse_named_path)]
    partition: Vec<(String, PathBuf)>,

    /// Signature algorithm handling.
    #[arg(long, value_name = "POLICY", value_enum, default_value_t)]
    algorithm: AlgorithmArg,

    /// Use the fallback boot key if no key matches the image.
    #[arg(long)]
    fallback: bool,
}

#[derive(Debug, Subcommand)]
enum AvbCommand {
    Info(InfoCli),
    Verify(VerifyCli),
    Resign(ResignCli),
}

/// Inspect, verify, and re-sign AVB images.
#[derive(Debug, Parser)]
pub struct AvbCli {
    #[command(subcommand)]
    command: AvbCommand,
}
