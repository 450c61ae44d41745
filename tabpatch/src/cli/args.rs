// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-FileCopyrightText: 2026 tabpatch contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use tracing::Level;

use crate::{
    cli::{arb, avb, device, kernel, plan, region, task, xml},
    config::Config,
    crypto::{self, KeyRing, PassphraseSource},
    format::image::PartitionImage,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

#[derive(Debug, Args)]
pub struct ConfigGroup {
    /// Path to configuration TOML.
    ///
    /// Values in this file override the built-in defaults. Relative key paths
    /// are resolved against the directory containing the file.
    #[arg(long, global = true, value_name = "FILE", value_parser)]
    pub config: Option<PathBuf>,

    /// Additional private key for signing.
    ///
    /// The key is used for any image whose embedded public key matches it.
    #[arg(long, global = true, value_name = "FILE", value_parser)]
    pub key: Vec<PathBuf>,
}

impl ConfigGroup {
    pub fn load(&self) -> Result<Config> {
        match &self.config {
            Some(path) => {
                Config::load(path).with_context(|| format!("Failed to load config: {path:?}"))
            }
            None => Config::builtin().context("Failed to load built-in config"),
        }
    }

    pub fn key_ring(&self, config: &Config) -> Result<KeyRing> {
        let base_dir = self
            .config
            .as_deref()
            .and_then(Path::parent)
            .unwrap_or(Path::new("."));

        let mut keys = config
            .key_ring(base_dir)
            .context("Failed to load configured signing keys")?;

        for path in &self.key {
            let key = crypto::read_pem_key_file(path, &PassphraseSource::None)
                .with_context(|| format!("Failed to load key: {path:?}"))?;
            let fingerprint = keys
                .insert(key)
                .with_context(|| format!("Failed to compute key fingerprint: {path:?}"))?;
            tracing::debug!("Added key {fingerprint} from {path:?}");
        }

        Ok(keys)
    }
}

/// Parse a `NAME=FILE` argument.
pub fn parse_named_path(arg: &str) -> Result<(String, PathBuf)> {
    let (name, path) = arg
        .split_once('=')
        .ok_or_else(|| anyhow!("Expected NAME=FILE: {arg:?}"))?;

    Ok((name.to_owned(), PathBuf::from(path)))
}

pub fn read_image(path: &Path) -> Result<PartitionImage> {
    let data = fs::read(path).with_context(|| format!("Failed to read image: {path:?}"))?;

    PartitionImage::parse(data).with_context(|| format!("Failed to parse image: {path:?}"))
}

pub fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    fs::write(path, data).with_context(|| format!("Failed to write file: {path:?}"))
}

/// Generate shell tab completion configs.
#[derive(Debug, Parser)]
pub struct CompletionCli {
    /// The shell to generate completions for.
    #[arg(short, long, value_name = "SHELL", value_parser)]
    pub shell: Shell,
}

#[allow(clippy::large_enum_variant)]
#[derive(Debug, Subcommand)]
pub enum Command {
    Arb(arb::ArbCli),
    Avb(avb::AvbCli),
    Completion(CompletionCli),
    Device(device::DeviceCli),
    Kernel(kernel::KernelCli),
    Plan(plan::PlanCli),
    Region(region::RegionCli),
    Task(task::TaskCli),
    Xml(xml::XmlCli),
}

#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Lowest log message severity to output.
    #[arg(long, global = true, value_name = "LEVEL", value_enum, default_value_t)]
    pub log_level: LogLevel,

    #[command(flatten)]
    pub config: ConfigGroup,
}

pub fn main(logging_initialized: &AtomicBool, cancel_signal: &Arc<AtomicBool>) -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(Level::from(cli.log_level))
        .init();
    logging_initialized.store(true, Ordering::SeqCst);

    match cli.command {
        Command::Arb(c) => arb::arb_main(&c, &cli.config, cancel_signal),
        Command::Avb(c) => avb::avb_main(&c, &cli.config, cancel_signal),
        Command::Completion(c) => {
            clap_complete::generate(
                c.shell,
                &mut Cli::command(),
                env!("CARGO_PKG_NAME"),
                &mut io::stdout(),
            );
            Ok(())
        }
        Command::Device(c) => device::device_main(&c, &cli.config),
        Command::Kernel(c) => kernel::kernel_main(&c, &cli.config, cancel_signal),
        Command::Plan(c) => plan::plan_main(&c, &cli.config, cancel_signal),
        Command::Region(c) => region::region_main(&c, &cli.config, cancel_signal),
        Command::Task(c) => task::task_main(&c, &cli.config, cancel_signal),
        Command::Xml(c) => xml::xml_main(&c),
    }
}
