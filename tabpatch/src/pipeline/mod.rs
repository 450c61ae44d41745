// SPDX-FileCopyrightText: 2026 tabpatch contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Tasks composed from the patching and device layers. Every task checks its
//! inputs before touching the device and writes its outputs through a
//! staging directory that is only promoted once the stage succeeds.

use std::{
    collections::BTreeMap,
    error::Error as _,
    fmt::Write as _,
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, atomic::AtomicBool},
};

use thiserror::Error;
use tracing::{debug, debug_span, info, warn};

use crate::{
    config::Config,
    crypto::KeyRing,
    device::{self, DeviceSession, PartitionTable, SerialTransport, Transport},
    format::{
        avb::Header,
        image::{self, PartitionImage},
        rawprogram::{self, ProgramEntry},
    },
    patch::{
        kernel,
        region::{self, ConvertOutcome, RegionPatcher},
        rollback::{self, ArbEntry},
        sign::{self, AlgorithmPolicy},
    },
    plan::{self, FlashPlan, ImageSet, ImageSource},
    stream,
};

pub mod task;
pub mod workspace;

pub use task::{Status, Task, TaskReport, TaskSettings};
pub use workspace::{StagedDir, WorkDir, Workspace};

const VENDOR_BOOT: &str = "vendor_boot";
const VBMETA: &str = "vbmeta";
const VBMETA_SYSTEM: &str = "vbmeta_system";
const BOOT: &str = "boot";
const DEVINFO: &str = "devinfo";
const PERSIST: &str = "persist";
const KERNEL: &str = "Image";

/// Partitions restored by the rescue task.
const RESCUE_PARTITIONS: [&str; 4] = [DEVINFO, PERSIST, BOOT, VBMETA_SYSTEM];

#[derive(Debug, Error)]
pub enum Error {
    #[error("Required input not found: {0:?}")]
    MissingInput(PathBuf),
    #[error("Setting is required for this task: {0}")]
    MissingSetting(&'static str),
    #[error("Failed to parse image: {0:?}")]
    Parse(PathBuf, #[source] image::Error),
    #[error("Image error")]
    Image(#[from] image::Error),
    #[error("Signing error")]
    Sign(#[from] sign::Error),
    #[error("Region patch error")]
    Region(#[from] region::Error),
    #[error("Rollback index error")]
    Rollback(#[from] rollback::Error),
    #[error("Kernel replacement error")]
    Kernel(#[from] kernel::Error),
    #[error("Invalid program XML: {0:?}")]
    RawProgram(PathBuf, #[source] rawprogram::Error),
    #[error("Device error")]
    Device(#[from] device::Error),
    #[error("I/O error: {0:?}")]
    Io(PathBuf, #[source] io::Error),
    #[error("Cancelled by user")]
    Cancelled,
}

impl From<workspace::Error> for Error {
    fn from(value: workspace::Error) -> Self {
        match value {
            workspace::Error::MissingInput(p) => Self::MissingInput(p),
            workspace::Error::Io(p, e) => Self::Io(p, e),
        }
    }
}

fn sign_status(error: &sign::Error) -> Status {
    match error {
        sign::Error::Image(_) | sign::Error::Descriptor(..) => Status::FormatError,
        _ => Status::SignatureError,
    }
}

impl Error {
    /// How the error is reported to the operator.
    pub fn status(&self) -> Status {
        match self {
            Self::MissingInput(_) | Self::MissingSetting(_) => Status::InputMissing,
            Self::Parse(..) | Self::Image(_) | Self::Region(_) | Self::RawProgram(..) => {
                Status::FormatError
            }
            Self::Sign(e)
            | Self::Rollback(rollback::Error::Sign(e))
            | Self::Kernel(kernel::Error::Sign(e)) => sign_status(e),
            Self::Rollback(_) | Self::Kernel(_) => Status::FormatError,
            Self::Device(_) | Self::Cancelled => Status::DeviceError,
            Self::Io(_, e) if e.kind() == io::ErrorKind::NotFound => Status::InputMissing,
            Self::Io(..) => Status::FormatError,
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

/// An error tagged with the stage it happened in.
#[derive(Debug)]
struct Failure {
    stage: &'static str,
    error: Error,
}

type StageResult<T> = std::result::Result<T, Failure>;

fn stage<T>(name: &'static str, f: impl FnOnce() -> Result<T>) -> StageResult<T> {
    let _span = debug_span!("stage", name).entered();
    debug!("Starting stage");

    f().map_err(|error| Failure { stage: name, error })
}

/// Error message including every source.
fn error_chain(error: &Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();

    while let Some(e) = source {
        let _ = write!(message, ": {e}");
        source = e.source();
    }

    message
}

fn header(img: &PartitionImage) -> Result<&Header> {
    Ok(img.header().ok_or(image::Error::NoHeader)?)
}

/// Swap the region patterns in vendor_boot, re-seal it, and update its digest
/// in vbmeta. Both images are returned as-is if vendor_boot is already
/// converted.
pub fn convert_images(
    patcher: &RegionPatcher,
    keys: &KeyRing,
    vendor_boot: PartitionImage,
    vbmeta: PartitionImage,
    cancel_signal: &AtomicBool,
) -> Result<(PartitionImage, PartitionImage, ConvertOutcome)> {
    let (payload, outcome) = patcher.convert_rom(vendor_boot.payload().to_vec())?;
    if outcome == ConvertOutcome::AlreadyConverted {
        info!("vendor_boot is already converted");
        return Ok((vendor_boot, vbmeta, outcome));
    }

    let key = sign::select_key(keys, header(&vendor_boot)?, true)?;
    let new_vendor_boot =
        sign::seal_appended(&vendor_boot, payload, key, AlgorithmPolicy::Keep, cancel_signal)?;

    let key = sign::select_key(keys, header(&vbmeta)?, false)?;
    let contents = BTreeMap::from([(VENDOR_BOOT.to_owned(), new_vendor_boot.payload())]);
    let new_vbmeta =
        sign::resign_image(&vbmeta, &contents, key, AlgorithmPolicy::Keep, cancel_signal)?;

    Ok((new_vendor_boot, new_vbmeta, outcome))
}

/// Produces a fresh transport for each device session.
pub trait Connector {
    fn connect(&mut self) -> Box<dyn Transport>;
}

impl<F: FnMut() -> Box<dyn Transport>> Connector for F {
    fn connect(&mut self) -> Box<dyn Transport> {
        self()
    }
}

/// Connects to the 9008 serial port.
#[derive(Clone, Debug, Default)]
pub struct SerialConnector {
    pub port: Option<String>,
}

impl Connector for SerialConnector {
    fn connect(&mut self) -> Box<dyn Transport> {
        Box::new(SerialTransport::new(self.port.clone()))
    }
}

type Session = DeviceSession<Box<dyn Transport>>;

#[derive(Debug, Default)]
struct Outcome {
    detail: String,
    outputs: Vec<PathBuf>,
}

pub struct Pipeline {
    workspace: Workspace,
    config: Config,
    keys: KeyRing,
    settings: TaskSettings,
    cancel_signal: Arc<AtomicBool>,
}

impl Pipeline {
    pub fn new(
        workspace: Workspace,
        config: Config,
        keys: KeyRing,
        settings: TaskSettings,
        cancel_signal: Arc<AtomicBool>,
    ) -> Self {
        Self {
            workspace,
            config,
            keys,
            settings,
            cancel_signal,
        }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn settings(&self) -> &TaskSettings {
        &self.settings
    }

    /// Run a task to completion or to its first failure. Offline tasks never
    /// call `connector`.
    pub fn run(&self, task: Task, connector: &mut dyn Connector) -> TaskReport {
        let _span = debug_span!("task", %task).entered();
        info!("Running task: {task}");

        let result = match task {
            Task::ConvertRegion => self.convert_region(),
            Task::ModifyXml => self.modify_xml(self.settings.wipe),
            Task::PatchDevinfo => self.patch_devinfo(),
            Task::ArbBypass => self.arb_bypass(),
            Task::Root => self.root(),
            Task::Dump => self.dump(connector),
            Task::Flash => self.flash(connector),
            Task::Install => self.full(connector, true),
            Task::Update => self.full(connector, false),
            Task::Rescue => self.rescue(connector),
        };

        match result {
            Ok(outcome) => {
                info!("Task {task} succeeded: {}", outcome.detail);

                TaskReport {
                    task,
                    status: Status::Success,
                    stage: None,
                    detail: outcome.detail,
                    outputs: outcome.outputs,
                }
            }
            Err(failure) => {
                let detail = error_chain(&failure.error);
                warn!("Task {task} failed in stage {}: {detail}", failure.stage);

                TaskReport {
                    task,
                    status: failure.error.status(),
                    stage: Some(failure.stage.to_owned()),
                    detail,
                    outputs: vec![],
                }
            }
        }
    }

    /// The flash plan the flash task would execute with the current
    /// settings.
    pub fn plan(&self) -> std::result::Result<FlashPlan, Error> {
        let entries = self.program_entries()?;
        self.flash_plan(&entries, self.settings.wipe)
    }

    fn require_all(&self, inputs: &[(WorkDir, &str)]) -> Result<()> {
        for (dir, name) in inputs {
            self.workspace.require(*dir, name)?;
        }

        Ok(())
    }

    fn load_image(&self, dir: WorkDir, name: &str) -> Result<PartitionImage> {
        let data = self.workspace.read(dir, name)?;

        PartitionImage::parse(data).map_err(|e| Error::Parse(self.workspace.file(dir, name), e))
    }

    fn check_cancel(&self) -> Result<()> {
        stream::check_cancel(&self.cancel_signal).map_err(|_| Error::Cancelled)
    }

    fn convert_region(&self) -> StageResult<Outcome> {
        let vendor_boot_name = format!("{VENDOR_BOOT}.img");
        let vbmeta_name = format!("{VBMETA}.img");

        stage("inputs", || {
            self.require_all(&[
                (WorkDir::Image, vendor_boot_name.as_str()),
                (WorkDir::Image, vbmeta_name.as_str()),
            ])
        })?;

        let (vendor_boot, vbmeta) = stage("load", || {
            Ok((
                self.load_image(WorkDir::Image, &vendor_boot_name)?,
                self.load_image(WorkDir::Image, &vbmeta_name)?,
            ))
        })?;

        let patcher = self.config.region_patcher();
        let (vendor_boot, vbmeta, outcome) = stage("convert", || {
            convert_images(&patcher, &self.keys, vendor_boot, vbmeta, &self.cancel_signal)
        })?;

        let detail = match outcome {
            ConvertOutcome::AlreadyConverted => "Already converted".to_owned(),
            ConvertOutcome::Converted { count } => format!("Replaced {count} region patterns"),
        };

        let outputs = stage("write", || {
            let staged = self.workspace.stage(WorkDir::Output)?;
            let outputs = vec![
                staged.write(&vendor_boot_name, vendor_boot.serialize())?,
                staged.write(&vbmeta_name, vbmeta.serialize())?,
            ];
            staged.commit()?;

            Ok(outputs)
        })?;

        Ok(Outcome { detail, outputs })
    }

    fn modify_xml(&self, wipe: bool) -> StageResult<Outcome> {
        let (encrypted, plain) = stage("inputs", || {
            let encrypted = self.workspace.list(WorkDir::Image, "", ".x")?;
            let mut plain = self.workspace.list(WorkDir::Image, "rawprogram", ".xml")?;
            plain.extend(self.workspace.list(WorkDir::Image, "patch", ".xml")?);

            if encrypted.is_empty() && plain.is_empty() {
                return Err(Error::MissingInput(
                    self.workspace.file(WorkDir::Image, "rawprogram*.xml"),
                ));
            }

            Ok((encrypted, plain))
        })?;

        let documents = stage("decrypt", || {
            let mut documents = BTreeMap::<String, String>::new();

            for path in &plain {
                let xml = fs::read_to_string(path).map_err(|e| Error::Io(path.clone(), e))?;
                documents.insert(file_name(path), xml);
            }

            for path in &encrypted {
                self.check_cancel()?;

                let data = fs::read(path).map_err(|e| Error::Io(path.clone(), e))?;
                let xml = rawprogram::decrypt_x(&data)
                    .and_then(|d| {
                        String::from_utf8(d).map_err(|e| {
                            rawprogram::Error::Io(io::Error::new(io::ErrorKind::InvalidData, e))
                        })
                    })
                    .map_err(|e| Error::RawProgram(path.clone(), e))?;

                let name = Path::new(&file_name(path))
                    .with_extension("xml")
                    .to_string_lossy()
                    .into_owned();
                debug!("Decrypted {path:?} to {name:?}");
                documents.insert(name, xml);
            }

            Ok(documents)
        })?;

        let (documents, blanked) = stage("rewrite", || {
            let mut result = BTreeMap::new();
            let mut blanked = 0;

            for (name, xml) in documents {
                let path = self.workspace.file(WorkDir::OutputXml, &name);

                let xml = if name.starts_with("rawprogram") {
                    rawprogram::parse(&xml).map_err(|e| Error::RawProgram(path.clone(), e))?;

                    if wipe {
                        xml
                    } else {
                        let (xml, n) = rawprogram::strip_wipe(&xml)
                            .map_err(|e| Error::RawProgram(path.clone(), e))?;
                        blanked += n;
                        xml
                    }
                } else {
                    xml
                };

                result.insert(name, xml);
            }

            Ok((result, blanked))
        })?;

        let outputs = stage("write", || {
            let staged = self.workspace.stage(WorkDir::OutputXml)?;
            let mut outputs = vec![];

            for (name, xml) in &documents {
                outputs.push(staged.write(name, xml.as_bytes())?);
            }

            staged.commit()?;

            Ok(outputs)
        })?;

        Ok(Outcome {
            detail: format!(
                "Wrote {} XML files, skipped {blanked} user data entries",
                outputs.len(),
            ),
            outputs,
        })
    }

    fn patch_devinfo(&self) -> StageResult<Outcome> {
        let (target, inputs) = stage("inputs", || {
            let target = self.settings.region.ok_or(Error::MissingSetting("region"))?;

            let mut inputs = vec![];
            for name in [DEVINFO, PERSIST] {
                if let Some(data) = self
                    .workspace
                    .read_optional(WorkDir::Backup, &format!("{name}.img"))?
                {
                    inputs.push((name, data));
                }
            }

            if inputs.is_empty() {
                return Err(Error::MissingInput(
                    self.workspace.file(WorkDir::Backup, &format!("{DEVINFO}.img")),
                ));
            }

            Ok((target, inputs))
        })?;

        let patcher = self.config.region_patcher();

        let patches = stage("patch", || {
            let mut patches = vec![];
            let mut last_error = None;

            for (name, data) in inputs {
                match patcher.patch_region(data, target) {
                    Ok(patch) => {
                        info!(
                            "{name}: {} -> {} ({} records)",
                            patch.previous, patch.target, patch.count,
                        );
                        patches.push((name, patch));
                    }
                    Err(
                        e @ (region::Error::PatternNotFound { .. } | region::Error::NoLayout),
                    ) => {
                        warn!("{name}: {e}");
                        last_error = Some(e);
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            match (patches.is_empty(), last_error) {
                (true, Some(e)) => Err(e.into()),
                _ => Ok(patches),
            }
        })?;

        let outputs = stage("write", || {
            let staged = self.workspace.stage(WorkDir::OutputDp)?;
            let mut outputs = vec![];

            for (name, patch) in &patches {
                outputs.push(staged.write(&format!("{name}.img"), &patch.data)?);
            }

            staged.commit()?;

            Ok(outputs)
        })?;

        let detail = patches
            .iter()
            .map(|(name, p)| format!("{name}: {} -> {}", p.previous, p.target))
            .collect::<Vec<_>>()
            .join(", ");

        Ok(Outcome { detail, outputs })
    }

    fn arb_bypass(&self) -> StageResult<Outcome> {
        let boot_name = format!("{BOOT}.img");
        let vbmeta_name = format!("{VBMETA_SYSTEM}.img");

        stage("inputs", || {
            self.require_all(&[
                (WorkDir::Backup, boot_name.as_str()),
                (WorkDir::Backup, vbmeta_name.as_str()),
                (WorkDir::Image, boot_name.as_str()),
                (WorkDir::Image, vbmeta_name.as_str()),
            ])
        })?;

        let (current_boot, current_vbmeta, new_boot, new_vbmeta) = stage("load", || {
            Ok((
                self.load_image(WorkDir::Backup, &boot_name)?,
                self.load_image(WorkDir::Backup, &vbmeta_name)?,
                self.load_image(WorkDir::Image, &boot_name)?,
                self.load_image(WorkDir::Image, &vbmeta_name)?,
            ))
        })?;

        let status = stage("status", || {
            let entries = [
                ArbEntry {
                    partition: BOOT.to_owned(),
                    current: header(&current_boot)?.rollback_index,
                    new: Some(header(&new_boot)?.rollback_index),
                },
                ArbEntry {
                    partition: VBMETA_SYSTEM.to_owned(),
                    current: header(&current_vbmeta)?.rollback_index,
                    new: Some(header(&new_vbmeta)?.rollback_index),
                },
            ];

            for e in &entries {
                info!(
                    "{}: device index {}, new index {:?}",
                    e.partition, e.current, e.new,
                );
            }

            Ok(rollback::status(&entries))
        })?;

        let mode = self.settings.rollback_mode;

        let (boot, vbmeta) = stage("sync", || {
            let boot = self.sync_one(&current_boot, new_boot, true)?;
            let vbmeta = self.sync_one(&current_vbmeta, new_vbmeta, false)?;

            Ok((boot, vbmeta))
        })?;

        let outputs = stage("write", || {
            let staged = self.workspace.stage(WorkDir::OutputAntiRollback)?;
            let outputs = vec![
                staged.write(&boot_name, boot.serialize())?,
                staged.write(&vbmeta_name, vbmeta.serialize())?,
            ];
            staged.commit()?;

            Ok(outputs)
        })?;

        Ok(Outcome {
            detail: format!("Status {status:?}, mode {mode:?}"),
            outputs,
        })
    }

    /// Sync one image. A key is only looked up if the index has to change.
    fn sync_one(
        &self,
        current: &PartitionImage,
        new: PartitionImage,
        use_fallback: bool,
    ) -> Result<PartitionImage> {
        let mode = self.settings.rollback_mode;
        let new_header = header(&new)?;
        let index = rollback::target_index(
            header(current)?.rollback_index,
            new_header.rollback_index,
            mode,
        )?;

        let key = if index != new_header.rollback_index {
            sign::select_key(&self.keys, new_header, use_fallback)?
        } else {
            None
        };

        let (image, outcome) =
            rollback::sync_image(current, new, mode, key, &self.cancel_signal)?;
        debug!(
            "Rollback index {} -> {} (changed: {})",
            outcome.previous, outcome.index, outcome.changed,
        );

        Ok(image)
    }

    fn root(&self) -> StageResult<Outcome> {
        let boot_name = format!("{BOOT}.img");

        stage("inputs", || {
            self.require_all(&[
                (WorkDir::InputRoot, boot_name.as_str()),
                (WorkDir::InputRoot, KERNEL),
            ])
        })?;

        let (boot, new_kernel) = stage("load", || {
            Ok((
                self.load_image(WorkDir::InputRoot, &boot_name)?,
                self.workspace.read(WorkDir::InputRoot, KERNEL)?,
            ))
        })?;

        let version = kernel::kernel_version(&new_kernel);

        let patched = stage("replace", || {
            let key = match boot.header() {
                Some(h) => sign::select_key(&self.keys, h, true)?,
                None => None,
            };

            Ok(kernel::replace_kernel(
                &boot,
                new_kernel,
                key,
                AlgorithmPolicy::Keep,
                &self.cancel_signal,
            )?)
        })?;

        let outputs = stage("write", || {
            let staged = self.workspace.stage(WorkDir::OutputRoot)?;
            let outputs = vec![staged.write(&boot_name, patched.serialize())?];
            staged.commit()?;

            Ok(outputs)
        })?;

        Ok(Outcome {
            detail: format!(
                "Installed kernel {}",
                version.as_deref().unwrap_or("(unknown version)"),
            ),
            outputs,
        })
    }

    /// Program XML entries. Rewritten files in `output_xml/` take precedence
    /// over those in `image/`.
    fn program_entries(&self) -> Result<Vec<ProgramEntry>> {
        let mut files = self
            .workspace
            .list(WorkDir::OutputXml, "rawprogram", ".xml")?;
        if files.is_empty() {
            files = self.workspace.list(WorkDir::Image, "rawprogram", ".xml")?;
        }
        if files.is_empty() {
            return Err(Error::MissingInput(
                self.workspace.file(WorkDir::Image, "rawprogram*.xml"),
            ));
        }

        let mut entries = vec![];

        for path in files {
            let xml = fs::read_to_string(&path).map_err(|e| Error::Io(path.clone(), e))?;
            let parsed = rawprogram::parse(&xml).map_err(|e| Error::RawProgram(path.clone(), e))?;
            debug!("Loaded {} entries from {path:?}", parsed.len());
            entries.extend(parsed);
        }

        Ok(entries)
    }

    /// Loader and program entries needed by every device task.
    fn device_inputs(&self) -> Result<(Vec<u8>, Vec<ProgramEntry>)> {
        let loader = self.workspace.read(WorkDir::Image, &self.config.device.loader)?;
        let entries = self.program_entries()?;

        Ok((loader, entries))
    }

    fn open_session(
        &self,
        connector: &mut dyn Connector,
        loader: &[u8],
        entries: &[ProgramEntry],
    ) -> Result<Session> {
        let mut params = self
            .config
            .session_params(PartitionTable::from_entries(entries));
        if let Some(slot) = &self.settings.slot {
            params.slot = Some(slot.clone());
        }

        Ok(DeviceSession::open(connector.connect(), loader, params)?)
    }

    /// Dump partitions into `backup/`. Partitions missing from the partition
    /// table are skipped.
    fn dump_with(&self, session: &mut Session, targets: &[&str]) -> Result<Vec<PathBuf>> {
        let staged = self.workspace.stage(WorkDir::Backup)?;
        let mut outputs = vec![];

        for target in targets {
            self.check_cancel()?;

            let data = match session.read_partition(target) {
                Ok(d) => d,
                Err(device::Error::UnknownPartition(p)) => {
                    warn!("Skipping {p:?}: not in partition table");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            outputs.push(staged.write(&format!("{target}.img"), &data)?);
        }

        staged.commit_merge()?;

        Ok(outputs)
    }

    fn dump_targets(&self, devinfo: bool) -> Vec<&'static str> {
        let mut targets = vec![];
        if devinfo {
            targets.extend([DEVINFO, PERSIST]);
        }
        if !self.settings.skip_rollback {
            targets.extend([BOOT, VBMETA_SYSTEM]);
        }

        targets
    }

    fn dump(&self, connector: &mut dyn Connector) -> StageResult<Outcome> {
        let (loader, entries) = stage("inputs", || self.device_inputs())?;
        let mut session = stage("connect", || self.open_session(connector, &loader, &entries))?;

        let targets = self.dump_targets(true);
        let outputs = stage("dump", || self.dump_with(&mut session, &targets))?;

        if self.settings.reset_after {
            stage("reset", || Ok(session.reset()?))?;
        }

        Ok(Outcome {
            detail: format!("Dumped {} partitions", outputs.len()),
            outputs,
        })
    }

    /// Find the file to flash for `filename`. Patched outputs take
    /// precedence over the firmware set.
    fn resolve_flash_file(&self, filename: &str, wipe: bool) -> Option<PathBuf> {
        let name = Path::new(filename).file_name()?.to_str()?;

        let mut dirs = vec![];
        if wipe {
            dirs.push(WorkDir::OutputDp);
        }
        dirs.extend([
            WorkDir::OutputAntiRollback,
            WorkDir::Output,
            WorkDir::Image,
        ]);

        dirs.into_iter()
            .map(|d| self.workspace.file(d, name))
            .find(|p| p.is_file())
    }

    fn flash_plan(&self, entries: &[ProgramEntry], wipe: bool) -> Result<FlashPlan> {
        let mut set = ImageSet::from_program(entries, |f| self.resolve_flash_file(f, wipe));

        // The program XML does not write devinfo and persist, so patched
        // copies are added explicitly.
        if wipe {
            let table = PartitionTable::from_entries(entries);

            for name in [DEVINFO, PERSIST] {
                let path = self.workspace.file(WorkDir::OutputDp, &format!("{name}.img"));
                if !path.is_file() {
                    continue;
                }

                let location = table.resolve(name, self.settings.slot.as_deref());
                set.insert(
                    name,
                    ImageSource {
                        path,
                        lun: location.map(|(_, l)| l.lun),
                        start_sector: location.map(|(_, l)| l.start_sector),
                    },
                );
            }
        }

        if set.is_empty() {
            return Err(Error::MissingInput(self.workspace.file(WorkDir::Image, "*.img")));
        }

        Ok(plan::build(&set, wipe))
    }

    fn flash_with(&self, session: &mut Session, plan: &FlashPlan) -> Result<Vec<PathBuf>> {
        let mut written = vec![];

        for entry in &plan.entries {
            self.check_cancel()?;

            let data = fs::read(&entry.source).map_err(|e| Error::Io(entry.source.clone(), e))?;
            session.write_partition(&entry.partition, &data)?;
            written.push(entry.source.clone());
        }

        Ok(written)
    }

    fn flash(&self, connector: &mut dyn Connector) -> StageResult<Outcome> {
        let wipe = self.settings.wipe;

        let (loader, entries, plan) = stage("inputs", || {
            let (loader, entries) = self.device_inputs()?;
            let plan = self.flash_plan(&entries, wipe)?;

            Ok((loader, entries, plan))
        })?;

        let mut session = stage("connect", || self.open_session(connector, &loader, &entries))?;
        let written = stage("flash", || self.flash_with(&mut session, &plan))?;

        if self.settings.reset_after {
            stage("reset", || Ok(session.reset()?))?;
        }

        Ok(Outcome {
            detail: format!("Flashed {} partitions", written.len()),
            outputs: vec![],
        })
    }

    /// Install and update: convert, dump, patch, and flash with one session.
    fn full(&self, connector: &mut dyn Connector, wipe: bool) -> StageResult<Outcome> {
        // Everything read from the workspace is checked here. Only the dumps
        // in backup/ may appear after connecting.
        stage("inputs", || {
            let vendor_boot_name = format!("{VENDOR_BOOT}.img");
            let vbmeta_name = format!("{VBMETA}.img");
            let boot_name = format!("{BOOT}.img");
            let vbmeta_system_name = format!("{VBMETA_SYSTEM}.img");

            let mut required = vec![
                (WorkDir::Image, vendor_boot_name.as_str()),
                (WorkDir::Image, vbmeta_name.as_str()),
                (WorkDir::Image, self.config.device.loader.as_str()),
            ];
            if !self.settings.skip_rollback {
                required.extend([
                    (WorkDir::Image, boot_name.as_str()),
                    (WorkDir::Image, vbmeta_system_name.as_str()),
                ]);
            }

            self.require_all(&required)
        })?;

        stage("clean", || Ok(self.workspace.clean_outputs()?))?;

        let mut outputs = vec![];
        outputs.extend(self.convert_region()?.outputs);
        outputs.extend(self.modify_xml(wipe)?.outputs);

        let (loader, entries) = stage("inputs", || self.device_inputs())?;
        let mut session = stage("connect", || self.open_session(connector, &loader, &entries))?;

        let patch_dp = wipe && self.settings.region.is_some();
        if wipe && !patch_dp {
            info!("No region selected; devinfo and persist are left unchanged");
        }

        let targets = self.dump_targets(patch_dp);
        if !targets.is_empty() {
            outputs.extend(stage("dump", || self.dump_with(&mut session, &targets))?);
        }

        if patch_dp {
            outputs.extend(self.patch_devinfo()?.outputs);
        }
        if !self.settings.skip_rollback {
            outputs.extend(self.arb_bypass()?.outputs);
        }

        let plan = stage("plan", || self.flash_plan(&entries, wipe))?;
        let written = stage("flash", || self.flash_with(&mut session, &plan))?;

        if self.settings.reset_after {
            stage("reset", || Ok(session.reset()?))?;
        }

        Ok(Outcome {
            detail: format!("Flashed {} partitions (wipe: {wipe})", written.len()),
            outputs,
        })
    }

    fn rescue(&self, connector: &mut dyn Connector) -> StageResult<Outcome> {
        let (loader, entries, images) = stage("inputs", || {
            let mut images = vec![];
            for name in RESCUE_PARTITIONS {
                if let Some(data) = self
                    .workspace
                    .read_optional(WorkDir::Backup, &format!("{name}.img"))?
                {
                    images.push((name, data));
                }
            }

            if images.is_empty() {
                return Err(Error::MissingInput(
                    self.workspace.file(WorkDir::Backup, &format!("{DEVINFO}.img")),
                ));
            }

            let (loader, entries) = self.device_inputs()?;

            Ok((loader, entries, images))
        })?;

        let mut session = stage("connect", || self.open_session(connector, &loader, &entries))?;

        stage("write", || {
            for (name, data) in &images {
                self.check_cancel()?;
                session.write_partition(name, data)?;
            }

            Ok(())
        })?;

        if self.settings.reset_after {
            stage("reset", || Ok(session.reset()?))?;
        }

        Ok(Outcome {
            detail: format!(
                "Restored {}",
                images
                    .iter()
                    .map(|(n, _)| *n)
                    .collect::<Vec<_>>()
                    .join(", "),
            ),
            outputs: vec![],
        })
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
