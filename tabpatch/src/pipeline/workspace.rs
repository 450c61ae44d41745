// SPDX-FileCopyrightText: 2026 tabpatch contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
};

use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Required input not found: {0:?}")]
    MissingInput(PathBuf),
    #[error("I/O error: {0:?}")]
    Io(PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Well-known directories inside a workspace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WorkDir {
    /// Flash-ready firmware set.
    Image,
    /// Raw partition dumps.
    Backup,
    /// Operator-supplied boot image and kernel.
    InputRoot,
    /// Region converted vendor_boot and vbmeta.
    Output,
    /// Patched devinfo and persist.
    OutputDp,
    /// Rollback index synced boot and vbmeta_system.
    OutputAntiRollback,
    /// Rooted boot image.
    OutputRoot,
    /// Decrypted and rewritten program XML.
    OutputXml,
}

impl WorkDir {
    pub const OUTPUTS: [Self; 5] = [
        Self::Output,
        Self::OutputDp,
        Self::OutputAntiRollback,
        Self::OutputRoot,
        Self::OutputXml,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Backup => "backup",
            Self::InputRoot => "input_root",
            Self::Output => "output",
            Self::OutputDp => "output_dp",
            Self::OutputAntiRollback => "output_anti_rollback",
            Self::OutputRoot => "output_root",
            Self::OutputXml => "output_xml",
        }
    }
}

impl fmt::Display for WorkDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> Error + '_ {
    move |e| Error::Io(path.to_owned(), e)
}

#[derive(Clone, Debug)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, dir: WorkDir) -> PathBuf {
        self.root.join(dir.name())
    }

    pub fn file(&self, dir: WorkDir, name: &str) -> PathBuf {
        self.dir(dir).join(name)
    }

    /// Path to an input file that must exist.
    pub fn require(&self, dir: WorkDir, name: &str) -> Result<PathBuf> {
        let path = self.file(dir, name);
        if !path.is_file() {
            return Err(Error::MissingInput(path));
        }

        Ok(path)
    }

    pub fn read(&self, dir: WorkDir, name: &str) -> Result<Vec<u8>> {
        let path = self.require(dir, name)?;

        fs::read(&path).map_err(io_error(&path))
    }

    /// Read a file if it exists.
    pub fn read_optional(&self, dir: WorkDir, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.file(dir, name);

        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(path, e)),
        }
    }

    /// Files in `dir` whose names start with `prefix` and end with `suffix`,
    /// sorted by name.
    pub fn list(&self, dir: WorkDir, prefix: &str, suffix: &str) -> Result<Vec<PathBuf>> {
        let path = self.dir(dir);

        let entries = match fs::read_dir(&path) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(Error::Io(path, e)),
        };

        let mut result = vec![];

        for entry in entries {
            let entry = entry.map_err(io_error(&path))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };

            if name.starts_with(prefix) && name.ends_with(suffix) && entry.path().is_file() {
                result.push(entry.path());
            }
        }

        result.sort();

        Ok(result)
    }

    /// Create a staging directory for the outputs of `dir`. Nothing is
    /// visible at the final location until [`StagedDir::commit`].
    pub fn stage(&self, dir: WorkDir) -> Result<StagedDir> {
        fs::create_dir_all(&self.root).map_err(io_error(&self.root))?;

        let temp_dir = tempfile::Builder::new()
            .prefix(&format!(".staging-{}-", dir.name()))
            .tempdir_in(&self.root)
            .map_err(io_error(&self.root))?;

        Ok(StagedDir {
            temp_dir,
            target: self.dir(dir),
        })
    }

    /// Remove the output directories of earlier runs.
    pub fn clean_outputs(&self) -> Result<()> {
        for dir in WorkDir::OUTPUTS {
            let path = self.dir(dir);

            match fs::remove_dir_all(&path) {
                Ok(()) => debug!("Removed {path:?}"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io(path, e)),
            }
        }

        Ok(())
    }
}

/// A temporary directory inside the workspace. It is deleted unless
/// committed.
pub struct StagedDir {
    temp_dir: TempDir,
    target: PathBuf,
}

impl StagedDir {
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn write(&self, name: &str, data: &[u8]) -> Result<PathBuf> {
        let path = self.temp_dir.path().join(name);
        fs::write(&path, data).map_err(io_error(&path))?;

        Ok(self.target.join(name))
    }

    /// Replace the target directory with the staged one. An existing target
    /// is only removed after the new directory is in place.
    pub fn commit(self) -> Result<PathBuf> {
        let parent = self.target.parent().unwrap_or(Path::new("."));

        if self.target.exists() {
            let old = tempfile::Builder::new()
                .prefix(".old-")
                .tempdir_in(parent)
                .map_err(io_error(parent))?;
            let old_target = old.path().join("previous");

            fs::rename(&self.target, &old_target).map_err(io_error(&self.target))?;

            if let Err(e) = fs::rename(self.temp_dir.path(), &self.target) {
                if let Err(restore_error) = fs::rename(&old_target, &self.target) {
                    warn!("Failed to restore {:?}: {restore_error}", self.target);
                }

                return Err(Error::Io(self.target, e));
            }
        } else {
            fs::rename(self.temp_dir.path(), &self.target).map_err(io_error(&self.target))?;
        }

        debug!("Committed {:?}", self.target);

        Ok(self.target)
    }

    /// Move the staged files into the target directory, replacing files with
    /// the same name and keeping every other file.
    pub fn commit_merge(self) -> Result<PathBuf> {
        fs::create_dir_all(&self.target).map_err(io_error(&self.target))?;

        let source = self.temp_dir.path();
        let entries = fs::read_dir(source).map_err(io_error(source))?;

        for entry in entries {
            let entry = entry.map_err(io_error(source))?;
            let dest = self.target.join(entry.file_name());

            fs::rename(entry.path(), &dest).map_err(io_error(&dest))?;
        }

        debug!("Merged into {:?}", self.target);

        Ok(self.target)
    }
}
