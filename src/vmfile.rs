use crate::error::Result;
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A disk image (or intermediate artifact) on the local filesystem.
///
/// Dropping a `VmFile` leaves the file in place; whoever owns the handle
/// decides when to [`delete`](VmFile::delete) it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmFile {
    path: PathBuf,
}

impl VmFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn file_name(&self) -> Option<&OsStr> {
        self.path.file_name()
    }

    /// Remove the file. A file that is already gone is not an error.
    pub fn delete(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "deleted vm file");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn into_path(self) -> PathBuf {
        self.path
    }
}

impl AsRef<Path> for VmFile {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}
