//! Reads and maintains the daemon's PID file.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::SupervisorError;

/// The PID file the daemon writes and the supervisor reads.
///
/// The file is owned by the daemon; the supervisor only deletes it after
/// confirming the recorded process is gone, or while cleaning up an aborted
/// start.
#[derive(Debug, Clone)]
pub(crate) struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the recorded PID.
    ///
    /// A missing file, an empty file, or content that is not a single
    /// positive decimal integer all yield `None`; other IO errors propagate.
    pub(crate) fn read(&self) -> Result<Option<i32>, SupervisorError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(SupervisorError::ReadPidFile {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        let trimmed = content.trim();
        if trimmed.is_empty() || !trimmed.bytes().all(|byte| byte.is_ascii_digit()) {
            return Ok(None);
        }
        Ok(trimmed.parse::<i32>().ok().filter(|pid| *pid > 0))
    }

    /// True when the file exists and has content.
    pub(crate) fn available(&self) -> Result<bool, SupervisorError> {
        match fs::metadata(&self.path) {
            Ok(metadata) => Ok(metadata.len() > 0),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(SupervisorError::ReadPidFile {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Best-effort removal; absence and permission refusals are tolerated.
    pub(crate) fn delete(&self) -> Result<(), SupervisorError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(error)
                if matches!(
                    error.kind(),
                    ErrorKind::NotFound | ErrorKind::PermissionDenied
                ) =>
            {
                Ok(())
            }
            Err(source) => Err(SupervisorError::DeletePidFile {
                path: self.path.clone(),
                source,
            }),
        }
    }
}
