//! Watches the daemon's log file for activity and captures what it wrote.
//!
//! A start attempt snapshots the log up front; afterwards the supervisor
//! polls [`LogWatcher::changed`] as an activity watchdog and reads
//! [`LogWatcher::diff`] to include freshly written log lines in failure
//! messages.

use std::fs::{self, File};
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::SupervisorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Observation {
    size: u64,
    mtime: SystemTime,
}

/// Snapshot-and-diff view of the daemon's log file.
///
/// Only regular files carry a snapshot. When the configured log path is a
/// standard channel such as `/dev/stdout`, a FIFO or another character
/// device, there is no byte range to diff; such a log is treated as always
/// active so the watchdog never starves on something it cannot observe.
/// A log path that simply does not exist yet stays observable — the daemon
/// is expected to create it.
#[derive(Debug)]
pub(crate) struct LogWatcher {
    path: PathBuf,
    observable: bool,
    start: Option<Observation>,
    seen: Option<Observation>,
}

impl LogWatcher {
    /// Records the state of the log file at the start of a start attempt.
    pub(crate) fn snapshot(path: &Path) -> Result<Self, SupervisorError> {
        let (start, observable) = match fs::metadata(path) {
            Ok(metadata) if metadata.file_type().is_file() => {
                (Some(Self::observation(path, &metadata)?), true)
            }
            Ok(_) => (None, false),
            Err(error) if error.kind() == ErrorKind::NotFound => (None, true),
            Err(source) => {
                return Err(SupervisorError::ReadLogFile {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        Ok(Self {
            path: path.to_path_buf(),
            observable,
            start,
            seen: start,
        })
    }

    /// Whether spawned commands should capture their output separately.
    ///
    /// When the log path is itself a standard channel, the daemon's output
    /// already goes where the caller can see it and a capture file would
    /// only duplicate it.
    pub(crate) fn captures_output(&self) -> bool {
        self.observable
    }

    /// True when the log moved since the last observation, updating it.
    ///
    /// Growth, truncation, a touched mtime and disappearance all count as
    /// movement. Unobservable logs always report movement.
    pub(crate) fn changed(&mut self) -> Result<bool, SupervisorError> {
        if !self.observable {
            return Ok(true);
        }
        let current = self.observe()?;
        let changed = current != self.seen;
        self.seen = current;
        Ok(changed)
    }

    /// Bytes appended after the snapshot, trimmed.
    ///
    /// `None` when the log is unobservable, has vanished, or turns out not
    /// to be seekable after all.
    pub(crate) fn diff(&self) -> Result<Option<String>, SupervisorError> {
        if !self.observable {
            return Ok(None);
        }
        let offset = self.start.map_or(0, |observation| observation.size);
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(SupervisorError::ReadLogFile {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        if let Err(error) = file.seek(SeekFrom::Start(offset)) {
            if error.raw_os_error() == Some(libc::ESPIPE) {
                return Ok(None);
            }
            return Err(SupervisorError::ReadLogFile {
                path: self.path.clone(),
                source: error,
            });
        }
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .map_err(|source| SupervisorError::ReadLogFile {
                path: self.path.clone(),
                source,
            })?;
        Ok(Some(String::from_utf8_lossy(&bytes).trim().to_owned()))
    }

    fn observe(&self) -> Result<Option<Observation>, SupervisorError> {
        match fs::metadata(&self.path) {
            Ok(metadata) if metadata.file_type().is_file() => {
                Ok(Some(Self::observation(&self.path, &metadata)?))
            }
            Ok(_) => Ok(None),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(SupervisorError::ReadLogFile {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn observation(
        path: &Path,
        metadata: &fs::Metadata,
    ) -> Result<Observation, SupervisorError> {
        let mtime = metadata
            .modified()
            .map_err(|source| SupervisorError::ReadLogFile {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Observation {
            size: metadata.len(),
            mtime,
        })
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn log_in(dir: &TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("daemon.log");
        fs::write(&path, content).expect("write log");
        path
    }

    #[test]
    fn diff_returns_only_appended_bytes() {
        let dir = TempDir::new().expect("temp dir");
        let path = log_in(&dir, "old line\n");
        let watcher = LogWatcher::snapshot(&path).expect("snapshot");
        fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .and_then(|mut file| std::io::Write::write_all(&mut file, b"fresh line\n"))
            .expect("append");
        assert_eq!(watcher.diff().expect("diff").as_deref(), Some("fresh line"));
    }

    #[test]
    fn diff_is_empty_without_writes() {
        let dir = TempDir::new().expect("temp dir");
        let path = log_in(&dir, "old line\n");
        let watcher = LogWatcher::snapshot(&path).expect("snapshot");
        assert_eq!(watcher.diff().expect("diff").as_deref(), Some(""));
    }

    #[test]
    fn missing_log_snapshots_and_diffs_from_origin() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("daemon.log");
        let watcher = LogWatcher::snapshot(&path).expect("snapshot");
        assert!(watcher.captures_output());
        assert_eq!(watcher.diff().expect("diff"), None);
        fs::write(&path, "first line\n").expect("create log");
        assert_eq!(watcher.diff().expect("diff").as_deref(), Some("first line"));
    }

    #[test]
    fn changed_tracks_appends_and_settles() {
        let dir = TempDir::new().expect("temp dir");
        let path = log_in(&dir, "old\n");
        let mut watcher = LogWatcher::snapshot(&path).expect("snapshot");
        assert!(!watcher.changed().expect("changed"));
        fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .and_then(|mut file| std::io::Write::write_all(&mut file, b"more\n"))
            .expect("append");
        assert!(watcher.changed().expect("changed"));
        assert!(!watcher.changed().expect("changed"));
    }

    #[test]
    fn changed_reports_vanished_log() {
        let dir = TempDir::new().expect("temp dir");
        let path = log_in(&dir, "old\n");
        let mut watcher = LogWatcher::snapshot(&path).expect("snapshot");
        fs::remove_file(&path).expect("remove log");
        assert!(watcher.changed().expect("changed"));
        assert!(!watcher.changed().expect("changed"));
    }

    #[cfg(unix)]
    #[test]
    fn character_device_is_not_captured() {
        let watcher = LogWatcher::snapshot(Path::new("/dev/null")).expect("snapshot");
        assert!(!watcher.captures_output());
        assert_eq!(watcher.diff().expect("diff"), None);
    }

    #[cfg(unix)]
    #[test]
    fn character_device_always_counts_as_active() {
        let mut watcher = LogWatcher::snapshot(Path::new("/dev/null")).expect("snapshot");
        assert!(watcher.changed().expect("changed"));
        assert!(watcher.changed().expect("changed"));
    }
}
