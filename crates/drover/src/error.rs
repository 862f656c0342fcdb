//! Defines the unified error surface for daemon supervision.

use std::io;
use std::path::PathBuf;

use nix::errno::Errno;
use thiserror::Error;

/// Errors surfaced while starting, stopping or probing a supervised daemon.
///
/// The first group of variants is the supervision taxonomy callers are
/// expected to match on; the remaining variants report environmental
/// problems (unreadable PID file, undeliverable signal, broken lock file)
/// that indicate misconfiguration rather than daemon state.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// `start` was called while the daemon is already running.
    #[error("daemon '{identifier}' is already started")]
    AlreadyStarted {
        /// Handle identifier.
        identifier: String,
    },
    /// The start command failed, or the daemon died before becoming
    /// connectable.
    #[error("daemon '{identifier}' failed to start: {details}")]
    StartFailed {
        /// Handle identifier.
        identifier: String,
        /// Captured output, log diff and exit information.
        details: String,
    },
    /// The daemon did not become connectable within the start deadline, or
    /// its log file went quiet for too long.
    #[error("daemon '{identifier}' did not start in time: {details}")]
    StartTimedOut {
        /// Handle identifier.
        identifier: String,
        /// Captured output, log diff and exit information.
        details: String,
    },
    /// The stop command failed.
    #[error("daemon '{identifier}' failed to stop: {details}")]
    StopFailed {
        /// Handle identifier.
        identifier: String,
        /// Captured output and exit information.
        details: String,
    },
    /// Graceful stop exceeded its deadline; the daemon was force-killed.
    #[error("daemon '{identifier}' did not stop in time and was killed")]
    StopTimedOut {
        /// Handle identifier.
        identifier: String,
    },
    /// The caller's connect probe kept failing after a successful start.
    #[error("daemon '{identifier}' did not accept a connection after starting: {details}")]
    ConnectFailed {
        /// Handle identifier.
        identifier: String,
        /// The most recent connect-pending error, if any was seen.
        details: String,
    },
    /// A mandatory handle field is missing or malformed.
    #[error("invalid daemon handle configuration: {reason}")]
    InvalidConfig {
        /// What was missing or malformed.
        reason: String,
    },
    /// Opening the lock file failed.
    #[error("failed to open lock file '{path}': {source}")]
    LockOpen {
        /// Lock file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Acquiring the advisory lock failed.
    #[error("failed to lock '{path}': {source}")]
    LockAcquire {
        /// Lock file path.
        path: PathBuf,
        /// Underlying OS error.
        source: Errno,
    },
    /// Reading or statting the PID file failed.
    #[error("failed to read pid file '{path}': {source}")]
    ReadPidFile {
        /// PID file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Removing the PID file failed for a reason other than absence or
    /// permissions.
    #[error("failed to delete pid file '{path}': {source}")]
    DeletePidFile {
        /// PID file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Reading or statting the log file failed.
    #[error("failed to read log file '{path}': {source}")]
    ReadLogFile {
        /// Log file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Creating or reading the launcher's output capture file failed.
    #[error("failed to capture command output: {source}")]
    CaptureFile {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Spawning a command failed before it ever ran.
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        /// The command that could not be spawned.
        command: String,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Waiting on a spawned child failed.
    #[error("failed to wait on child {pid}: {source}")]
    WaitChild {
        /// PID of the child being waited on.
        pid: i32,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Probing an existing PID for liveness failed.
    #[error("failed to check process {pid}: {source}")]
    CheckProcess {
        /// PID that failed to probe.
        pid: i32,
        /// Underlying OS error.
        source: Errno,
    },
    /// Delivering a signal failed.
    #[error("failed to send {signal} to pid {pid}: {source}")]
    Signal {
        /// Target PID.
        pid: i32,
        /// Signal name.
        signal: &'static str,
        /// Underlying OS error.
        source: Errno,
    },
    /// A liveness probe reported an error that does not mean "still
    /// starting".
    #[error("liveness probe failed: {source}")]
    Probe {
        /// Underlying probe error.
        #[source]
        source: io::Error,
    },
}
