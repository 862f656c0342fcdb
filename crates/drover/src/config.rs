//! Handle construction: commands, callbacks, timeouts and validation.

use std::collections::HashMap;
use std::fmt;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::signal::Signal;

use crate::error::SupervisorError;
use crate::probe::PingSpec;
use crate::process::{ProcessControl, SystemProcesses};
use crate::supervisor::DaemonHandle;

/// Default wall-clock budget for `start`.
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(30);
/// Default wall-clock budget for `stop`.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);
/// Default budget for each stage of the abort escalation.
pub const DEFAULT_START_ABORT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default log inactivity window before a start attempt counts as dead.
pub const DEFAULT_LOG_ACTIVITY_TIMEOUT: Duration = Duration::from_secs(10);
/// Default pause between liveness polls.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_millis(100);

/// A command to run, either fixed up front or produced at invocation time.
pub enum CommandSource {
    /// A literal `/bin/sh -c` command string.
    Literal(String),
    /// Produces the command string each time it is needed.
    Dynamic(Box<dyn Fn() -> String + Send + Sync>),
}

impl CommandSource {
    pub(crate) fn resolve(&self) -> String {
        match self {
            Self::Literal(command) => command.clone(),
            Self::Dynamic(produce) => produce(),
        }
    }
}

impl From<&str> for CommandSource {
    fn from(command: &str) -> Self {
        Self::Literal(command.to_owned())
    }
}

impl From<String> for CommandSource {
    fn from(command: String) -> Self {
        Self::Literal(command)
    }
}

impl fmt::Debug for CommandSource {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(command) => formatter.debug_tuple("Literal").field(command).finish(),
            Self::Dynamic(_) => formatter.write_str("Dynamic(..)"),
        }
    }
}

pub(crate) type BeforeStart = Box<dyn Fn() + Send + Sync>;

/// Validated, immutable handle configuration.
pub(crate) struct HandleConfig {
    pub(crate) identifier: String,
    pub(crate) start_command: CommandSource,
    pub(crate) stop_command: Option<CommandSource>,
    pub(crate) restart_command: Option<CommandSource>,
    pub(crate) before_start: Option<BeforeStart>,
    pub(crate) pid_file_path: PathBuf,
    pub(crate) log_file_path: PathBuf,
    pub(crate) lock_file_path: PathBuf,
    pub(crate) start_timeout: Duration,
    pub(crate) stop_timeout: Duration,
    pub(crate) start_abort_timeout: Duration,
    pub(crate) log_activity_timeout: Duration,
    pub(crate) ping_interval: Duration,
    pub(crate) stop_graceful_signal: Signal,
    pub(crate) dont_stop_if_pid_file_invalid: bool,
    pub(crate) daemonize_for_me: bool,
    pub(crate) keep_fds: Vec<RawFd>,
    pub(crate) env: HashMap<String, String>,
}

/// Builder for [`DaemonHandle`].
///
/// Mandatory fields are the start command, the ping spec, and the PID and
/// log file paths; everything else has the defaults documented on the
/// `DEFAULT_*` constants.
pub struct DaemonHandleBuilder {
    identifier: String,
    start_command: Option<CommandSource>,
    stop_command: Option<CommandSource>,
    restart_command: Option<CommandSource>,
    before_start: Option<BeforeStart>,
    ping_spec: Option<PingSpec>,
    pid_file_path: Option<PathBuf>,
    log_file_path: Option<PathBuf>,
    lock_file_path: Option<PathBuf>,
    start_timeout: Duration,
    stop_timeout: Duration,
    start_abort_timeout: Duration,
    log_activity_timeout: Duration,
    ping_interval: Duration,
    stop_graceful_signal: Signal,
    dont_stop_if_pid_file_invalid: bool,
    daemonize_for_me: bool,
    keep_fds: Vec<RawFd>,
    env: HashMap<String, String>,
    processes: Box<dyn ProcessControl>,
}

impl DaemonHandleBuilder {
    pub(crate) fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            start_command: None,
            stop_command: None,
            restart_command: None,
            before_start: None,
            ping_spec: None,
            pid_file_path: None,
            log_file_path: None,
            lock_file_path: None,
            start_timeout: DEFAULT_START_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            start_abort_timeout: DEFAULT_START_ABORT_TIMEOUT,
            log_activity_timeout: DEFAULT_LOG_ACTIVITY_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
            stop_graceful_signal: Signal::SIGTERM,
            dont_stop_if_pid_file_invalid: false,
            daemonize_for_me: false,
            keep_fds: Vec::new(),
            env: HashMap::new(),
            processes: Box::new(SystemProcesses),
        }
    }

    /// Command that starts the daemon.
    pub fn start_command(mut self, command: impl Into<CommandSource>) -> Self {
        self.start_command = Some(command.into());
        self
    }

    /// Start command produced at invocation time.
    pub fn start_command_with(
        mut self,
        produce: impl Fn() -> String + Send + Sync + 'static,
    ) -> Self {
        self.start_command = Some(CommandSource::Dynamic(Box::new(produce)));
        self
    }

    /// Command that stops the daemon. Without one, `stop` signals the PID
    /// from the PID file instead.
    pub fn stop_command(mut self, command: impl Into<CommandSource>) -> Self {
        self.stop_command = Some(command.into());
        self
    }

    /// Stop command produced at invocation time.
    pub fn stop_command_with(
        mut self,
        produce: impl Fn() -> String + Send + Sync + 'static,
    ) -> Self {
        self.stop_command = Some(CommandSource::Dynamic(Box::new(produce)));
        self
    }

    /// Command that restarts the daemon. Without one, `restart` sequences
    /// `stop` and `start`.
    pub fn restart_command(mut self, command: impl Into<CommandSource>) -> Self {
        self.restart_command = Some(command.into());
        self
    }

    /// Restart command produced at invocation time.
    pub fn restart_command_with(
        mut self,
        produce: impl Fn() -> String + Send + Sync + 'static,
    ) -> Self {
        self.restart_command = Some(CommandSource::Dynamic(Box::new(produce)));
        self
    }

    /// Callback run before the start command, outside the start deadline.
    pub fn before_start(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.before_start = Some(Box::new(callback));
        self
    }

    /// Liveness probe for the daemon.
    pub fn ping_spec(mut self, spec: PingSpec) -> Self {
        self.ping_spec = Some(spec);
        self
    }

    /// Absolute path of the PID file the daemon writes.
    pub fn pid_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.pid_file_path = Some(path.into());
        self
    }

    /// Absolute path of the daemon's log file.
    pub fn log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file_path = Some(path.into());
        self
    }

    /// Lock file path; defaults to the PID file path with `.lock` appended.
    pub fn lock_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.lock_file_path = Some(path.into());
        self
    }

    /// Wall-clock budget for `start`.
    pub fn start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    /// Wall-clock budget for `stop`.
    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Budget for each stage of the abort escalation.
    pub fn start_abort_timeout(mut self, timeout: Duration) -> Self {
        self.start_abort_timeout = timeout;
        self
    }

    /// Log inactivity window before a start attempt counts as dead.
    pub fn log_file_activity_timeout(mut self, timeout: Duration) -> Self {
        self.log_activity_timeout = timeout;
        self
    }

    /// Pause between liveness polls.
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Signal sent for a graceful stop when there is no stop command.
    pub fn stop_graceful_signal(mut self, signal: Signal) -> Self {
        self.stop_graceful_signal = signal;
        self
    }

    /// Treat an invalid PID file as "nothing to stop" when a stop command
    /// is configured.
    pub fn dont_stop_if_pid_file_invalid(mut self, value: bool) -> Self {
        self.dont_stop_if_pid_file_invalid = value;
        self
    }

    /// Double-fork and `setsid` on behalf of a daemon that does not
    /// daemonize itself.
    pub fn daemonize_for_me(mut self, value: bool) -> Self {
        self.daemonize_for_me = value;
        self
    }

    /// Descriptors the daemon inherits beyond stdin/stdout/stderr.
    pub fn keep_fds(mut self, fds: impl IntoIterator<Item = RawFd>) -> Self {
        self.keep_fds.extend(fds);
        self
    }

    /// Adds one environment variable merged over the ambient environment.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Substitutes the host-process capability; intended for tests.
    pub fn process_control(mut self, processes: Box<dyn ProcessControl>) -> Self {
        self.processes = processes;
        self
    }

    /// Validates the configuration and builds the handle.
    pub fn build(self) -> Result<DaemonHandle, SupervisorError> {
        let identifier = self.identifier;
        if identifier.trim().is_empty() {
            return Err(invalid("identifier must not be empty"));
        }
        let start_command = self
            .start_command
            .ok_or_else(|| invalid("a start command is required"))?;
        let ping_spec = self
            .ping_spec
            .ok_or_else(|| invalid("a ping spec is required"))?;
        let pid_file_path = required_absolute("pid file path", self.pid_file_path)?;
        let log_file_path = required_absolute("log file path", self.log_file_path)?;
        let lock_file_path = match self.lock_file_path {
            Some(path) => {
                ensure_absolute("lock file path", &path)?;
                path
            }
            None => default_lock_path(&pid_file_path),
        };
        let config = HandleConfig {
            identifier,
            start_command,
            stop_command: self.stop_command,
            restart_command: self.restart_command,
            before_start: self.before_start,
            pid_file_path,
            log_file_path,
            lock_file_path,
            start_timeout: self.start_timeout,
            stop_timeout: self.stop_timeout,
            start_abort_timeout: self.start_abort_timeout,
            log_activity_timeout: self.log_activity_timeout,
            ping_interval: self.ping_interval,
            stop_graceful_signal: self.stop_graceful_signal,
            dont_stop_if_pid_file_invalid: self.dont_stop_if_pid_file_invalid,
            daemonize_for_me: self.daemonize_for_me,
            keep_fds: self.keep_fds,
            env: self.env,
        };
        Ok(DaemonHandle::assemble(config, ping_spec, self.processes))
    }
}

impl fmt::Debug for DaemonHandleBuilder {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("DaemonHandleBuilder")
            .field("identifier", &self.identifier)
            .field("start_command", &self.start_command)
            .field("pid_file_path", &self.pid_file_path)
            .field("log_file_path", &self.log_file_path)
            .finish_non_exhaustive()
    }
}

fn invalid(reason: &str) -> SupervisorError {
    SupervisorError::InvalidConfig {
        reason: reason.to_owned(),
    }
}

fn required_absolute(what: &str, path: Option<PathBuf>) -> Result<PathBuf, SupervisorError> {
    let path = path.ok_or_else(|| invalid(&format!("a {what} is required")))?;
    ensure_absolute(what, &path)?;
    Ok(path)
}

fn ensure_absolute(what: &str, path: &Path) -> Result<(), SupervisorError> {
    if path.is_absolute() {
        Ok(())
    } else {
        Err(invalid(&format!(
            "the {what} '{}' must be absolute",
            path.display()
        )))
    }
}

fn default_lock_path(pid_file_path: &Path) -> PathBuf {
    let mut raw = pid_file_path.to_path_buf().into_os_string();
    raw.push(".lock");
    PathBuf::from(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> DaemonHandleBuilder {
        DaemonHandle::builder("echo")
            .start_command("echo-server start")
            .ping_spec(PingSpec::tcp("127.0.0.1", 3230))
            .pid_file("/tmp/echo-server.pid")
            .log_file("/tmp/echo-server.log")
    }

    #[test]
    fn builds_with_mandatory_fields() {
        minimal().build().expect("build");
    }

    #[test]
    fn lock_path_defaults_to_pid_path_with_suffix() {
        let handle = minimal().build().expect("build");
        assert_eq!(
            handle.lock_file_path(),
            Path::new("/tmp/echo-server.pid.lock")
        );
    }

    #[test]
    fn rejects_missing_start_command() {
        let result = DaemonHandle::builder("echo")
            .ping_spec(PingSpec::tcp("127.0.0.1", 3230))
            .pid_file("/tmp/echo-server.pid")
            .log_file("/tmp/echo-server.log")
            .build();
        assert!(matches!(
            result,
            Err(SupervisorError::InvalidConfig { reason }) if reason.contains("start command")
        ));
    }

    #[test]
    fn rejects_relative_paths() {
        let result = minimal().pid_file("echo-server.pid").build();
        assert!(matches!(
            result,
            Err(SupervisorError::InvalidConfig { reason }) if reason.contains("absolute")
        ));
    }

    #[test]
    fn rejects_blank_identifier() {
        let result = DaemonHandle::builder("  ")
            .start_command("echo-server start")
            .ping_spec(PingSpec::tcp("127.0.0.1", 3230))
            .pid_file("/tmp/echo-server.pid")
            .log_file("/tmp/echo-server.log")
            .build();
        assert!(matches!(
            result,
            Err(SupervisorError::InvalidConfig { reason }) if reason.contains("identifier")
        ));
    }

    #[test]
    fn dynamic_commands_resolve_lazily() {
        let source = CommandSource::Dynamic(Box::new(|| "generated --now".to_owned()));
        assert_eq!(source.resolve(), "generated --now");
    }
}
