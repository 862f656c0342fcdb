//! The start/stop/connect/restart state machine.
//!
//! A [`DaemonHandle`] serializes all mutating operations through an
//! exclusive advisory lock on the handle's lock file, while `pid`,
//! `running` and the fast path of `connect` take only a shared lock. Start
//! attempts are bounded by a wall-clock deadline and a log-activity
//! watchdog; whenever one of them trips, the half-started daemon is put
//! down through the SIGTERM → wait → SIGKILL abort escalation before the
//! timeout surfaces to the caller.

use std::io;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::Signal;
use tracing::{debug, info, warn};

use crate::TRACE_TARGET;
use crate::config::{DaemonHandleBuilder, HandleConfig};
use crate::error::SupervisorError;
use crate::launcher::{self, LaunchOptions, LaunchResult};
use crate::lock::LockFile;
use crate::log_watcher::LogWatcher;
use crate::pid_file::PidFile;
use crate::probe::{PingOutcome, PingSpec, is_connect_pending};
use crate::process::ProcessControl;

/// Poll pace while waiting for a stopping or aborted daemon to go away.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

const TIMED_OUT_SUFFIX: &str = "timed out";

/// Supervises one external local daemon.
///
/// The handle is immutable after construction and safe to share across
/// threads; handles in different processes pointing at the same lock file
/// coordinate through it. `start`, `stop` and `restart` exclude each other
/// everywhere, while concurrent `connect` calls against a running daemon
/// proceed in parallel under shared locks.
pub struct DaemonHandle {
    config: HandleConfig,
    ping: Mutex<PingSpec>,
    lock: LockFile,
    pid_file: PidFile,
    processes: Box<dyn ProcessControl>,
}

impl DaemonHandle {
    /// Starts building a handle for the daemon called `identifier`.
    pub fn builder(identifier: impl Into<String>) -> DaemonHandleBuilder {
        DaemonHandleBuilder::new(identifier)
    }

    pub(crate) fn assemble(
        config: HandleConfig,
        ping: PingSpec,
        processes: Box<dyn ProcessControl>,
    ) -> Self {
        let lock = LockFile::new(config.lock_file_path.clone());
        let pid_file = PidFile::new(config.pid_file_path.clone());
        Self {
            config,
            ping: Mutex::new(ping),
            lock,
            pid_file,
            processes,
        }
    }

    /// The handle's human-readable name.
    pub fn identifier(&self) -> &str {
        &self.config.identifier
    }

    /// Path of the PID file the daemon writes.
    pub fn pid_file_path(&self) -> &Path {
        self.pid_file.path()
    }

    /// Path of the daemon's log file.
    pub fn log_file_path(&self) -> &Path {
        &self.config.log_file_path
    }

    /// Path of the supervisor's lock file.
    pub fn lock_file_path(&self) -> &Path {
        self.lock.path()
    }

    /// Starts the daemon and waits until it answers pings.
    ///
    /// # Errors
    ///
    /// [`AlreadyStarted`](SupervisorError::AlreadyStarted) when the daemon
    /// is running, [`StartFailed`](SupervisorError::StartFailed) when the
    /// command fails or the daemon dies before it becomes connectable, and
    /// [`StartTimedOut`](SupervisorError::StartTimedOut) when the deadline
    /// or the log-activity watchdog trips; in the timeout cases the
    /// half-started daemon has already been aborted.
    pub fn start(&self) -> Result<(), SupervisorError> {
        self.lock.with_exclusive(|| self.start_locked())
    }

    /// Stops the daemon gracefully, escalating to SIGKILL on timeout.
    ///
    /// Stopping a daemon that is not running is a no-op.
    pub fn stop(&self) -> Result<(), SupervisorError> {
        self.lock.with_exclusive(|| self.stop_locked())
    }

    /// Restarts the daemon: either through the configured restart command
    /// or by sequencing [`stop`](Self::stop) and [`start`](Self::start).
    pub fn restart(&self) -> Result<(), SupervisorError> {
        match &self.config.restart_command {
            Some(restart_command) => self.lock.with_exclusive(|| {
                info!(
                    target: TRACE_TARGET,
                    daemon = %self.config.identifier,
                    "restarting daemon via restart command"
                );
                let deadline = Instant::now() + self.config.start_timeout;
                let command = restart_command.resolve();
                let options = LaunchOptions {
                    env: &self.config.env,
                    keep_fds: &self.config.keep_fds,
                    daemonize: self.config.daemonize_for_me,
                    capture_output: true,
                };
                match launcher::launch(&command, &options, deadline, self.config.ping_interval)? {
                    LaunchResult::Launched { .. } => Ok(()),
                    LaunchResult::Failed { output, status, .. } => Err(self.start_failed(
                        output.as_deref(),
                        None,
                        &launcher::exit_status_suffix(status),
                    )),
                    LaunchResult::SpawnTimedOut { output, .. } => {
                        Err(self.start_timed_out(output.as_deref(), None))
                    }
                }
            }),
            None => {
                self.stop()?;
                self.start()
            }
        }
    }

    /// Connects to the daemon, starting it first if needed.
    ///
    /// The probe is tried under a shared lock so concurrent readers of a
    /// running daemon never serialize. Only when it yields no connection
    /// does the handle upgrade to the exclusive lock, start the daemon if
    /// it is not running, and try once more. A probe result of `Ok(None)`
    /// or a connect-pending error counts as "no connection"; other errors
    /// escalate as [`Probe`](SupervisorError::Probe).
    pub fn connect<T>(
        &self,
        mut probe: impl FnMut() -> io::Result<Option<T>>,
    ) -> Result<T, SupervisorError> {
        let mut last_pending: Option<io::Error> = None;
        let first_try = self
            .lock
            .with_shared(|| try_connect_probe(&mut probe, &mut last_pending))?;
        if let Some(connection) = first_try {
            return Ok(connection);
        }
        let second_try = self.lock.with_exclusive(|| {
            if !self.running_locked()? {
                info!(
                    target: TRACE_TARGET,
                    daemon = %self.config.identifier,
                    "daemon not running; starting it before connecting"
                );
                self.start_locked()?;
            }
            try_connect_probe(&mut probe, &mut last_pending)
        })?;
        second_try.ok_or_else(|| SupervisorError::ConnectFailed {
            identifier: self.config.identifier.clone(),
            details: last_pending.map_or_else(
                || "the probe returned no connection".to_owned(),
                |error| format!("last error: {error}"),
            ),
        })
    }

    /// Whether the daemon is currently running.
    ///
    /// A PID file naming a dead process is deleted on the way.
    pub fn running(&self) -> Result<bool, SupervisorError> {
        self.lock.with_shared(|| self.running_locked())
    }

    /// The PID recorded in the PID file, if it holds a valid one.
    pub fn pid(&self) -> Result<Option<i32>, SupervisorError> {
        self.lock.with_shared(|| self.pid_file.read())
    }

    fn start_locked(&self) -> Result<(), SupervisorError> {
        if self.running_locked()? {
            return Err(SupervisorError::AlreadyStarted {
                identifier: self.config.identifier.clone(),
            });
        }
        let mut log = LogWatcher::snapshot(&self.config.log_file_path)?;
        // A leftover PID file would make the fresh daemon ambiguous with
        // the previous one.
        self.pid_file.delete()?;
        if let Some(callback) = &self.config.before_start {
            callback();
        }
        info!(
            target: TRACE_TARGET,
            daemon = %self.config.identifier,
            "starting daemon"
        );
        let deadline = Instant::now() + self.config.start_timeout;
        let command = self.config.start_command.resolve();
        let options = LaunchOptions {
            env: &self.config.env,
            keep_fds: &self.config.keep_fds,
            daemonize: self.config.daemonize_for_me,
            capture_output: log.captures_output(),
        };
        match launcher::launch(&command, &options, deadline, self.config.ping_interval)? {
            LaunchResult::Failed { output, status, .. } => {
                let logs = log.diff()?;
                Err(self.start_failed(
                    output.as_deref(),
                    logs.as_deref(),
                    &launcher::exit_status_suffix(status),
                ))
            }
            LaunchResult::SpawnTimedOut { pid, output } => {
                warn!(
                    target: TRACE_TARGET,
                    daemon = %self.config.identifier,
                    pid,
                    "start command outlived the deadline; aborting"
                );
                self.abort_start(pid, true)?;
                let logs = log.diff()?;
                Err(self.start_timed_out(output.as_deref(), logs.as_deref()))
            }
            LaunchResult::Launched { output, .. } => {
                self.await_ready(deadline, &mut log, output.as_deref())
            }
        }
    }

    fn await_ready(
        &self,
        deadline: Instant,
        log: &mut LogWatcher,
        output: Option<&str>,
    ) -> Result<(), SupervisorError> {
        let mut last_activity = Instant::now();
        while !self.pid_file.available()? {
            self.ensure_progress(deadline, log, &mut last_activity, output)?;
            thread::sleep(self.config.ping_interval);
        }
        debug!(
            target: TRACE_TARGET,
            daemon = %self.config.identifier,
            "pid file appeared; waiting for the daemon to answer pings"
        );
        loop {
            if self.ping()? == PingOutcome::Up {
                break;
            }
            if !self.running_locked()? {
                // Died after writing its PID file; the oracle below turns
                // this into a start failure.
                break;
            }
            self.ensure_progress(deadline, log, &mut last_activity, output)?;
            thread::sleep(self.config.ping_interval);
        }
        if self.ping()? == PingOutcome::Up {
            info!(
                target: TRACE_TARGET,
                daemon = %self.config.identifier,
                "daemon is up"
            );
            Ok(())
        } else {
            let logs = log.diff()?;
            Err(self.start_failed(output, logs.as_deref(), ""))
        }
    }

    /// Feeds the activity watchdog and the wall-clock deadline; when either
    /// trips, aborts whatever the PID file names and reports the timeout.
    fn ensure_progress(
        &self,
        deadline: Instant,
        log: &mut LogWatcher,
        last_activity: &mut Instant,
        output: Option<&str>,
    ) -> Result<(), SupervisorError> {
        if log.changed()? {
            *last_activity = Instant::now();
        } else if last_activity.elapsed() >= self.config.log_activity_timeout {
            warn!(
                target: TRACE_TARGET,
                daemon = %self.config.identifier,
                "log file went quiet; treating the start as silently failed"
            );
            self.abort_via_pid_file()?;
            let logs = log.diff()?;
            return Err(self.start_timed_out(output, logs.as_deref()));
        }
        if Instant::now() >= deadline {
            warn!(
                target: TRACE_TARGET,
                daemon = %self.config.identifier,
                "start deadline passed; aborting"
            );
            self.abort_via_pid_file()?;
            let logs = log.diff()?;
            return Err(self.start_timed_out(output, logs.as_deref()));
        }
        Ok(())
    }

    fn stop_locked(&self) -> Result<(), SupervisorError> {
        let deadline = Instant::now() + self.config.stop_timeout;
        if let Some(stop_command) = &self.config.stop_command {
            if self.config.dont_stop_if_pid_file_invalid && self.pid_file.read()?.is_none() {
                debug!(
                    target: TRACE_TARGET,
                    daemon = %self.config.identifier,
                    "pid file invalid; not running the stop command"
                );
                return Ok(());
            }
            let command = stop_command.resolve();
            let options = LaunchOptions {
                env: &self.config.env,
                keep_fds: &self.config.keep_fds,
                daemonize: false,
                capture_output: true,
            };
            match launcher::launch(&command, &options, deadline, self.config.ping_interval)? {
                LaunchResult::Launched { .. } => {}
                LaunchResult::Failed { output, status, .. } => {
                    return Err(SupervisorError::StopFailed {
                        identifier: self.config.identifier.clone(),
                        details: compose_failure_message(
                            output.as_deref(),
                            None,
                            &launcher::exit_status_suffix(status),
                        ),
                    });
                }
                LaunchResult::SpawnTimedOut { output, .. } => {
                    return Err(SupervisorError::StopFailed {
                        identifier: self.config.identifier.clone(),
                        details: compose_failure_message(output.as_deref(), None, TIMED_OUT_SUFFIX),
                    });
                }
            }
        } else if let Some(pid) = self.pid_file.read()? {
            info!(
                target: TRACE_TARGET,
                daemon = %self.config.identifier,
                pid,
                signal = self.config.stop_graceful_signal.as_str(),
                "signalling daemon to stop"
            );
            match self.processes.send_signal(pid, self.config.stop_graceful_signal) {
                Ok(()) | Err(Errno::ESRCH | Errno::ENOENT) => {}
                Err(source) => {
                    return Err(SupervisorError::Signal {
                        pid,
                        signal: self.config.stop_graceful_signal.as_str(),
                        source,
                    });
                }
            }
        }
        while self.running_locked()? {
            if Instant::now() >= deadline {
                return Err(self.force_kill());
            }
            thread::sleep(STOP_POLL_INTERVAL);
        }
        Ok(())
    }

    /// SIGKILLs the recorded PID, waits it out, removes the PID file and
    /// reports the stop timeout. The kernel reaps a killed process
    /// promptly, so this wait carries no deadline of its own.
    fn force_kill(&self) -> SupervisorError {
        warn!(
            target: TRACE_TARGET,
            daemon = %self.config.identifier,
            "graceful stop timed out; force-killing"
        );
        let cleanup: Result<(), SupervisorError> = (|| {
            if let Some(pid) = self.pid_file.read()? {
                let _ = self.processes.send_signal(pid, Signal::SIGKILL);
                while self.running_locked()? {
                    thread::sleep(STOP_POLL_INTERVAL);
                }
            }
            self.pid_file.delete()
        })();
        cleanup.err().unwrap_or_else(|| SupervisorError::StopTimedOut {
            identifier: self.config.identifier.clone(),
        })
    }

    fn abort_via_pid_file(&self) -> Result<(), SupervisorError> {
        if let Some(pid) = self.pid_file.read()? {
            self.abort_start(pid, false)?;
        }
        Ok(())
    }

    /// Escalating termination of a half-started daemon: SIGTERM, a bounded
    /// wait, then SIGKILL and the same wait again.
    fn abort_start(&self, pid: i32, is_direct_child: bool) -> Result<(), SupervisorError> {
        info!(
            target: TRACE_TARGET,
            daemon = %self.config.identifier,
            pid,
            direct_child = is_direct_child,
            "aborting half-started daemon"
        );
        let _ = self.processes.send_signal(pid, Signal::SIGTERM);
        if self.await_abort(pid, is_direct_child)? {
            return Ok(());
        }
        warn!(
            target: TRACE_TARGET,
            daemon = %self.config.identifier,
            pid,
            "daemon ignored SIGTERM; escalating to SIGKILL"
        );
        let _ = self.processes.send_signal(pid, Signal::SIGKILL);
        self.await_abort(pid, is_direct_child)?;
        Ok(())
    }

    /// One stage of the abort escalation; true once the process is gone.
    ///
    /// A direct child is reaped with `waitpid`; a daemon that already
    /// forked is only observable through the PID file. The PID file is
    /// deleted only while it still names the aborted process — if it names
    /// someone else, the daemon forked just before termination and both
    /// the fork and its PID file are left alone.
    fn await_abort(&self, pid: i32, is_direct_child: bool) -> Result<bool, SupervisorError> {
        let deadline = Instant::now() + self.config.start_abort_timeout;
        if is_direct_child {
            loop {
                match self.processes.try_reap(pid) {
                    Ok(true) => break,
                    Ok(false) => {}
                    // Reaping is best-effort during an abort.
                    Err(_) => break,
                }
                if Instant::now() >= deadline {
                    return Ok(false);
                }
                thread::sleep(STOP_POLL_INTERVAL);
            }
            if self.pid_file.read()? == Some(pid) {
                self.pid_file.delete()?;
            }
            Ok(true)
        } else {
            while self.running_locked()? {
                if Instant::now() >= deadline {
                    return Ok(false);
                }
                thread::sleep(STOP_POLL_INTERVAL);
            }
            Ok(true)
        }
    }

    fn running_locked(&self) -> Result<bool, SupervisorError> {
        let Some(pid) = self.pid_file.read()? else {
            return Ok(false);
        };
        match self.processes.alive(pid) {
            Ok(true) => Ok(true),
            Ok(false) => {
                debug!(
                    target: TRACE_TARGET,
                    daemon = %self.config.identifier,
                    pid,
                    "stale pid file; removing it"
                );
                self.pid_file.delete()?;
                Ok(false)
            }
            Err(source) => Err(SupervisorError::CheckProcess { pid, source }),
        }
    }

    fn ping(&self) -> Result<PingOutcome, SupervisorError> {
        self.ping
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .probe()
    }

    fn start_failed(
        &self,
        output: Option<&str>,
        logs: Option<&str>,
        suffix: &str,
    ) -> SupervisorError {
        SupervisorError::StartFailed {
            identifier: self.config.identifier.clone(),
            details: compose_failure_message(output, logs, suffix),
        }
    }

    fn start_timed_out(&self, output: Option<&str>, logs: Option<&str>) -> SupervisorError {
        SupervisorError::StartTimedOut {
            identifier: self.config.identifier.clone(),
            details: compose_failure_message(output, logs, TIMED_OUT_SUFFIX),
        }
    }
}

impl std::fmt::Debug for DaemonHandle {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("DaemonHandle")
            .field("identifier", &self.config.identifier)
            .field("pid_file", &self.pid_file.path())
            .field("lock_file", &self.lock.path())
            .finish_non_exhaustive()
    }
}

fn try_connect_probe<T>(
    probe: &mut impl FnMut() -> io::Result<Option<T>>,
    last_pending: &mut Option<io::Error>,
) -> Result<Option<T>, SupervisorError> {
    match probe() {
        Ok(connection) => Ok(connection),
        Err(error) if is_connect_pending(&error) => {
            *last_pending = Some(error);
            Ok(None)
        }
        Err(source) => Err(SupervisorError::Probe { source }),
    }
}

/// Builds the human-readable failure message from captured output, the log
/// diff and an exit summary.
fn compose_failure_message(output: Option<&str>, logs: Option<&str>, suffix: &str) -> String {
    if output.is_none() && logs.is_none() {
        return if suffix.is_empty() {
            "(logs not available)".to_owned()
        } else {
            format!("(logs not available; {suffix})")
        };
    }
    let output = output.unwrap_or("").trim();
    let logs = logs.unwrap_or("").trim();
    let mut message = match (output.is_empty(), logs.is_empty()) {
        (true, true) => {
            return if suffix.is_empty() {
                "(logs empty)".to_owned()
            } else {
                format!("(logs empty; {suffix})")
            };
        }
        (false, false) => format!("{output}\n{logs}"),
        (false, true) => output.to_owned(),
        (true, false) => logs.to_owned(),
    };
    if !suffix.is_empty() {
        message.push('\n');
        message.push('(');
        message.push_str(suffix);
        message.push(')');
    }
    message
}
