//! Spawns start/stop/restart commands with captured output and a bounded
//! wait on the immediate child.
//!
//! Daemons usually fork and let the spawned child exit, so a zero exit
//! status here only confirms the parent-visible child succeeded; the PID
//! file and liveness probes report on the long-running process itself.

use std::collections::HashMap;
use std::io::{self, Read};
use std::os::fd::RawFd;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::TRACE_TARGET;
use crate::error::SupervisorError;

/// What became of a spawned command's immediate child.
#[derive(Debug)]
pub(crate) enum LaunchResult {
    /// The immediate child exited zero.
    Launched {
        /// PID of the immediate child.
        pid: i32,
        /// Captured combined stdout and stderr, when capture was on.
        output: Option<String>,
    },
    /// The immediate child exited nonzero or died on a signal.
    Failed {
        /// PID of the immediate child.
        pid: i32,
        /// Captured combined stdout and stderr, when capture was on.
        output: Option<String>,
        /// How the child exited.
        status: ExitStatus,
    },
    /// The deadline tripped while waiting. The child has not been touched;
    /// the caller runs the abort protocol.
    SpawnTimedOut {
        /// PID of the still-unreaped child.
        pid: i32,
        /// Whatever output was captured before the deadline.
        output: Option<String>,
    },
}

/// Spawn-time knobs shared by the start, stop and restart commands.
pub(crate) struct LaunchOptions<'a> {
    /// Extra environment merged over the ambient environment.
    pub(crate) env: &'a HashMap<String, String>,
    /// Descriptors to keep open across exec, beyond stdin/stdout/stderr.
    pub(crate) keep_fds: &'a [RawFd],
    /// Detach the command into its own session via a second fork.
    pub(crate) daemonize: bool,
    /// Capture combined stdout/stderr to a private temp file. Off when the
    /// daemon's log file is itself a standard channel, in which case the
    /// command inherits the caller's channels.
    pub(crate) capture_output: bool,
}

enum WaitOutcome {
    Exited(ExitStatus),
    /// Someone else collected the child (`ECHILD`); the PID and log probes
    /// will report the truth.
    Reaped,
    DeadlinePassed,
}

/// Runs `command` through `/bin/sh -c` and waits for the immediate child
/// until `deadline`.
///
/// The capture file never outlives this call; its contents are read into
/// the returned [`LaunchResult`] before it is removed.
pub(crate) fn launch(
    command: &str,
    options: &LaunchOptions<'_>,
    deadline: Instant,
    poll_interval: Duration,
) -> Result<LaunchResult, SupervisorError> {
    let capture = if options.capture_output {
        Some(NamedTempFile::new().map_err(|source| SupervisorError::CaptureFile { source })?)
    } else {
        None
    };

    let mut shell = Command::new("/bin/sh");
    shell
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .envs(options.env);
    match &capture {
        Some(file) => {
            // Both channels must share one open file description, so writes
            // from either advance the same offset instead of clobbering
            // each other.
            let stdout = file
                .reopen()
                .map_err(|source| SupervisorError::CaptureFile { source })?;
            let stderr = stdout
                .try_clone()
                .map_err(|source| SupervisorError::CaptureFile { source })?;
            shell.stdout(Stdio::from(stdout)).stderr(Stdio::from(stderr));
        }
        None => {
            shell.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        }
    }

    let keep_fds = options.keep_fds.to_vec();
    let daemonize = options.daemonize;
    // SAFETY: the closure runs between fork and exec and restricts itself
    // to async-signal-safe libc calls. Descriptor hygiene rests on
    // close-on-exec: every descriptor this process opens carries
    // FD_CLOEXEC, and the flag is cleared here for the ones the caller
    // wants the daemon to inherit.
    unsafe {
        shell.pre_exec(move || {
            for &fd in &keep_fds {
                let flags = libc::fcntl(fd, libc::F_GETFD);
                if flags >= 0 {
                    libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC);
                }
            }
            if daemonize {
                if libc::setsid() < 0 {
                    return Err(io::Error::last_os_error());
                }
                match libc::fork() {
                    -1 => return Err(io::Error::last_os_error()),
                    // The grandchild carries on to exec as the session's
                    // long-lived process.
                    0 => {}
                    // The intermediate parent reports success, orphaning
                    // the grandchild onto init.
                    _ => libc::_exit(0),
                }
            }
            Ok(())
        });
    }

    let mut child = shell.spawn().map_err(|source| SupervisorError::Spawn {
        command: command.to_owned(),
        source,
    })?;
    let pid = i32::try_from(child.id()).unwrap_or(i32::MAX);
    debug!(target: TRACE_TARGET, pid, command, daemonize, "spawned command");

    let outcome = wait_with_deadline(&mut child, pid, deadline, poll_interval)?;
    let output = match &capture {
        Some(file) => Some(read_capture(file)?),
        None => None,
    };
    Ok(match outcome {
        WaitOutcome::Exited(status) if status.success() => LaunchResult::Launched { pid, output },
        WaitOutcome::Exited(status) => LaunchResult::Failed {
            pid,
            output,
            status,
        },
        WaitOutcome::Reaped => LaunchResult::Launched { pid, output },
        WaitOutcome::DeadlinePassed => LaunchResult::SpawnTimedOut { pid, output },
    })
}

/// Human-readable exit summary, e.g. "exited with status 2" or
/// "terminated with signal SIGTERM".
pub(crate) fn exit_status_suffix(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        format!("exited with status {code}")
    } else if let Some(signal) = status.signal() {
        let name = Signal::try_from(signal)
            .map(Signal::as_str)
            .unwrap_or("unknown signal");
        format!("terminated with signal {name}")
    } else {
        "exited".to_owned()
    }
}

fn wait_with_deadline(
    child: &mut Child,
    pid: i32,
    deadline: Instant,
    poll_interval: Duration,
) -> Result<WaitOutcome, SupervisorError> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(WaitOutcome::Exited(status)),
            Ok(None) => {}
            Err(error) if error.raw_os_error() == Some(libc::ECHILD) => {
                return Ok(WaitOutcome::Reaped);
            }
            Err(source) => return Err(SupervisorError::WaitChild { pid, source }),
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(WaitOutcome::DeadlinePassed);
        }
        thread::sleep(poll_interval.min(deadline - now));
    }
}

fn read_capture(file: &NamedTempFile) -> Result<String, SupervisorError> {
    let mut bytes = Vec::new();
    file.reopen()
        .and_then(|mut reader| reader.read_to_end(&mut bytes))
        .map_err(|source| SupervisorError::CaptureFile { source })?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(env: &HashMap<String, String>) -> LaunchOptions<'_> {
        LaunchOptions {
            env,
            keep_fds: &[],
            daemonize: false,
            capture_output: true,
        }
    }

    fn deadline_in(duration: Duration) -> Instant {
        Instant::now() + duration
    }

    #[test]
    fn captures_combined_output() {
        let env = HashMap::new();
        let result = launch(
            "echo to-stdout; echo to-stderr >&2",
            &options(&env),
            deadline_in(Duration::from_secs(5)),
            Duration::from_millis(10),
        )
        .expect("launch");
        match result {
            LaunchResult::Launched { output, .. } => {
                let output = output.expect("captured output");
                assert!(output.contains("to-stdout"));
                assert!(output.contains("to-stderr"));
            }
            other => panic!("expected Launched, got {other:?}"),
        }
    }

    #[test]
    fn merges_environment_over_ambient() {
        let mut env = HashMap::new();
        env.insert("DROVER_TEST_FLAVOUR".to_owned(), "salted".to_owned());
        let result = launch(
            "echo flavour=$DROVER_TEST_FLAVOUR",
            &options(&env),
            deadline_in(Duration::from_secs(5)),
            Duration::from_millis(10),
        )
        .expect("launch");
        match result {
            LaunchResult::Launched { output, .. } => {
                assert!(output.expect("captured output").contains("flavour=salted"));
            }
            other => panic!("expected Launched, got {other:?}"),
        }
    }

    #[test]
    fn classifies_nonzero_exit() {
        let env = HashMap::new();
        let result = launch(
            "echo about to fail; exit 3",
            &options(&env),
            deadline_in(Duration::from_secs(5)),
            Duration::from_millis(10),
        )
        .expect("launch");
        match result {
            LaunchResult::Failed { output, status, .. } => {
                assert!(output.expect("captured output").contains("about to fail"));
                assert_eq!(exit_status_suffix(status), "exited with status 3");
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn reports_deadline_without_killing() {
        let env = HashMap::new();
        let result = launch(
            "sleep 5",
            &options(&env),
            deadline_in(Duration::from_millis(150)),
            Duration::from_millis(10),
        )
        .expect("launch");
        match result {
            LaunchResult::SpawnTimedOut { pid, .. } => {
                // The child must still be alive; clean it up ourselves.
                assert_eq!(
                    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None),
                    Ok(())
                );
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(pid),
                    nix::sys::signal::Signal::SIGKILL,
                );
                let _ = nix::sys::wait::waitpid(nix::unistd::Pid::from_raw(pid), None);
            }
            other => panic!("expected SpawnTimedOut, got {other:?}"),
        }
    }

    #[test]
    fn daemonized_child_exits_immediately() {
        let env = HashMap::new();
        let launch_options = LaunchOptions {
            env: &env,
            keep_fds: &[],
            daemonize: true,
            capture_output: true,
        };
        // Without daemonization this would block for 5 seconds; the double
        // fork lets the immediate child exit right away.
        let started = Instant::now();
        let result = launch(
            "sleep 5",
            &launch_options,
            deadline_in(Duration::from_secs(2)),
            Duration::from_millis(10),
        )
        .expect("launch");
        assert!(matches!(result, LaunchResult::Launched { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn signal_suffix_names_the_signal() {
        let env = HashMap::new();
        let result = launch(
            "kill -TERM $$",
            &options(&env),
            deadline_in(Duration::from_secs(5)),
            Duration::from_millis(10),
        )
        .expect("launch");
        match result {
            LaunchResult::Failed { status, .. } => {
                assert_eq!(
                    exit_status_suffix(status),
                    "terminated with signal SIGTERM"
                );
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }
}
