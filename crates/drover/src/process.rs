//! Thin capability over host process state.
//!
//! The supervisor signals, probes and reaps PIDs it did not necessarily
//! spawn. Routing those syscalls through [`ProcessControl`] keeps the state
//! machine testable against a fake host.

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

/// Host process operations the supervisor depends on.
#[cfg_attr(test, mockall::automock)]
pub trait ProcessControl: Send + Sync {
    /// Signal-0 liveness probe.
    ///
    /// A process owned by another user (`EPERM`) counts as alive; a missing
    /// process (`ESRCH`) does not. Other errors propagate.
    fn alive(&self, pid: i32) -> Result<bool, Errno>;

    /// Delivers `signal` to `pid`.
    fn send_signal(&self, pid: i32, signal: Signal) -> Result<(), Errno>;

    /// Non-blocking reap of a direct child.
    ///
    /// Returns `true` once the child has been collected, or when it was
    /// already reaped elsewhere (`ECHILD`); `false` while it is still
    /// running.
    fn try_reap(&self, pid: i32) -> Result<bool, Errno>;
}

/// [`ProcessControl`] backed by the real host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcesses;

impl ProcessControl for SystemProcesses {
    fn alive(&self, pid: i32) -> Result<bool, Errno> {
        match signal::kill(Pid::from_raw(pid), None) {
            Ok(()) | Err(Errno::EPERM) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(errno) => Err(errno),
        }
    }

    fn send_signal(&self, pid: i32, signal: Signal) -> Result<(), Errno> {
        signal::kill(Pid::from_raw(pid), signal)
    }

    fn try_reap(&self, pid: i32) -> Result<bool, Errno> {
        match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(false),
            Ok(_) => Ok(true),
            Err(Errno::ECHILD) => Ok(true),
            Err(errno) => Err(errno),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alive_reports_current_process() {
        let procs = SystemProcesses;
        let pid = i32::try_from(std::process::id()).expect("pid fits");
        assert_eq!(procs.alive(pid), Ok(true));
    }

    #[test]
    fn alive_reports_nonexistent_process() {
        let procs = SystemProcesses;
        // PIDs near the default pid_max are vanishingly unlikely to exist.
        assert_eq!(procs.alive(4_000_000), Ok(false));
    }

    #[test]
    fn try_reap_collects_exited_child() {
        use std::process::Command;

        let procs = SystemProcesses;
        let child = Command::new("/bin/true").spawn().expect("spawn /bin/true");
        let pid = i32::try_from(child.id()).expect("pid fits");
        // The child exits immediately; poll until WNOHANG observes it.
        let mut reaped = false;
        for _ in 0..50 {
            if procs.try_reap(pid).expect("waitpid") {
                reaped = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(reaped, "child was never reaped");
    }

    #[test]
    fn try_reap_tolerates_foreign_pid() {
        let procs = SystemProcesses;
        // Not our child: waitpid reports ECHILD, which counts as reaped.
        assert_eq!(procs.try_reap(1), Ok(true));
    }
}
