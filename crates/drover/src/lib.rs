//! Supervision for a single external local daemon.
//!
//! `drover` starts a daemon on demand, stops it, answers "is it running?",
//! and serializes those operations across every thread and process that
//! shares the same daemon identity — without pulling in a full process
//! monitor. A handle is described once (commands, PID file, log file,
//! liveness probe) and then drives the daemon through a race-free
//! start/stop state machine:
//!
//! - starts are bounded by a wall-clock deadline *and* a log-activity
//!   watchdog, so a daemon that forked and then died silently is told apart
//!   from one that is merely slow;
//! - a half-started daemon is always put down (SIGTERM, bounded wait,
//!   SIGKILL) before a timeout surfaces;
//! - [`DaemonHandle::connect`] is connect-or-start: many readers probe a
//!   running daemon in parallel under a shared file lock, and at most one
//!   writer ever starts it under the exclusive lock;
//! - output the daemon writes before redirecting its standard channels is
//!   captured and woven into failure messages together with the log diff.
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use drover::{DaemonHandle, PingSpec};
//!
//! let handle = DaemonHandle::builder("echo-server")
//!     .start_command("echo-server --daemonize --port 3230")
//!     .ping_spec(PingSpec::tcp("127.0.0.1", 3230))
//!     .pid_file("/tmp/echo-server.pid")
//!     .log_file("/tmp/echo-server.log")
//!     .start_timeout(Duration::from_secs(15))
//!     .build()?;
//!
//! handle.start()?;
//! assert!(handle.running()?);
//! handle.stop()?;
//! # Ok::<(), drover::SupervisorError>(())
//! ```
//!
//! The library is Unix-only: it leans on `flock`, `kill`, `waitpid` and
//! `fork`/`setsid` semantics. It emits `tracing` events and installs no
//! subscriber of its own.

mod config;
mod error;
mod launcher;
mod lock;
mod log_watcher;
mod pid_file;
mod probe;
mod process;
mod supervisor;

pub use config::{
    CommandSource, DEFAULT_LOG_ACTIVITY_TIMEOUT, DEFAULT_PING_INTERVAL,
    DEFAULT_START_ABORT_TIMEOUT, DEFAULT_START_TIMEOUT, DEFAULT_STOP_TIMEOUT, DaemonHandleBuilder,
};
pub use error::SupervisorError;
pub use probe::{PingSpec, ProbeFn};
pub use process::{ProcessControl, SystemProcesses};
pub use supervisor::DaemonHandle;

pub use nix::sys::signal::Signal;

pub(crate) const TRACE_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::supervise");
