//! Liveness probes: answers "is the daemon connectable right now?".
//!
//! Every probe variant normalizes to one of two outcomes — up or down —
//! with anything else escalating as a probe error. "Down" deliberately
//! covers the whole family of connect-pending failures a daemon exhibits
//! while it is still binding its sockets.

use std::fmt;
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use socket2::{Domain, SockAddr, Socket, Type};

use crate::error::SupervisorError;

/// Bound on a single TCP or Unix-socket connect attempt.
const CONNECT_WAIT: Duration = Duration::from_millis(100);

/// Errno values a probe may report while the daemon is still coming up.
const CONNECT_PENDING_ERRNOS: [i32; 6] = [
    libc::ECONNREFUSED,
    libc::ENETUNREACH,
    libc::ETIMEDOUT,
    libc::ECONNRESET,
    libc::EINVAL,
    libc::EADDRNOTAVAIL,
];

/// Outcome of a single liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PingOutcome {
    /// The daemon accepted the probe.
    Up,
    /// The daemon is not connectable yet.
    Down,
}

/// Caller-supplied probe callable.
pub type ProbeFn = Box<dyn FnMut() -> io::Result<bool> + Send>;

/// Declarative liveness probe attached to a daemon handle.
pub enum PingSpec {
    /// Shell command; exit status zero means the daemon is up.
    Command(String),
    /// Bounded TCP connect.
    Tcp {
        /// Host name or address to connect to.
        host: String,
        /// TCP port.
        port: u16,
    },
    /// Bounded connect over an `AF_UNIX` stream socket.
    Unix {
        /// Socket path.
        path: PathBuf,
    },
    /// Caller-supplied callable.
    ///
    /// `Ok(true)` is up, `Ok(false)` is down, connect-pending errors
    /// (`ECONNREFUSED`, `ENETUNREACH`, `ETIMEDOUT`, `ECONNRESET`, `EINVAL`,
    /// `EADDRNOTAVAIL`) are down, anything else escalates. Any connection
    /// the callable opens is dropped — and thereby closed — inside the
    /// callable itself; use [`connect`](crate::DaemonHandle::connect) when
    /// the connection should be handed back instead.
    Callable(ProbeFn),
}

impl PingSpec {
    /// Shell-command probe.
    pub fn command(command: impl Into<String>) -> Self {
        Self::Command(command.into())
    }

    /// TCP connect probe.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Unix stream socket probe.
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::Unix { path: path.into() }
    }

    /// Caller-supplied probe.
    pub fn callable(probe: impl FnMut() -> io::Result<bool> + Send + 'static) -> Self {
        Self::Callable(Box::new(probe))
    }

    /// Runs the probe once.
    pub(crate) fn probe(&mut self) -> Result<PingOutcome, SupervisorError> {
        match self {
            Self::Command(command) => probe_command(command),
            Self::Tcp { host, port } => probe_tcp(host, *port),
            Self::Unix { path } => probe_unix(path),
            Self::Callable(callable) => match callable() {
                Ok(true) => Ok(PingOutcome::Up),
                Ok(false) => Ok(PingOutcome::Down),
                Err(error) if is_connect_pending(&error) => Ok(PingOutcome::Down),
                Err(source) => Err(SupervisorError::Probe { source }),
            },
        }
    }
}

impl fmt::Debug for PingSpec {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command(command) => formatter.debug_tuple("Command").field(command).finish(),
            Self::Tcp { host, port } => formatter
                .debug_struct("Tcp")
                .field("host", host)
                .field("port", port)
                .finish(),
            Self::Unix { path } => formatter.debug_struct("Unix").field("path", path).finish(),
            Self::Callable(_) => formatter.write_str("Callable(..)"),
        }
    }
}

/// Whether an IO error belongs to the connect-pending family.
///
/// Matched on the raw errno first; the `ErrorKind` fallback covers errors
/// synthesized without an OS code, such as the timeout from
/// `connect_timeout`.
pub(crate) fn is_connect_pending(error: &io::Error) -> bool {
    if let Some(code) = error.raw_os_error() {
        return CONNECT_PENDING_ERRNOS.contains(&code);
    }
    matches!(
        error.kind(),
        ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::TimedOut
            | ErrorKind::AddrNotAvailable
    )
}

fn probe_command(command: &str) -> Result<PingOutcome, SupervisorError> {
    let status = Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|source| SupervisorError::Spawn {
            command: command.to_owned(),
            source,
        })?;
    if status.success() {
        Ok(PingOutcome::Up)
    } else {
        Ok(PingOutcome::Down)
    }
}

fn probe_tcp(host: &str, port: u16) -> Result<PingOutcome, SupervisorError> {
    let addresses: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|source| SupervisorError::Probe { source })?
        .collect();
    let Some(first) = addresses.first().copied() else {
        return Ok(PingOutcome::Down);
    };
    match connect_tcp(first) {
        Err(error) if error.raw_os_error() == Some(libc::EAFNOSUPPORT) => {
            // The host supports only the other address family; try it once.
            match addresses
                .iter()
                .find(|address| address.is_ipv4() != first.is_ipv4())
            {
                Some(other) => classify_connect(connect_tcp(*other)),
                None => Ok(PingOutcome::Down),
            }
        }
        result => classify_connect(result),
    }
}

fn connect_tcp(address: SocketAddr) -> io::Result<()> {
    let socket = Socket::new(Domain::for_address(address), Type::STREAM, None)?;
    socket.connect_timeout(&SockAddr::from(address), CONNECT_WAIT)
}

fn probe_unix(path: &Path) -> Result<PingOutcome, SupervisorError> {
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)
        .map_err(|source| SupervisorError::Probe { source })?;
    let address = SockAddr::unix(path).map_err(|source| SupervisorError::Probe { source })?;
    classify_connect(socket.connect_timeout(&address, CONNECT_WAIT))
}

fn classify_connect(result: io::Result<()>) -> Result<PingOutcome, SupervisorError> {
    match result {
        Ok(()) => Ok(PingOutcome::Up),
        // NotFound covers a Unix socket path that is not there yet.
        Err(error) if error.kind() == ErrorKind::NotFound || is_connect_pending(&error) => {
            Ok(PingOutcome::Down)
        }
        Err(source) => Err(SupervisorError::Probe { source }),
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use rstest::rstest;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn tcp_probe_tracks_listener() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind listener");
        let port = listener.local_addr().expect("local addr").port();
        let mut spec = PingSpec::tcp("127.0.0.1", port);
        assert_eq!(spec.probe().expect("probe"), PingOutcome::Up);
        drop(listener);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(spec.probe().expect("probe"), PingOutcome::Down);
    }

    #[cfg(unix)]
    #[test]
    fn unix_probe_tracks_listener() {
        use std::os::unix::net::UnixListener;

        let dir = TempDir::new().expect("temp dir");
        let socket_path = dir.path().join("daemon.sock");
        let mut spec = PingSpec::unix(&socket_path);
        // Socket file does not exist yet.
        assert_eq!(spec.probe().expect("probe"), PingOutcome::Down);
        let listener = UnixListener::bind(&socket_path).expect("bind unix listener");
        assert_eq!(spec.probe().expect("probe"), PingOutcome::Up);
        drop(listener);
    }

    #[test]
    fn command_probe_maps_exit_status() {
        let mut up = PingSpec::command("exit 0");
        assert_eq!(up.probe().expect("probe"), PingOutcome::Up);
        let mut down = PingSpec::command("exit 3");
        assert_eq!(down.probe().expect("probe"), PingOutcome::Down);
    }

    #[test]
    fn callable_probe_maps_returns_and_errors() {
        let mut up = PingSpec::callable(|| Ok(true));
        assert_eq!(up.probe().expect("probe"), PingOutcome::Up);
        let mut down = PingSpec::callable(|| Ok(false));
        assert_eq!(down.probe().expect("probe"), PingOutcome::Down);
        let mut pending =
            PingSpec::callable(|| Err(io::Error::from_raw_os_error(libc::ECONNREFUSED)));
        assert_eq!(pending.probe().expect("probe"), PingOutcome::Down);
        let mut broken = PingSpec::callable(|| {
            Err(io::Error::new(ErrorKind::PermissionDenied, "not allowed"))
        });
        assert!(matches!(
            broken.probe(),
            Err(SupervisorError::Probe { .. })
        ));
    }

    #[rstest]
    #[case::econnrefused(libc::ECONNREFUSED, true)]
    #[case::enetunreach(libc::ENETUNREACH, true)]
    #[case::etimedout(libc::ETIMEDOUT, true)]
    #[case::econnreset(libc::ECONNRESET, true)]
    #[case::einval(libc::EINVAL, true)]
    #[case::eaddrnotavail(libc::EADDRNOTAVAIL, true)]
    #[case::eperm(libc::EPERM, false)]
    #[case::enoent(libc::ENOENT, false)]
    fn connect_pending_errno_table(#[case] errno: i32, #[case] expected: bool) {
        let error = io::Error::from_raw_os_error(errno);
        assert_eq!(is_connect_pending(&error), expected);
    }

    #[test]
    fn connect_pending_falls_back_to_error_kind() {
        let error = io::Error::new(ErrorKind::TimedOut, "connection timed out");
        assert!(is_connect_pending(&error));
        let error = io::Error::new(ErrorKind::PermissionDenied, "denied");
        assert!(!is_connect_pending(&error));
    }
}
