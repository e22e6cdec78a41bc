//! Error taxonomy for the exchange.
//!
//! Transient conditions (short writes, interrupted syscalls) are absorbed
//! inside the framing loops. Everything else reaches the caller as an
//! `ExchangeError`, tagged with the operation that failed.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ExchangeError>;

/// The operation an error is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Bind,
    Listen,
    Accept,
    Connect,
    Read,
    Write,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Bind => "bind",
            Operation::Listen => "listen",
            Operation::Accept => "accept",
            Operation::Connect => "connect",
            Operation::Read => "read",
            Operation::Write => "write",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by the listener, connector and frame codec.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("address {addr} is already in use")]
    AddressInUse { addr: SocketAddr },

    #[error("permission denied for {op} on {addr}")]
    PermissionDenied { op: Operation, addr: SocketAddr },

    /// `target` is the resolved address, or `host:port` when resolving
    /// itself used up the deadline.
    #[error("connect to {target} timed out after {timeout:?}")]
    ConnectTimeout { target: String, timeout: Duration },

    #[error("connection to {addr} refused")]
    ConnectionRefused { addr: SocketAddr },

    #[error("host {addr} is unreachable")]
    HostUnreachable { addr: SocketAddr },

    /// The peer ended the stream. `transferred` counts the bytes of the
    /// current frame that made it across first; zero means none did.
    #[error("connection closed by peer after {transferred} byte(s) of frame")]
    ConnectionClosed { transferred: usize },

    #[error("{op} interrupted {attempts} times in a row")]
    Interrupted { op: Operation, attempts: u32 },

    #[error("{op} failed, resources exhausted: {source}")]
    ResourceExhausted {
        op: Operation,
        #[source]
        source: io::Error,
    },

    #[error("{op} timed out after {timeout:?}")]
    TimedOut { op: Operation, timeout: Duration },

    #[error("{op} cancelled")]
    Cancelled { op: Operation },

    #[error("close-delimited framing cannot carry an empty message")]
    EmptyCloseDelimited,

    #[error("frame of {length} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { length: usize, max: usize },

    #[error("cannot {op} while {state}")]
    InvalidState { op: Operation, state: &'static str },

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("{op} failed: {source}")]
    Io {
        op: Operation,
        #[source]
        source: io::Error,
    },
}

impl ExchangeError {
    /// True when the peer ended the stream partway through a frame.
    pub fn is_mid_frame_close(&self) -> bool {
        matches!(self, ExchangeError::ConnectionClosed { transferred } if *transferred > 0)
    }

    /// Classify an I/O error from a socket-level operation against `addr`.
    ///
    /// Used for bind, listen, accept and connect, where the address is known.
    pub fn classify(op: Operation, addr: SocketAddr, err: io::Error) -> Self {
        if is_resource_exhausted(&err) {
            return ExchangeError::ResourceExhausted { op, source: err };
        }
        if is_host_unreachable(&err) {
            return ExchangeError::HostUnreachable { addr };
        }

        match err.kind() {
            io::ErrorKind::AddrInUse => ExchangeError::AddressInUse { addr },
            io::ErrorKind::PermissionDenied => ExchangeError::PermissionDenied { op, addr },
            io::ErrorKind::ConnectionRefused => ExchangeError::ConnectionRefused { addr },
            io::ErrorKind::AddrNotAvailable => {
                ExchangeError::InvalidAddress(format!("{addr} is not a local address"))
            }
            _ => ExchangeError::Io { op, source: err },
        }
    }

    /// Classify an I/O error from reading or writing a connection.
    ///
    /// `transferred` is how much of the current frame had crossed, so that a
    /// reset mid-frame is reported with the same shape as an orderly close.
    pub fn from_stream(op: Operation, transferred: usize, err: io::Error) -> Self {
        if is_resource_exhausted(&err) {
            return ExchangeError::ResourceExhausted { op, source: err };
        }

        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::WriteZero => ExchangeError::ConnectionClosed { transferred },
            _ => ExchangeError::Io { op, source: err },
        }
    }
}

#[cfg(unix)]
fn is_resource_exhausted(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

#[cfg(not(unix))]
fn is_resource_exhausted(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::OutOfMemory
}

#[cfg(unix)]
fn is_host_unreachable(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EHOSTUNREACH | libc::ENETUNREACH)
    )
}

#[cfg(not(unix))]
fn is_host_unreachable(_err: &io::Error) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:5001".parse().unwrap()
    }

    #[test]
    fn test_classify_socket_errors() {
        let err = ExchangeError::classify(
            Operation::Bind,
            addr(),
            io::Error::from(io::ErrorKind::AddrInUse),
        );
        assert!(matches!(err, ExchangeError::AddressInUse { .. }));

        let err = ExchangeError::classify(
            Operation::Bind,
            addr(),
            io::Error::from(io::ErrorKind::PermissionDenied),
        );
        assert!(matches!(
            err,
            ExchangeError::PermissionDenied {
                op: Operation::Bind,
                ..
            }
        ));

        let err = ExchangeError::classify(
            Operation::Connect,
            addr(),
            io::Error::from(io::ErrorKind::ConnectionRefused),
        );
        assert!(matches!(err, ExchangeError::ConnectionRefused { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_classify_errno() {
        let err = ExchangeError::classify(
            Operation::Connect,
            addr(),
            io::Error::from_raw_os_error(libc::EHOSTUNREACH),
        );
        assert!(matches!(err, ExchangeError::HostUnreachable { .. }));

        let err = ExchangeError::classify(
            Operation::Accept,
            addr(),
            io::Error::from_raw_os_error(libc::EMFILE),
        );
        assert!(matches!(
            err,
            ExchangeError::ResourceExhausted {
                op: Operation::Accept,
                ..
            }
        ));
    }

    #[test]
    fn test_stream_errors_become_closed() {
        let err = ExchangeError::from_stream(
            Operation::Read,
            7,
            io::Error::from(io::ErrorKind::ConnectionReset),
        );
        assert!(matches!(err, ExchangeError::ConnectionClosed { transferred: 7 }));
        assert!(err.is_mid_frame_close());

        let err = ExchangeError::from_stream(
            Operation::Write,
            0,
            io::Error::from(io::ErrorKind::BrokenPipe),
        );
        assert!(matches!(err, ExchangeError::ConnectionClosed { transferred: 0 }));
        assert!(!err.is_mid_frame_close());
    }

    #[test]
    fn test_display() {
        let err = ExchangeError::TimedOut {
            op: Operation::Read,
            timeout: Duration::from_secs(2),
        };
        assert_eq!(err.to_string(), "read timed out after 2s");
    }
}
