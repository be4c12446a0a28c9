//! The crate-wide error type and the error kinds it can take on.
//!
//! Every subsystem (storage map, tracker manager, peer exchange) reports
//! through this one taxonomy rather than a per-module error type, so
//! callers composing the three can propagate with a single `?`.

use std::fmt;
use std::io;

/// A specialized `Result` type used throughout the crate, analogous to
/// `std::io::Result`.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The taxonomy of errors this engine can produce, spanning storage,
/// tracker RPC and peer protocol failures.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    // --- storage map / piece store ---
    /// A read was attempted past the end of the storage map.
    OutOfRange,
    /// A file's mapped size did not match its expected size; all
    /// successfully mapped regions were rolled back before returning this.
    FileSizeMismatch,
    /// A piece index outside `0..piece_count` was used.
    InvalidPieceIndex,
    /// Underlying filesystem or mapping I/O error.
    Io(io::Error),

    // --- UDP tracker manager ---
    /// The tracker URI has no authority (host) component.
    HostUnknown,
    /// Resolving the tracker's host failed.
    HostLookupFailed,
    /// The tracker URI's scheme was not `udp:`.
    UnrecognizedScheme,
    /// Retransmission was exhausted without a response; carries the last
    /// (unused) timeout that would have been waited on next.
    TimeoutExpired(u64),
    /// The tracker replied with an action that didn't match the request.
    UnexpectedResponse {
        expected: &'static str,
        actual: &'static str,
    },
    /// The tracker replied with an explicit error message (BEP-15 action 3).
    QueryFailed(String),
    /// The manager was closed while this call was outstanding, or was
    /// already closed when the call was made.
    ManagerClosed,

    // --- peer exchange ---
    /// The peer connection ended (EOF, socket error, or local disconnect).
    PeerDisconnected,
    /// The peer violated the wire protocol; the session must terminate.
    ProtocolError(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfRange => write!(f, "read or write beyond end of storage map"),
            Self::FileSizeMismatch => {
                write!(f, "mapped file size did not match expected size")
            }
            Self::InvalidPieceIndex => write!(f, "piece index out of bounds"),
            Self::Io(e) => write!(f, "i/o error: {}", e),
            Self::HostUnknown => write!(f, "tracker uri has no host"),
            Self::HostLookupFailed => write!(f, "tracker host lookup failed"),
            Self::UnrecognizedScheme => write!(f, "tracker uri scheme is not udp:"),
            Self::TimeoutExpired(secs) => {
                write!(f, "retransmission timed out after {} seconds", secs)
            }
            Self::UnexpectedResponse { expected, actual } => write!(
                f,
                "tracker returned action {} but {} was expected",
                actual, expected
            ),
            Self::QueryFailed(msg) => write!(f, "tracker returned error: {}", msg),
            Self::ManagerClosed => write!(f, "tracker manager is closed"),
            Self::PeerDisconnected => write!(f, "peer disconnected"),
            Self::ProtocolError(doc) => write!(f, "peer protocol error: {}", doc),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<tokio::time::Elapsed> for Error {
    fn from(_: tokio::time::Elapsed) -> Self {
        // an internal await timed out without going through the
        // retransmission bookkeeping; treat it as an immediate expiry
        Self::TimeoutExpired(0)
    }
}
