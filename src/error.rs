//! Error types for gearman-client.
//!
//! Every fallible operation in the crate returns a value of the closed
//! [`Error`] set, never a panic. Two predicates are canonical across the
//! API:
//!
//! - [`failed`]: the operation hit a terminal error (`IoWait` is not
//!   terminal, it means "poll and retry").
//! - [`should_continue`]: the operation would block and the caller is
//!   expected to call `Session::wait` before retrying.

use thiserror::Error;

/// Main error type for all gearman operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The operation would block; call `Session::wait` and retry.
    ///
    /// Only surfaced in non-blocking mode. In blocking mode the engine
    /// polls internally and this never escapes.
    #[error("I/O wait")]
    IoWait,

    /// The session timeout expired inside a poll.
    #[error("timeout reached")]
    Timeout,

    /// `wait()` was called but no connection wants any event.
    #[error("no active file descriptors")]
    NoActiveFds,

    /// The remote end closed the connection or the socket errored out.
    #[error("lost connection")]
    LostConnection,

    /// An internal buffer could not be grown.
    #[error("memory allocation failure")]
    MemoryAllocationFailure,

    /// The 4-byte packet magic was not `\0REQ`, `\0RES`, or `\0TXT`.
    #[error("invalid packet magic")]
    InvalidMagic,

    /// The command code is not in the command table, or the command was
    /// built with the wrong argument arity.
    #[error("invalid command")]
    InvalidCommand,

    /// Packet framing violation: bad arity, oversized payload, or an
    /// embedded NUL in a non-data final argument.
    #[error("invalid packet")]
    InvalidPacket,

    /// The textual argument area exceeds the encoder's buffer cap.
    #[error("argument too large")]
    ArgumentTooLarge,

    /// An echo response did not match the request byte-for-byte.
    #[error("echo data corruption")]
    EchoDataCorruption,

    /// The server sent an `ERROR` packet.
    #[error("server error {code}: {text}")]
    ServerError {
        /// Server-assigned error code string.
        code: String,
        /// Human-readable error text.
        text: String,
    },

    /// An OS-level I/O error. The raw errno is recorded into the
    /// session's `last_errno` when this surfaces through a session call.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No address for the server could be connected to.
    #[error("could not connect")]
    CouldNotConnect,

    /// The connection refuses new outbound packets (draining for close,
    /// or a self-contained subroutine found queued sends in the way).
    #[error("send already in progress")]
    SendInProgress,

    /// A self-contained subroutine found a half-received inbound packet
    /// on the connection.
    #[error("receive already in progress")]
    RecvInProgress,

    /// The connection has no usable socket and cannot establish one.
    #[error("not connected")]
    NotConnected,

    /// A state machine observed an internally inconsistent resume.
    #[error("unknown state")]
    UnknownState,
}

impl Error {
    /// True for the cooperative would-block marker.
    #[inline]
    pub fn is_io_wait(&self) -> bool {
        matches!(self, Error::IoWait)
    }

    /// The raw OS errno when this error carries one.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Error::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Canonical failure predicate: an error other than `IoWait`.
#[inline]
pub fn failed<T>(result: &Result<T>) -> bool {
    matches!(result, Err(e) if !e.is_io_wait())
}

/// Canonical retry predicate: the operation returned `IoWait` and the
/// caller should `wait()` and call again.
#[inline]
pub fn should_continue<T>(result: &Result<T>) -> bool {
    matches!(result, Err(Error::IoWait))
}
