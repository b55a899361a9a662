//! Error types for the cache client.

use crate::protocol::Status;
use crate::types::NodeId;
use std::io;
use thiserror::Error;

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the cache client.
#[derive(Error, Debug)]
pub enum Error {
    /// Connect or per-receive deadline exceeded.
    #[error("operation timed out")]
    Timeout,

    /// The operation was cancelled before completing.
    #[error("operation cancelled")]
    Cancelled,

    /// Socket-level failure: I/O error, peer reset, or a zero-byte
    /// read/send on an open socket.
    #[error("connectivity failure: {0}")]
    Connectivity(String),

    /// The byte stream can no longer be trusted; the owning connection
    /// must be torn down.
    #[error("protocol corruption: {0}")]
    Protocol(#[from] ProtocolError),

    /// A well-formed response reporting a protocol-defined failure.
    #[error("server status: {0}")]
    ServerStatus(Status),

    /// A successful response whose payload violates the operation's
    /// contract (for example a counter result that is not 8 bytes).
    #[error("malformed result: {0}")]
    MalformedResult(String),

    /// Key/extra length exceeds protocol limits, or invalid configuration.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The key's node is dead and not yet due for a reconnect attempt.
    #[error("no healthy node for key (node {node} is dead)")]
    NoHealthyNode { node: NodeId },

    /// The cluster or node has been shut down.
    #[error("client shut down")]
    Shutdown,
}

/// Protocol-integrity violations. All of these are fatal to the
/// connection they were observed on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Response magic byte was not 0x81.
    #[error("bad magic byte: expected 0x81, got {0:#04x}")]
    BadMagic(u8),

    /// Header body-length arithmetic does not add up.
    #[error("body length {body_len} smaller than extra {extra_len} + key {key_len}")]
    BodyLengthMismatch {
        body_len: u32,
        extra_len: u8,
        key_len: u16,
    },

    /// Response body exceeds the configured maximum frame size.
    #[error("response body too large: {0} bytes")]
    BodyTooLarge(u32),

    /// A response arrived for a correlation id with no pending operation.
    #[error("unmatched correlation id {0}")]
    UnmatchedOpaque(u32),
}

impl Error {
    /// Whether this error must tear down the connection it occurred on.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            Error::Connectivity(_) | Error::Protocol(_) | Error::Timeout
        )
    }

    pub(crate) fn connectivity(e: io::Error) -> Self {
        Error::Connectivity(e.to_string())
    }
}
