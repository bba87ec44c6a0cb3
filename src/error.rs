//! Error types for ranchwire.

use thiserror::Error;

use crate::server::ClientId;

/// Main error type for all transport operations.
#[derive(Debug, Error)]
pub enum RanchwireError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration parse error.
    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),

    /// Protocol violation (bad magic id/length, oversize frame, etc.).
    ///
    /// Fatal to the offending connection, never to the process.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A buffer read, write, or seek would pass the end of its region.
    ///
    /// The operation is atomic: nothing was consumed or written.
    #[error("buffer overflow: needed {requested} bytes at offset {position}, capacity {capacity}")]
    Overflow {
        /// Bytes the operation needed.
        requested: usize,
        /// Cursor position when the operation was attempted.
        position: usize,
        /// Bound the operation ran against: the capacity for writes, the
        /// written extent for reads.
        capacity: usize,
    },

    /// Payload could not be decoded into the registered message type.
    #[error("decode error: {0}")]
    Decode(String),

    /// No live connection with the given id.
    ///
    /// Expected when a client disconnects concurrently with an outbound
    /// send; callers must tolerate it.
    #[error("no connection with id {0}")]
    UnknownClient(ClientId),

    /// Connection closed unexpectedly.
    #[error("connection closed")]
    ConnectionClosed,

    /// Write queue stayed full past the configured timeout.
    #[error("backpressure timeout")]
    BackpressureTimeout,

    /// No bytes arrived within the configured idle read timeout.
    #[error("read timeout")]
    ReadTimeout,
}

/// Result type alias using RanchwireError.
pub type Result<T> = std::result::Result<T, RanchwireError>;
