//! Error types shared by the client, the supervisor and the wire codec.
//!
//! All fallible operations return `Result<T, RingneckError>`.
//! No panics on malformed input; every error is typed and recoverable.

use thiserror::Error;

/// The canonical error type for ringneck.
#[derive(Debug, Error)]
pub enum RingneckError {
    // ── Protocol errors ──────────────────────────────────────────
    /// A tag byte on the wire did not name any known frame kind.
    #[error("unknown frame tag: {0:#04x}")]
    UnknownTag(u8),

    /// The byte stream ended in the middle of a frame.
    #[error("unexpected end of stream inside a frame")]
    UnexpectedEof,

    /// A frame declared a payload larger than the codec accepts.
    #[error("frame payload too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// A frame violated protocol rules.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    // ── Serialization errors ─────────────────────────────────────
    /// Encoding or decoding of an invocation payload failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    // ── Connection errors ────────────────────────────────────────
    /// The socket or filesystem layer reported an error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// Another supervisor already owns the socket.
    #[error("supervisor already running")]
    AlreadyRunning,

    // ── Execution errors ─────────────────────────────────────────
    /// The requested executable could not be started.
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    /// The client went away before the child finished.
    #[error("run was cancelled")]
    Cancelled,

    /// A replay key did not parse or matched no stored run.
    #[error("Invalid key")]
    InvalidKey,

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl From<String> for RingneckError {
    fn from(s: String) -> Self {
        RingneckError::Other(s)
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for RingneckError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        RingneckError::ChannelClosed
    }
}

impl From<Box<bincode::ErrorKind>> for RingneckError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        RingneckError::Encoding(e.to_string())
    }
}
