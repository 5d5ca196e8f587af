//! Domain-specific error types for the CTIP/2.0 protocol.
//!
//! All fallible operations return `Result<T, CtipError>`.
//! No panics on wire input — every error is typed and recoverable.

use std::time::Duration;
use thiserror::Error;

/// Terminal state of an aborted transcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortState {
    /// Output flushed so far is usable (graceful abort).
    PartiallyReadable,
    /// Output must be discarded (forced abort).
    Broken,
}

impl std::fmt::Display for AbortState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PartiallyReadable => write!(f, "partially readable"),
            Self::Broken => write!(f, "broken"),
        }
    }
}

/// The canonical error type for the CTIP protocol.
#[derive(Debug, Error)]
pub enum CtipError {
    // ── Session Errors ───────────────────────────────────────────
    /// The server rejected the supplied credentials (`"NG \n"`).
    #[error("authentication failed")]
    AuthenticationFailed,

    /// A peer violated protocol rules. Fatal; the connection is torn down.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// A packet type byte did not map to any known packet.
    #[error("unknown {direction} packet type: {value:#04x}")]
    UnknownPacket {
        direction: &'static str,
        value: u8,
    },

    /// The peer requested an unsupported protocol version.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    /// The in-flight transcode was aborted by ABORT from the peer.
    #[error("transcode aborted ({state}): [{code:#06x}] {message}")]
    TranscodeAborted {
        state: AbortState,
        code: u16,
        message: String,
        args: Vec<String>,
    },

    /// The resolver could not supply a requested resource. Non-fatal;
    /// the far side continues without it.
    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    /// An operation was invoked in a session state that forbids it.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    // ── Transport Errors ─────────────────────────────────────────
    /// An exact-count read or drain-write exceeded its deadline.
    /// Fatal to the connection; retry needs a fresh session.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The connection closed before an exact-count read completed.
    #[error("unexpected end of stream")]
    UnexpectedEof,

    /// A frame declared a payload length outside the accepted range.
    #[error("invalid frame length: {0} bytes")]
    InvalidFrameLength(i64),

    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    /// The TLS record engine reported an error.
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    /// An internal channel between engine and processor closed early.
    #[error("channel closed")]
    ChannelClosed,

    // ── Encoding Errors ──────────────────────────────────────────
    /// A string could not be represented in the session charset, or a
    /// string body exceeded the 2-byte length prefix.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// A server URI could not be parsed.
    #[error("invalid server uri: {0}")]
    InvalidUri(String),
}
