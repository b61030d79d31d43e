//! Error taxonomy for the connection/channel/messaging core.
//!
//! Every fallible entry point in this crate returns `Result<T, PeerError>`.
//! The CLI/demo binary converts to `anyhow::Result` at its boundary, the way
//! a caller of a library usually does.

use std::fmt;

use thiserror::Error;

/// Errors produced by the peer, connection, channel and remote-cache layers.
#[derive(Error, Debug)]
pub enum PeerError {
    /// The connection is broken, closing, or never opened. Fatal for every
    /// pending request on every channel of that connection.
    #[error("connection exception: {0}")]
    Connection(String),

    /// The channel was closed while a request was pending. Fatal for that
    /// channel only.
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// The caller's timeout elapsed before a response arrived. The request
    /// itself was already sent; its response, if it ever arrives, is
    /// discarded.
    #[error("request timed out after {0:?}")]
    RequestTimeout(std::time::Duration),

    /// The server returned `failure = true`; this carries its remote
    /// exception back to the caller.
    #[error("remote exception ({code}): {message}")]
    Remote { code: i32, message: String },

    /// A synchronous argument-validation failure: duplicate channel id,
    /// unknown protocol, channel 0 reserved, and the like.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The operation is not supported at the negotiated protocol version,
    /// e.g. `truncate()` against a peer that only understands version 5.
    #[error("unsupported at negotiated protocol version {negotiated}: {what}")]
    UnsupportedAtVersion { what: String, negotiated: i32 },

    /// Encoding a message for the wire failed.
    #[error("encode failed: {0}")]
    Encode(String),

    /// Decoding a message read off the wire failed.
    #[error("decode failed: {0}")]
    Decode(String),

    /// The underlying transport reported an I/O failure.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PeerError {
    /// True for errors that should escalate to closing the whole
    /// connection: transport errors and channel-0 decode failures.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, PeerError::Connection(_) | PeerError::Io(_))
    }
}

/// A type alias matching the convention used across this crate's modules.
pub type Result<T> = std::result::Result<T, PeerError>;

/// Helper for constructing a `Protocol` error with a formatted message,
/// mirroring `anyhow!`'s ergonomics without pulling `anyhow` into library
/// code.
pub(crate) fn protocol_error(args: fmt::Arguments<'_>) -> PeerError {
    PeerError::Protocol(fmt::format(args))
}

macro_rules! protocol_bail {
    ($($arg:tt)*) => {
        return Err($crate::error::protocol_error(format_args!($($arg)*)))
    };
}

pub(crate) use protocol_bail;
