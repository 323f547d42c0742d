//! Error types for the actor runtime.
//!
//! Mirrors the shape of a typical wire-RPC error module: one flat enum,
//! `thiserror`-derived, with a handful of `is_*` predicates for call sites
//! that only care about the error's category rather than its exact variant.

use thiserror::Error;

use crate::remote_error::{MultiRemoteError, RemoteError};

/// Errors that can occur anywhere in the actor runtime.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The underlying transport closed before the call completed.
    #[error("channel closed")]
    TransportClosed,

    /// Peer handshake failed (uid mismatch, timeout, or malformed frame).
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The RPC targeted a namespace this actor does not expose.
    #[error("module not exposed: {0}")]
    ModuleNotExposed(String),

    /// The RPC targeted a function the namespace does not implement.
    #[error("function not found: {0}.{1}")]
    FuncNotFound(String, String),

    /// A peer reported a failure for a context we were awaiting.
    #[error("remote error: {0}")]
    Remote(RemoteError),

    /// Several siblings under one nursery failed concurrently.
    #[error("{0}")]
    Multi(MultiRemoteError),

    /// The scope this task ran in was cancelled. Never surfaced as a real
    /// failure to user code that asked for the cancellation; only used to
    /// unwind scopes that did not ask for it.
    #[error("cancelled")]
    Cancelled,

    /// A bounded wait (handshake, stdio acquisition, nursery scope) expired.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Malformed envelope received on the wire.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// Frame exceeded the maximum configured size.
    #[error("message size {0} exceeds maximum {1}")]
    MessageTooLarge(usize, usize),

    /// Zero-length frame (protocol violation).
    #[error("unexpected zero length frame")]
    FrameSizeZero,

    /// I/O error from the transport.
    #[error("io error: {0}")]
    Io(String),

    /// Arbiter lookup found no registration for the requested name.
    #[error("no actor registered under name {0}")]
    NotRegistered(String),

    /// A context id was reused or otherwise violated protocol expectations.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<prost::DecodeError> for Error {
    fn from(e: prost::DecodeError) -> Self {
        Error::InvalidEnvelope(e.to_string())
    }
}

impl From<prost::EncodeError> for Error {
    fn from(e: prost::EncodeError) -> Self {
        Error::InvalidEnvelope(e.to_string())
    }
}

impl Error {
    /// True if this error should unwind a scope silently rather than be
    /// reported as a failure (an ancestor-requested cancellation).
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// True if this error indicates the channel or process is gone.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::TransportClosed | Error::Cancelled)
    }

    /// True if this error indicates a bounded wait expired.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    /// True if this error originated in a peer actor.
    pub fn is_remote(&self) -> bool {
        matches!(self, Error::Remote(_) | Error::Multi(_))
    }
}

/// Result type alias using the runtime's `Error` type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(Error::TransportClosed.to_string(), "channel closed");
        assert_eq!(
            Error::FuncNotFound("ns".into(), "f".into()).to_string(),
            "function not found: ns.f"
        );
    }

    #[test]
    fn test_error_predicates() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(Error::Cancelled.is_closed());
        assert!(!Error::TransportClosed.is_cancelled());
        assert!(Error::TransportClosed.is_closed());
        assert!(Error::Timeout(std::time::Duration::from_secs(1)).is_timeout());
        assert!(!Error::Cancelled.is_timeout());
    }
}
