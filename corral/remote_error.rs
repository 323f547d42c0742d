//! Values conveying a failure that originated in a different actor.
//!
//! Grounded on `srpc::error::Error::Remote(String)`, generalised from a bare
//! string to the structured `{origin_uid, kind, message, traceback}` shape
//! the specification requires so the arbiter and nursery can attribute a
//! failure to the actor that raised it.

use std::fmt;

use crate::context::Uid;

/// A failure that was raised inside a peer actor and marshalled back to us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    /// uid of the actor that raised the error.
    pub origin_uid: Uid,
    /// Coarse category, e.g. `"AssertionError"`, `"Panic"`, `"FuncNotFound"`.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// Free-form diagnostic text (a formatted backtrace, if available).
    pub traceback: String,
}

impl RemoteError {
    pub fn new(
        origin_uid: Uid,
        kind: impl Into<String>,
        message: impl Into<String>,
        traceback: impl Into<String>,
    ) -> Self {
        Self {
            origin_uid,
            kind: kind.into(),
            message: message.into(),
            traceback: traceback.into(),
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} raised {}: {}", self.origin_uid, self.kind, self.message)
    }
}

/// Several siblings under one nursery failed concurrently.
///
/// Raised instead of a single [`RemoteError`] when more than one child of a
/// nursery fails within the same cancellation cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiRemoteError {
    pub errors: Vec<RemoteError>,
}

impl MultiRemoteError {
    pub fn new(errors: Vec<RemoteError>) -> Self {
        Self { errors }
    }
}

impl fmt::Display for MultiRemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} siblings failed: ", self.errors.len())?;
        for (i, e) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{e}")?;
        }
        Ok(())
    }
}
