//! Identity and scope primitives shared by every other module.
//!
//! `Uid` and `Cid` replace the teacher's bare `String`/`u64` ids
//! (`srpc::mux` keyed streams by a raw `u64`) with small typed wrappers, and
//! `Scope` wraps a [`tokio_util::sync::CancellationToken`] the way
//! `srpc::rpc::Context` wrapped cancellation for a single call, generalised
//! to the whole root -> service -> per-call hierarchy described for the
//! concurrency model.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio_util::sync::CancellationToken;

/// Identifies one actor instance: a logical name plus a random instance id.
///
/// The logical `name` is what other actors and the arbiter address; the
/// `instance` disambiguates restarts of an actor under the same name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uid {
    pub name: String,
    pub instance: String,
}

impl Uid {
    pub fn new(name: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance: instance.into(),
        }
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.instance)
    }
}

/// Identifies one RPC conversation multiplexed over a channel.
///
/// Ordering between envelopes sharing a `Cid` is preserved by the channel;
/// envelopes under different `Cid`s may interleave freely.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cid {
    pub caller_name: String,
    pub caller_instance: String,
    pub conversation_id: String,
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.caller_name, self.caller_instance, self.conversation_id)
    }
}

/// Monotonic per-process counter used to mint unique conversation ids.
///
/// A `Cid` only needs to be unique among conversations a single caller has
/// open at once, so a process-local counter (rather than a UUID) keeps the
/// wire payload small.
static CONVERSATION_COUNTER: AtomicU64 = AtomicU64::new(0);

impl Cid {
    pub fn new(caller: &Uid) -> Self {
        let n = CONVERSATION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self {
            caller_name: caller.name.clone(),
            caller_instance: caller.instance.clone(),
            conversation_id: n.to_string(),
        }
    }
}

/// A node in the cancellation hierarchy: root scope, per-service scope, or
/// per-RPC scope.
///
/// Cancelling a `Scope` cancels every descendant `Scope` derived from it via
/// [`Scope::child`], mirroring the nursery rule that a parent is not
/// considered finished until every child scope has unwound.
#[derive(Debug, Clone)]
pub struct Scope {
    token: CancellationToken,
}

impl Scope {
    /// Create a new root scope with no parent.
    pub fn root() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Derive a child scope. Cancelling `self` also cancels the child;
    /// cancelling the child never affects `self`.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once this scope (or an ancestor) is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Run `fut` to completion, bypassing cancellation of this scope.
    ///
    /// Used for the debug mutex and other cleanup that must finish even when
    /// the scope that spawned it is being torn down.
    pub async fn shielded<F: std::future::Future>(&self, fut: F) -> F::Output {
        fut.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uid_display() {
        let u = Uid::new("worker", "abc123");
        assert_eq!(u.to_string(), "worker/abc123");
    }

    #[test]
    fn test_cid_unique_per_caller() {
        let caller = Uid::new("root", "i0");
        let a = Cid::new(&caller);
        let b = Cid::new(&caller);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_scope_child_cancellation_propagates() {
        let root = Scope::root();
        let child = root.child();
        assert!(!child.is_cancelled());
        root.cancel();
        child.cancelled().await;
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn test_scope_cancel_does_not_propagate_upward() {
        let root = Scope::root();
        let child = root.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!root.is_cancelled());
    }
}
