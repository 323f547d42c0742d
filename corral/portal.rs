//! Client handle to a remote actor.
//!
//! Grounded on `srpc::client::SrpcClient` (the caller-facing wrapper around
//! a channel/stream pair), generalised from a single bidirectional stream
//! per call to the multiplexed [`Channel`] this runtime uses, and extended
//! with `result()`/`cancel_actor()` for the nursery's supervision needs.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::future::Shared;
use futures::stream::BoxStream;
use futures::FutureExt;

use crate::channel::Channel;
use crate::context::Uid;
use crate::error::{Error, Result};
use crate::proto::{StructValue, Value};
use crate::registry::YieldResult;

/// The reserved namespace for actor-lifecycle operations (cancellation,
/// the `run_in_actor` main-task result) that every actor serves regardless
/// of its user-registered [`crate::registry::Registry`].
pub const SYSTEM_NS: &str = "__system__";
pub const SYSTEM_CANCEL: &str = "cancel";
pub const SYSTEM_MAIN: &str = "main";
/// Streaming call that acquires the shared debug mutex; see
/// [`crate::debug_mutex`].
pub const SYSTEM_ACQUIRE_TTY: &str = "acquire_tty";

type MainFuture = Shared<Pin<Box<dyn Future<Output = Result<Value>> + Send>>>;

/// A handle to a remote actor reachable over `channel`.
#[derive(Clone)]
pub struct Portal {
    channel: Arc<Channel>,
    main: Option<MainFuture>,
}

impl Portal {
    pub fn new(channel: Arc<Channel>) -> Self {
        Self { channel, main: None }
    }

    /// Attaches the in-flight "main task" call so [`Portal::result`] can
    /// await it. Used by [`crate::nursery::Nursery::run_in_actor`].
    pub fn with_main_task(mut self, kwargs: StructValue) -> Self {
        let channel = Arc::clone(&self.channel);
        let fut: Pin<Box<dyn Future<Output = Result<Value>> + Send>> =
            Box::pin(async move { channel.call_unary(SYSTEM_NS, SYSTEM_MAIN, kwargs).await });
        self.main = Some(fut.shared());
        self
    }

    pub fn peer_uid(&self) -> &Uid {
        self.channel.peer_uid()
    }

    /// Invokes a unary remote function and awaits its single result.
    pub async fn call(&self, ns: &str, func: &str, kwargs: StructValue) -> Result<Value> {
        self.channel.call_unary(ns, func, kwargs).await
    }

    /// Invokes a streaming remote function, returning a lazy sequence of
    /// yielded values terminated by the peer's `Stop`. Dropping the
    /// returned stream before it reaches `Stop` sends `{cancel}` for its
    /// `cid`, so an abandoned sequence doesn't run forever on the peer.
    pub async fn call_stream(
        &self,
        ns: &str,
        func: &str,
        kwargs: StructValue,
    ) -> Result<BoxStream<'static, YieldResult>> {
        self.channel.call_stream(ns, func, kwargs).await
    }

    /// Waits for the remote actor's main task (started via
    /// [`Portal::with_main_task`]) to complete.
    pub async fn result(&self) -> Result<Value> {
        match &self.main {
            Some(fut) => fut.clone().await,
            None => Err(Error::Protocol("portal has no attached main task".into())),
        }
    }

    /// Asks the peer to cancel its root scope, then closes the channel.
    pub async fn cancel_actor(&self) -> Result<()> {
        let _ = self.channel.call_unary(SYSTEM_NS, SYSTEM_CANCEL, StructValue::new()).await;
        self.channel.cancel();
        Ok(())
    }
}
