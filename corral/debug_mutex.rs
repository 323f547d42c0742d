//! FIFO-fair distributed lock serialising interactive debugger sessions
//! against the shared terminal.
//!
//! Grounded on `tokio::sync::Semaphore`'s documented FIFO wakeup order
//! (permits are handed to waiters in the order they requested one), used
//! here the way the teacher uses `tokio::sync::Mutex` to serialise writes
//! in `TransportPacketWriter`: a single shared primitive rather than a
//! hand-rolled queue.

use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::channel::Channel;
use crate::portal::{SYSTEM_ACQUIRE_TTY, SYSTEM_NS};
use crate::proto::{StructValue, Value};
use crate::registry::YieldResult;

/// Lives in the root actor's statespace. One instance per process tree.
#[derive(Clone)]
pub struct DebugMutex {
    sem: Arc<Semaphore>,
}

impl DebugMutex {
    pub fn new() -> Self {
        Self { sem: Arc::new(Semaphore::new(1)) }
    }

    /// Waits in FIFO order for exclusive access, then returns a guard.
    ///
    /// The caller holds the guard only as long as the debugger session
    /// lasts; the wait to acquire is ordinary (cancellable), but once held,
    /// callers are expected to run the holding task under
    /// [`crate::context::Scope::shielded`] so an ancestor's cancellation
    /// does not cut the session off mid-debug.
    pub async fn acquire(&self) -> DebugMutexGuard {
        let permit = Arc::clone(&self.sem)
            .acquire_owned()
            .await
            .expect("debug mutex semaphore never closed");
        DebugMutexGuard { _permit: permit }
    }
}

impl Default for DebugMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// Dropping this releases the lock, waking the next FIFO waiter.
pub struct DebugMutexGuard {
    _permit: OwnedSemaphorePermit,
}

enum AcquireState {
    Start(DebugMutex),
    Holding(DebugMutexGuard),
}

/// Body of the root actor's `acquire_tty` handler: acquires the lock,
/// streams back a single `"Locked"` value, then holds the guard until the
/// serving loop's per-call scope is cancelled (the requester's debugger
/// teardown sending `{cancel}` for this `cid`). Registered as a *shielded*
/// handler so ambient scope cancellation cannot cut the hold short — see
/// [`crate::registry::RpcHandler::is_shielded`].
pub fn acquire_stream(debug_mutex: DebugMutex) -> BoxStream<'static, YieldResult> {
    Box::pin(futures::stream::unfold(AcquireState::Start(debug_mutex), |state| async move {
        match state {
            AcquireState::Start(mutex) => {
                let guard = mutex.acquire().await;
                Some((Ok(Value::from("Locked")), AcquireState::Holding(guard)))
            }
            AcquireState::Holding(_guard) => {
                // Holds the guard alive until the serving loop cancels this
                // call's scope; that select always wins before this
                // resolves, so the pending future is never actually polled
                // to completion.
                std::future::pending::<()>().await
            }
        }
    }))
}

/// Body of a non-root actor's `acquire_tty` handler: forwards the request
/// one hop up the tree, towards the root that holds the real lock.
pub fn proxy_stream(parent: Arc<Channel>) -> BoxStream<'static, YieldResult> {
    futures::stream::once(async move { parent.call_stream(SYSTEM_NS, SYSTEM_ACQUIRE_TTY, StructValue::new()).await })
        .flat_map(|result| -> BoxStream<'static, YieldResult> {
            match result {
                Ok(stream) => stream,
                Err(e) => Box::pin(futures::stream::once(async move { Err(e) })),
            }
        })
        .boxed()
}
