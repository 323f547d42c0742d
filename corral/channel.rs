//! The message loop that multiplexes many RPC conversations over one
//! framed transport.
//!
//! Grounded on `srpc::rpc::CommonRpc` (per-call state machine: a queue of
//! incoming messages, a notify for wakeups, atomic completion tracking) and
//! `srpc::mux::Mux` (service/method routing), merged into one loop because
//! this runtime's `Cid` already carries the routing key a `Mux` would
//! otherwise reconstruct from separate service/method strings.
//!
//! A [`Channel`] is the caller-facing handle: `call_unary`/`call_stream`
//! open a new `Cid`, write the `CallRequest`, and hand back a future/stream
//! that the spawned message loop task feeds as replies arrive. The same
//! loop also dispatches `CallRequest`s arriving *from* the peer into the
//! local [`Registry`], making a `Channel` symmetric: both ends can call and
//! be called.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::warn;

use crate::context::{Cid, Scope, Uid};
use crate::envelope::{self, envelope_cid};
use crate::error::{Error, Result};
use crate::proto::{envelope::Body, StructValue, Value};
use crate::registry::{Registry, YieldResult};
use crate::remote_error::RemoteError;
use crate::transport::{EnvelopeReceiver, EnvelopeWriter};

/// A pending local call awaiting replies keyed by `Cid`.
enum Pending {
    Unary(oneshot::Sender<Result<Value>>),
    Stream(mpsc::Sender<YieldResult>),
}

struct ChannelState {
    pending: HashMap<Cid, Pending>,
    /// Scopes for calls the *peer* asked us to run, so an incoming `Cancel`
    /// can cancel the right one.
    inbound_scopes: HashMap<Cid, Scope>,
}

/// One multiplexed connection to a peer actor.
pub struct Channel {
    self_uid: Uid,
    peer_uid: Uid,
    writer: Arc<dyn EnvelopeWriter>,
    state: Mutex<ChannelState>,
    scope: Scope,
}

/// Sends `{cancel}` for a streaming call's `cid` if the stream carrying its
/// results is dropped before the call reached a terminal state on its own
/// (`Stop`, a terminal error item, or an explicit cancel already sent).
/// `open` is shared with the `unfold` loop driving the stream so whichever
/// side reaches a terminal state first disarms the other.
struct StreamCancelGuard {
    channel: Arc<Channel>,
    cid: Cid,
    open: Arc<AtomicBool>,
}

impl Drop for StreamCancelGuard {
    fn drop(&mut self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let channel = Arc::clone(&self.channel);
            let cid = self.cid.clone();
            tokio::spawn(async move {
                let _ = channel.writer.write_envelope(envelope::cancel(&cid)).await;
                channel.state.lock().await.pending.remove(&cid);
            });
        }
    }
}

impl Channel {
    fn new(self_uid: Uid, peer_uid: Uid, writer: Arc<dyn EnvelopeWriter>, scope: Scope) -> Self {
        Self {
            self_uid,
            peer_uid,
            writer,
            state: Mutex::new(ChannelState {
                pending: HashMap::new(),
                inbound_scopes: HashMap::new(),
            }),
            scope,
        }
    }

    pub fn peer_uid(&self) -> &Uid {
        &self.peer_uid
    }

    /// Cancel every in-flight call this channel is party to.
    pub fn cancel(&self) {
        self.scope.cancel();
    }

    /// Issue a unary call and await its single result.
    pub async fn call_unary(
        self: &Arc<Self>,
        ns: &str,
        func: &str,
        kwargs: StructValue,
    ) -> Result<Value> {
        let cid = Cid::new(&self.self_uid);
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().await;
            state.pending.insert(cid.clone(), Pending::Unary(tx));
        }

        if let Err(e) = self.writer.write_envelope(envelope::call(&cid, ns, func, kwargs)).await {
            self.state.lock().await.pending.remove(&cid);
            return Err(e);
        }

        tokio::select! {
            result = rx => result.map_err(|_| Error::TransportClosed)?,
            _ = self.scope.cancelled() => {
                self.state.lock().await.pending.remove(&cid);
                let _ = self.writer.write_envelope(envelope::cancel(&cid)).await;
                Err(Error::Cancelled)
            }
        }
    }

    /// Issue a streaming call and return a stream of yielded values.
    ///
    /// The stream ends when the peer sends `Stop`; if this channel's scope
    /// is cancelled while the stream is still open, a `Cancel` is sent to
    /// the peer and the stream ends with [`Error::Cancelled`] as its last
    /// item. If the returned stream is instead dropped before reaching a
    /// terminal state on its own, a `Cancel` is sent for its `cid` as the
    /// stream's state unwinds, so a caller that abandons a partially
    /// consumed sequence doesn't leave the peer producing into the void.
    pub async fn call_stream(
        self: &Arc<Self>,
        ns: &str,
        func: &str,
        kwargs: StructValue,
    ) -> Result<BoxStream<'static, YieldResult>> {
        let cid = Cid::new(&self.self_uid);
        let (tx, rx) = mpsc::channel(32);
        {
            let mut state = self.state.lock().await;
            state.pending.insert(cid.clone(), Pending::Stream(tx));
        }

        if let Err(e) = self.writer.write_envelope(envelope::call(&cid, ns, func, kwargs)).await {
            self.state.lock().await.pending.remove(&cid);
            return Err(e);
        }

        let channel = Arc::clone(self);
        let cancel_cid = cid.clone();
        let open = Arc::new(AtomicBool::new(true));
        let guard = StreamCancelGuard {
            channel: Arc::clone(&channel),
            cid: cancel_cid.clone(),
            open: Arc::clone(&open),
        };
        let stream = futures::stream::unfold(
            (rx, channel, cancel_cid, open, false, guard),
            |(mut rx, channel, cid, open, mut cancelled, guard)| async move {
                if cancelled {
                    return None;
                }
                tokio::select! {
                    item = rx.recv() => match item {
                        Some(v) => {
                            if v.is_err() {
                                open.store(false, Ordering::SeqCst);
                            }
                            Some((v, (rx, channel, cid, open, cancelled, guard)))
                        }
                        None => {
                            open.store(false, Ordering::SeqCst);
                            None
                        }
                    },
                    _ = channel.scope.cancelled() => {
                        open.store(false, Ordering::SeqCst);
                        let _ = channel.writer.write_envelope(envelope::cancel(&cid)).await;
                        cancelled = true;
                        Some((Err(Error::Cancelled), (rx, channel, cid, open, cancelled, guard)))
                    }
                }
            },
        );

        Ok(Box::pin(stream))
    }

    /// Ask the peer which functions it exposes under `ns`.
    pub async fn functions(self: &Arc<Self>, ns: &str) -> Result<Vec<String>> {
        let cid = Cid::new(&self.self_uid);
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().await;
            state.pending.insert(cid.clone(), Pending::Unary(tx));
        }
        self.writer.write_envelope(envelope::functions_query(&cid, ns)).await?;
        let value = rx.await.map_err(|_| Error::TransportClosed)??;
        let names = value
            .as_list()
            .ok_or_else(|| Error::Protocol("functions reply was not a list".into()))?
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();
        Ok(names)
    }

    async fn complete_unary(&self, cid: &Cid, result: Result<Value>) {
        let pending = self.state.lock().await.pending.remove(cid);
        if let Some(Pending::Unary(tx)) = pending {
            let _ = tx.send(result);
        }
    }

    /// Deliver a terminal error to whichever kind of pending call `cid`
    /// refers to: completes a unary call, or pushes a final item onto a
    /// streaming call and closes it.
    async fn fail(&self, cid: &Cid, error: Error) {
        let pending = self.state.lock().await.pending.remove(cid);
        match pending {
            Some(Pending::Unary(tx)) => {
                let _ = tx.send(Err(error));
            }
            Some(Pending::Stream(tx)) => {
                let _ = tx.send(Err(error)).await;
            }
            None => {}
        }
    }

    async fn push_stream_item(&self, cid: &Cid, item: YieldResult) {
        let is_err = item.is_err();
        let tx = {
            let state = self.state.lock().await;
            match state.pending.get(cid) {
                Some(Pending::Stream(tx)) => Some(tx.clone()),
                _ => None,
            }
        };
        if let Some(tx) = tx {
            let _ = tx.send(item).await;
        }
        if is_err {
            self.state.lock().await.pending.remove(cid);
        }
    }

    async fn end_stream(&self, cid: &Cid) {
        self.state.lock().await.pending.remove(cid);
    }
}

/// Drives one [`Channel`]'s inbound envelopes: completes local calls
/// awaiting replies, and dispatches peer-initiated calls into `registry`.
pub async fn run_message_loop(
    channel: Arc<Channel>,
    registry: Arc<Registry>,
    mut reader: EnvelopeReceiver,
) {
    while let Some(envelope) = reader.recv().await {
        let cid = match envelope_cid(&envelope) {
            Ok(Some(cid)) => cid,
            Ok(None) => continue,
            Err(e) => {
                warn!(peer = %channel.peer_uid(), error = %e, "ignoring envelope with unrecognized body");
                continue;
            }
        };

        match envelope.body {
            Some(Body::ReturnValue(rv)) => {
                let value = rv.value.unwrap_or_else(Value::null);
                channel.complete_unary(&cid, Ok(value)).await;
            }
            Some(Body::Error(err)) => {
                let remote = RemoteError::new(
                    channel.peer_uid().clone(),
                    err.kind,
                    err.message,
                    err.traceback,
                );
                channel.fail(&cid, Error::Remote(remote)).await;
            }
            Some(Body::YieldValue(yv)) => {
                let value = yv.value.unwrap_or_else(Value::null);
                channel.push_stream_item(&cid, Ok(value)).await;
            }
            Some(Body::Stop(_)) => {
                channel.end_stream(&cid).await;
            }
            Some(Body::Cancel(_)) => {
                let scope = channel.state.lock().await.inbound_scopes.get(&cid).cloned();
                if let Some(scope) = scope {
                    scope.cancel();
                }
            }
            Some(Body::FunctionsReply(fr)) => {
                let names: Vec<Value> = fr.names.into_iter().map(Value::from).collect();
                channel.complete_unary(&cid, Ok(Value::from(names))).await;
            }
            Some(Body::Call(call)) => {
                let handler = registry.lookup(&call.ns, &call.func);
                // A shielded handler (the debug mutex's `acquire_tty`) gets
                // its own scope, independent of `channel.scope`, so a
                // cancellation cascading down from an ancestor (e.g. a
                // nursery cancelling its children) cannot cut the hold
                // short. It still ends promptly on an explicit `{cancel}`
                // for its own `cid`, since that always targets this scope
                // directly regardless of its parentage.
                let scope = match &handler {
                    Ok(h) if h.is_shielded() => Scope::root(),
                    _ => channel.scope.child(),
                };
                channel
                    .state
                    .lock()
                    .await
                    .inbound_scopes
                    .insert(cid.clone(), scope.clone());
                tokio::spawn(serve_call(Arc::clone(&channel), handler, cid, call.kwargs.unwrap_or_default(), scope));
            }
            Some(Body::FunctionsQuery(q)) => {
                let names = registry.functions(&q.ns).unwrap_or_default();
                let _ = channel
                    .writer
                    .write_envelope(envelope::functions_reply(&cid, names))
                    .await;
            }
            Some(Body::Handshake(_)) => {}
            None => {
                warn!(peer = %channel.peer_uid(), "ignoring envelope with unknown body tag");
            }
        }
    }
}

async fn serve_call(
    channel: Arc<Channel>,
    handler: Result<Arc<dyn crate::registry::RpcHandler>>,
    cid: Cid,
    kwargs: StructValue,
    scope: Scope,
) {
    let handler = match handler {
        Ok(h) => h,
        Err(e) => {
            send_error(&channel, &cid, &e).await;
            return;
        }
    };

    if handler.is_streaming() {
        let mut stream = handler.call_stream(kwargs);
        loop {
            tokio::select! {
                _ = scope.cancelled() => break,
                item = stream.next() => {
                    match item {
                        Some(Ok(value)) => {
                            if channel.writer.write_envelope(envelope::yield_value(&cid, value)).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            send_error(&channel, &cid, &e).await;
                            return;
                        }
                        None => break,
                    }
                }
            }
        }
        let _ = channel.writer.write_envelope(envelope::stop(&cid)).await;
    } else if handler.is_blocking() {
        let blocking_handler = Arc::clone(&handler);
        tokio::select! {
            _ = scope.cancelled() => {}
            joined = tokio::task::spawn_blocking(move || blocking_handler.call_blocking(kwargs)) => {
                match joined {
                    Ok(Ok(value)) => {
                        let _ = channel.writer.write_envelope(envelope::return_value(&cid, value)).await;
                    }
                    Ok(Err(e)) => send_error(&channel, &cid, &e).await,
                    Err(join_err) => {
                        send_error(&channel, &cid, &Error::Protocol(join_err.to_string())).await;
                    }
                }
            }
        }
    } else {
        tokio::select! {
            _ = scope.cancelled() => {}
            result = handler.call_unary(kwargs) => {
                match result {
                    Ok(value) => {
                        let _ = channel.writer.write_envelope(envelope::return_value(&cid, value)).await;
                    }
                    Err(e) => send_error(&channel, &cid, &e).await,
                }
            }
        }
    }

    channel.state.lock().await.inbound_scopes.remove(&cid);
}

async fn send_error(channel: &Arc<Channel>, cid: &Cid, e: &Error) {
    let (kind, message) = error_kind_message(e);
    let _ = channel
        .writer
        .write_envelope(envelope::error_value(cid, kind, message, ""))
        .await;
}

fn error_kind_message(e: &Error) -> (&'static str, String) {
    match e {
        Error::ModuleNotExposed(_) => ("ModuleNotExposed", e.to_string()),
        Error::FuncNotFound(_, _) => ("FuncNotFound", e.to_string()),
        Error::Cancelled => ("Cancelled", e.to_string()),
        Error::Timeout(_) => ("Timeout", e.to_string()),
        _ => ("Error", e.to_string()),
    }
}

/// Create a [`Channel`] bound to `writer`, and spawn its message loop over
/// `reader`, dispatching server-side calls into `registry`.
pub fn open_channel(
    self_uid: Uid,
    peer_uid: Uid,
    writer: Arc<dyn EnvelopeWriter>,
    reader: EnvelopeReceiver,
    registry: Arc<Registry>,
    scope: Scope,
) -> Arc<Channel> {
    let channel = Arc::new(Channel::new(self_uid, peer_uid, writer, scope));
    tokio::spawn(run_message_loop(Arc::clone(&channel), registry, reader));
    channel
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Module;
    use crate::transport::create_envelope_channel;
    use crate::value::kwargs;

    fn uid(name: &str) -> Uid {
        Uid::new(name, "i0")
    }

    async fn paired_channels() -> (Arc<Channel>, Arc<Channel>) {
        let (client_io, server_io) = tokio::io::duplex(8192);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, server_write) = tokio::io::split(server_io);

        let (client_writer, client_rx) = create_envelope_channel(client_read, client_write);
        let (server_writer, server_rx) = create_envelope_channel(server_read, server_write);

        let server_registry = Arc::new(
            Registry::new()
                .register(
                    "math",
                    Module::new().with_unary("double", |kw: StructValue| async move {
                        let n = kw.get("n").and_then(|v| v.as_f64()).unwrap_or(0.0);
                        Ok(Value::from(n * 2.0))
                    }),
                )
                .register(
                    "blocking_math",
                    Module::new().with_blocking("double", |kw: StructValue| {
                        let n = kw.get("n").and_then(|v| v.as_f64()).unwrap_or(0.0);
                        Ok(Value::from(n * 2.0))
                    }),
                )
                .register(
                    "counter",
                    Module::new().with_stream("count_to", |kw: StructValue| {
                        let n = kw.get("n").and_then(|v| v.as_f64()).unwrap_or(0.0) as i64;
                        futures::stream::iter((1..=n).map(|i| Ok(Value::from(i as f64)))).boxed()
                    }),
                ),
        );

        let client = open_channel(
            uid("client"),
            uid("server"),
            client_writer,
            client_rx,
            Arc::new(Registry::new()),
            Scope::root(),
        );
        let _server = open_channel(
            uid("server"),
            uid("client"),
            server_writer,
            server_rx,
            server_registry,
            Scope::root(),
        );

        (client, _server)
    }

    #[tokio::test]
    async fn test_unary_call_roundtrip() {
        let (client, _server) = paired_channels().await;
        let result = client
            .call_unary("math", "double", kwargs([("n", Value::from(10.0))]))
            .await
            .unwrap();
        assert_eq!(result.as_f64(), Some(20.0));
    }

    #[tokio::test]
    async fn test_func_not_found_propagates_as_remote_error() {
        let (client, _server) = paired_channels().await;
        let result = client.call_unary("math", "missing", StructValue::new()).await;
        assert!(matches!(result, Err(Error::Remote(_))));
    }

    #[tokio::test]
    async fn test_blocking_call_roundtrip() {
        let (client, _server) = paired_channels().await;
        let result = client
            .call_unary("blocking_math", "double", kwargs([("n", Value::from(10.0))]))
            .await
            .unwrap();
        assert_eq!(result.as_f64(), Some(20.0));
    }

    #[tokio::test]
    async fn test_dropping_stream_early_cancels_remote_cid() {
        let (client, server) = paired_channels().await;

        let mut stream = client
            .call_stream("counter", "count_to", kwargs([("n", Value::from(1_000_000.0))]))
            .await
            .unwrap();
        // Take one item, proving the sequence started, then abandon it.
        assert!(stream.next().await.is_some());
        drop(stream);

        // The cancel guard's spawned task races this assertion, so poll
        // until the peer's inbound scope for the call is gone rather than
        // asserting immediately.
        for _ in 0..200 {
            if server.state.lock().await.inbound_scopes.is_empty() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("peer never observed a cancel for the abandoned stream");
    }
}
