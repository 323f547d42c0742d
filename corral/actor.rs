//! The actor: owns the local scheduler's peer table and RPC registry, and
//! hosts one message loop per peer channel.
//!
//! Grounded on `srpc::server::Server` (accept loop, one handler task per
//! connection) and `srpc::client::SrpcClient` (the connect side), unified
//! here because an actor is symmetric: it both serves peers and calls out
//! to them over the same kind of channel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::channel::{open_channel, Channel};
use crate::codec::{decode_envelope, encode_envelope, MAX_MESSAGE_SIZE};
use crate::context::{Scope, Uid};
use crate::debug_mutex::{self, DebugMutex};
use crate::envelope;
use crate::error::{Error, Result};
use crate::logging;
use crate::portal::{Portal, SYSTEM_ACQUIRE_TTY, SYSTEM_CANCEL, SYSTEM_MAIN, SYSTEM_NS};
use crate::proto::{envelope::Body, StructValue, Value};
use crate::registry::{Module, Registry};
use crate::state::RuntimeConfig;
use crate::tasks;
use crate::transport::create_envelope_channel;
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::Instrument;

/// Bound on how long a handshake may take before the attempt is abandoned.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// One actor process: peer table, RPC registry, and the two nested
/// cancellation scopes every actor owns.
pub struct Actor {
    uid: Uid,
    config: RuntimeConfig,
    registry: Arc<Registry>,
    peers: Mutex<HashMap<Uid, Vec<Arc<Channel>>>>,
    statespace: Mutex<StructValue>,
    root_scope: Scope,
    service_scope: Scope,
    /// The channel to this actor's parent, if any. A root actor never has
    /// one; a child actor set up via [`Actor::new`] with `parent: Some(_)`
    /// has it from construction; a child that re-execs the binary and
    /// dials back via `--parent` (see [`Actor::connect_to_parent`]) sets
    /// it after construction, once the dial completes.
    parent: Mutex<Option<Arc<Channel>>>,
    debug_mutex: DebugMutex,
    listen_addr: Mutex<Option<SocketAddr>>,
    /// Set while a debug session acquired through this actor is held, to
    /// reject a second concurrent `request_debug_session` from the same
    /// actor rather than deadlocking behind the FIFO queue on itself.
    in_debug: AtomicBool,
    /// The currently-held debug session stream, if any; holding it alive
    /// keeps the lock (or, for a non-root actor, the proxied call) open.
    debug_session: Mutex<Option<BoxStream<'static, crate::registry::YieldResult>>>,
    /// Set once this actor's `__system__.main` handler (see
    /// [`Actor::new`]'s `task_name` argument) has run its task to
    /// completion, recording whether that task returned an error. Only
    /// meaningful for a `run_in_actor`-spawned child; a plain worker
    /// actor's value is never written and stays `false`.
    main_task_failed: AtomicBool,
    /// The host-local name registry, joined (or started) by
    /// [`crate::runtime::run`]. `None` until bootstrap completes.
    arbiter: Mutex<Option<Portal>>,
}

impl Actor {
    /// Builds an actor exposing `registry`, plus the reserved `__system__`
    /// module every actor serves: `cancel` (cancels this actor's root
    /// scope) and, when `task_name` names a function registered with
    /// [`crate::tasks::register_task`], `main` (the entry point a
    /// `run_in_actor`-spawned child runs, see [`crate::portal::Portal`]).
    pub fn new(
        uid: Uid,
        registry: Registry,
        config: RuntimeConfig,
        parent: Option<Arc<Channel>>,
        task_name: Option<String>,
    ) -> Arc<Self> {
        let root_scope = Scope::root();
        let service_scope = root_scope.child();
        let debug_mutex = DebugMutex::new();

        Arc::new_cyclic(|weak: &Weak<Self>| {
            let mut system = Module::new().with_unary(SYSTEM_CANCEL, {
                let scope = root_scope.clone();
                move |_kwargs: StructValue| {
                    let scope = scope.clone();
                    async move {
                        scope.cancel();
                        Ok(Value::null())
                    }
                }
            });
            // Reads this actor's current parent fresh on every call rather
            // than baking one in at construction, so a late
            // `set_parent_channel` (the re-exec'd child process case, where
            // the dial-back to the parent happens after this actor already
            // exists) still routes the hold to the right place.
            let weak_for_tty = weak.clone();
            system = system.with_shielded_stream(SYSTEM_ACQUIRE_TTY, move |_kwargs: StructValue| {
                let actor = weak_for_tty.upgrade().expect("actor dropped while serving its own RPC");
                futures::stream::once(async move {
                    match actor.parent().await {
                        None => debug_mutex::acquire_stream(actor.debug_mutex.clone()),
                        Some(parent_channel) => debug_mutex::proxy_stream(parent_channel),
                    }
                })
                .flatten()
                .boxed()
            });
            if let Some(name) = task_name {
                let weak_for_main = weak.clone();
                system = system.with_unary(SYSTEM_MAIN, move |kwargs: StructValue| {
                    let name = name.clone();
                    let weak_for_main = weak_for_main.clone();
                    async move {
                        let task = tasks::lookup_task(&name)
                            .ok_or_else(|| Error::FuncNotFound(SYSTEM_NS.to_string(), name.clone()))?;
                        let result = task(kwargs).await;
                        // A run_in_actor child exits once its one-shot main
                        // task is done, successful or not; cancelling the
                        // root scope here is what lets `run_child`'s
                        // `root_scope().cancelled()` wait return, whether
                        // this call was ever actually awaited by the parent
                        // or the child simply idles until someone does.
                        if let Some(actor) = weak_for_main.upgrade() {
                            actor.main_task_failed.store(result.is_err(), Ordering::SeqCst);
                            actor.root_scope.cancel();
                        }
                        result
                    }
                });
            }
            let registry = Arc::new(registry.register(SYSTEM_NS, system));

            Self {
                uid,
                config,
                registry,
                peers: Mutex::new(HashMap::new()),
                statespace: Mutex::new(StructValue::new()),
                root_scope,
                service_scope,
                parent: Mutex::new(parent),
                debug_mutex,
                listen_addr: Mutex::new(None),
                in_debug: AtomicBool::new(false),
                debug_session: Mutex::new(None),
                main_task_failed: AtomicBool::new(false),
                arbiter: Mutex::new(None),
            }
        })
    }

    pub fn uid(&self) -> &Uid {
        &self.uid
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn statespace(&self) -> &Mutex<StructValue> {
        &self.statespace
    }

    pub fn root_scope(&self) -> &Scope {
        &self.root_scope
    }

    pub fn service_scope(&self) -> &Scope {
        &self.service_scope
    }

    pub async fn parent(&self) -> Option<Arc<Channel>> {
        self.parent.lock().await.clone()
    }

    /// True once this actor has a parent channel, set either at
    /// construction (a nursery-spawned child connected in-process) or
    /// later via [`Actor::connect_to_parent`] (a re-exec'd child process
    /// dialing its parent's listener).
    pub async fn is_root(&self) -> bool {
        self.parent.lock().await.is_none()
    }

    pub fn debug_mutex(&self) -> &DebugMutex {
        &self.debug_mutex
    }

    /// True once this actor's one-shot main task (see [`Actor::new`]'s
    /// `task_name` argument) has run and returned an error. A spawned
    /// child's entry point checks this after `root_scope().cancelled()`
    /// resolves to decide whether to exit non-zero.
    pub fn main_task_failed(&self) -> bool {
        self.main_task_failed.load(Ordering::SeqCst)
    }

    /// Records `channel` as this actor's parent connection, so debug-mutex
    /// proxying and [`Actor::is_root`] reflect it from this point on. Used
    /// by [`Actor::connect_to_parent`]; exposed separately so callers that
    /// already have a handshaked channel (as [`Actor::new`]'s `parent`
    /// argument does for in-process construction) don't need to re-dial.
    pub async fn set_parent_channel(&self, channel: Arc<Channel>) {
        *self.parent.lock().await = Some(channel);
    }

    /// Connects to the parent actor's listener at `addr`, performs the
    /// handshake, registers the resulting channel as an ordinary peer, and
    /// also designates it this actor's parent. The path a re-exec'd child
    /// worker process takes on startup, per `--parent <addr>`.
    pub async fn connect_to_parent(self: &Arc<Self>, addr: &str) -> Result<Arc<Channel>> {
        let channel = self.connect(addr).await?;
        self.set_parent_channel(Arc::clone(&channel)).await;
        Ok(channel)
    }

    /// Records the portal to the host-local arbiter, set once by
    /// [`crate::runtime::run`] during bootstrap.
    pub async fn set_arbiter(&self, portal: Portal) {
        *self.arbiter.lock().await = Some(portal);
    }

    pub async fn arbiter_portal(&self) -> Option<Portal> {
        self.arbiter.lock().await.clone()
    }

    /// Looks `name` up in the arbiter registry and, if a live endpoint is
    /// registered, connects to it and returns a fresh portal.
    pub async fn find_actor(self: &Arc<Self>, name: &str) -> Result<Option<Portal>> {
        let arbiter = self
            .arbiter
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::Protocol("actor has no arbiter; call runtime::run first".into()))?;
        let endpoint = arbiter
            .call(
                crate::arbiter::ARBITER_NS,
                crate::arbiter::OP_FIND,
                crate::value::kwargs([("name", Value::from(name))]),
            )
            .await?;
        match endpoint.as_str() {
            Some(addr) => Ok(Some(Portal::new(self.connect(addr).await?))),
            None => Ok(None),
        }
    }

    /// Acquires the shared debug session for this actor: the root actor
    /// takes the local lock directly, any other actor proxies the request
    /// up to its parent, one hop at a time, until it reaches the root.
    ///
    /// Fails if this actor already holds a session — recursing into the
    /// same actor's own mutex from a nested call would never resolve.
    pub async fn request_debug_session(self: &Arc<Self>) -> Result<()> {
        if self.in_debug.swap(true, Ordering::SeqCst) {
            return Err(Error::Protocol("this actor already holds the debug session".into()));
        }
        let mut stream = match self.parent().await {
            None => debug_mutex::acquire_stream(self.debug_mutex.clone()),
            Some(parent) => debug_mutex::proxy_stream(parent),
        };
        match stream.next().await {
            Some(Ok(_locked)) => {
                *self.debug_session.lock().await = Some(stream);
                Ok(())
            }
            Some(Err(e)) => {
                self.in_debug.store(false, Ordering::SeqCst);
                Err(e)
            }
            None => {
                self.in_debug.store(false, Ordering::SeqCst);
                Err(Error::Protocol("debug session stream ended before locking".into()))
            }
        }
    }

    /// Releases a debug session acquired via
    /// [`Actor::request_debug_session`].
    pub async fn release_debug_session(&self) {
        *self.debug_session.lock().await = None;
        self.in_debug.store(false, Ordering::SeqCst);
    }

    /// The address this actor's listener is bound to, once
    /// [`Actor::listen`] has completed. Used by
    /// [`crate::nursery::Nursery`] to tell spawned children where to
    /// dial back via `--parent`.
    pub async fn listen_addr(&self) -> Option<SocketAddr> {
        *self.listen_addr.lock().await
    }

    /// Binds a TCP listener and spawns an accept loop that handshakes each
    /// incoming connection and registers it as a peer channel. Returns the
    /// bound local address (useful when `addr` requests an ephemeral port).
    pub async fn listen(self: &Arc<Self>, addr: &str) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        *self.listen_addr.lock().await = Some(local_addr);

        let this = Arc::clone(self);
        let span = logging::actor_span(&this.uid);
        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        _ = this.root_scope.cancelled() => break,
                        accepted = listener.accept() => {
                            match accepted {
                                Ok((stream, peer_addr)) => {
                                    let this = Arc::clone(&this);
                                    let conn_span = logging::actor_span(&this.uid);
                                    tokio::spawn(
                                        async move {
                                            if let Err(e) = this.accept_connection(stream).await {
                                                warn!(%peer_addr, error = %e, "peer handshake failed");
                                            }
                                        }
                                        .instrument(conn_span),
                                    );
                                }
                                Err(e) => {
                                    warn!(error = %e, "accept failed");
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            .instrument(span),
        );

        Ok(local_addr)
    }

    async fn accept_connection(self: &Arc<Self>, stream: TcpStream) -> Result<()> {
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = tokio::io::split(stream);
        let (read_half, write_half, peer_uid) =
            handshake(read_half, write_half, &self.uid, HANDSHAKE_TIMEOUT).await?;

        let (writer, reader) = create_envelope_channel(read_half, write_half);
        let channel = open_channel(
            self.uid.clone(),
            peer_uid.clone(),
            writer,
            reader,
            Arc::clone(&self.registry),
            self.service_scope.child(),
        );
        self.register_peer(channel).await;
        info!(peer = %peer_uid, "accepted peer connection");
        Ok(())
    }

    /// Connects to a peer's listener, performs the handshake, and registers
    /// the resulting channel.
    pub async fn connect(self: &Arc<Self>, addr: &str) -> Result<Arc<Channel>> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = tokio::io::split(stream);
        let (read_half, write_half, peer_uid) =
            handshake(read_half, write_half, &self.uid, HANDSHAKE_TIMEOUT).await?;

        let (writer, reader) = create_envelope_channel(read_half, write_half);
        let channel = open_channel(
            self.uid.clone(),
            peer_uid,
            writer,
            reader,
            Arc::clone(&self.registry),
            self.service_scope.child(),
        );
        self.register_peer(Arc::clone(&channel)).await;
        Ok(channel)
    }

    pub async fn register_peer(&self, channel: Arc<Channel>) {
        let mut peers = self.peers.lock().await;
        peers.entry(channel.peer_uid().clone()).or_default().push(channel);
    }

    /// Returns an already-open channel to `peer`, if one exists.
    pub async fn peer_channel(&self, peer: &Uid) -> Option<Arc<Channel>> {
        self.peers.lock().await.get(peer).and_then(|v| v.first().cloned())
    }

    /// Cancels the root scope, which cascades to the service scope, every
    /// in-flight RPC task, every message loop, and closes every channel.
    pub fn cancel(&self) {
        self.root_scope.cancel();
    }
}

async fn handshake<R, W>(
    mut read: R,
    mut write: W,
    self_uid: &Uid,
    timeout: Duration,
) -> Result<(R, W, Uid)>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    tokio::time::timeout(timeout, async {
        let outbound = envelope::handshake(self_uid.name.clone(), self_uid.instance.clone());
        let bytes = encode_envelope(&outbound)?;
        write.write_all(&bytes).await?;
        write.flush().await?;

        let mut len_buf = [0u8; 4];
        read.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            return Err(Error::FrameSizeZero);
        }
        if len > MAX_MESSAGE_SIZE {
            return Err(Error::MessageTooLarge(len, MAX_MESSAGE_SIZE));
        }
        let mut payload = vec![0u8; len];
        read.read_exact(&mut payload).await?;
        let envelope = decode_envelope(&payload)?;

        match envelope.body {
            Some(Body::Handshake(h)) => Ok((read, write, Uid::new(h.name, h.instance_id))),
            _ => Err(Error::HandshakeFailed("expected handshake frame first".into())),
        }
    })
    .await
    .map_err(|_| Error::Timeout(timeout))?
}
