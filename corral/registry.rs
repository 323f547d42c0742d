//! The dispatch table an actor consults to serve incoming calls.
//!
//! Grounded on the server-side dispatch implicit in `srpc::server`/`rpc.rs`
//! (`ServerRpc::from_call_start` locating a service/method pair), replaced
//! here with an explicit registry populated at actor startup: this runtime
//! has no protobuf service descriptors to generate a dispatcher from, so
//! `(ns, func)` maps directly to a boxed async closure.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::{Error, Result};
use crate::proto::{StructValue, Value};

/// The result stream a streaming function yields: either a value or a
/// terminal error, never both for the same item.
pub type YieldResult = Result<Value>;

/// A dispatchable RPC handler.
///
/// `Unary` handlers run to completion and return one value. `Stream`
/// handlers return a stream of values, any item of which may carry a
/// terminal error. `Blocking` handlers are plain synchronous functions,
/// offloaded to a worker thread so they never stall the actor's scheduler.
/// All three are driven under the per-call cancellation scope the channel
/// derives for the conversation, so a handler that honors cancellation
/// (checks `scope.cancelled()` in a `select!`) unwinds promptly when the
/// caller cancels; a blocking handler has no suspension point to check one
/// at, so cancelling it only stops the serving loop from waiting on it, not
/// the worker thread itself.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn call_unary(&self, kwargs: StructValue) -> Result<Value> {
        let _ = kwargs;
        Err(Error::Protocol("handler does not support unary calls".into()))
    }

    fn call_stream(&self, kwargs: StructValue) -> BoxStream<'static, YieldResult> {
        let _ = kwargs;
        Box::pin(futures::stream::once(async {
            Err(Error::Protocol("handler does not support streaming calls".into()))
        }))
    }

    /// Runs a blocking handler's body. Called from within
    /// `tokio::task::spawn_blocking`, never inline on the actor's scheduler
    /// thread; see [`RpcHandler::is_blocking`].
    fn call_blocking(&self, kwargs: StructValue) -> Result<Value> {
        let _ = kwargs;
        Err(Error::Protocol("handler does not support blocking calls".into()))
    }

    /// True if this handler should be invoked via [`RpcHandler::call_stream`]
    /// rather than [`RpcHandler::call_unary`].
    fn is_streaming(&self) -> bool;

    /// True if this handler is a synchronous function that must be run via
    /// [`RpcHandler::call_blocking`] on a blocking worker thread rather than
    /// inline on the actor's single-threaded scheduler.
    fn is_blocking(&self) -> bool {
        false
    }

    /// True if the serving loop must not cancel this call on ambient scope
    /// cancellation (only the debug mutex's `acquire_tty` needs this; see
    /// [`crate::debug_mutex`]). Such a call ends only when the peer sends an
    /// explicit `{cancel}` for its own `cid`.
    fn is_shielded(&self) -> bool {
        false
    }
}

type UnaryFn = Arc<
    dyn Fn(StructValue) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> + Send + Sync,
>;

/// A unary handler built from a plain async closure, the common case for
/// registering ordinary functions.
pub struct UnaryHandler {
    f: UnaryFn,
}

impl UnaryHandler {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(StructValue) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self { f: Arc::new(move |kwargs| Box::pin(f(kwargs))) }
    }
}

#[async_trait]
impl RpcHandler for UnaryHandler {
    async fn call_unary(&self, kwargs: StructValue) -> Result<Value> {
        (self.f)(kwargs).await
    }

    fn is_streaming(&self) -> bool {
        false
    }
}

type StreamFn = Arc<dyn Fn(StructValue) -> BoxStream<'static, YieldResult> + Send + Sync>;

/// A streaming handler built from a closure that returns a boxed stream.
pub struct StreamHandler {
    f: StreamFn,
    shielded: bool,
}

impl StreamHandler {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(StructValue) -> BoxStream<'static, YieldResult> + Send + Sync + 'static,
    {
        Self { f: Arc::new(f), shielded: false }
    }

    pub fn new_shielded<F>(f: F) -> Self
    where
        F: Fn(StructValue) -> BoxStream<'static, YieldResult> + Send + Sync + 'static,
    {
        Self { f: Arc::new(f), shielded: true }
    }
}

#[async_trait]
impl RpcHandler for StreamHandler {
    fn call_stream(&self, kwargs: StructValue) -> BoxStream<'static, YieldResult> {
        (self.f)(kwargs)
    }

    fn is_streaming(&self) -> bool {
        true
    }

    fn is_shielded(&self) -> bool {
        self.shielded
    }
}

type BlockingFn = Arc<dyn Fn(StructValue) -> Result<Value> + Send + Sync>;

/// A handler built from a plain synchronous closure. Registered functions
/// that do real blocking work (disk I/O, CPU-bound computation, a blocking
/// C library call) belong here rather than in [`UnaryHandler`], which would
/// otherwise stall every other task sharing the actor's worker thread.
pub struct BlockingHandler {
    f: BlockingFn,
}

impl BlockingHandler {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(StructValue) -> Result<Value> + Send + Sync + 'static,
    {
        Self { f: Arc::new(f) }
    }
}

#[async_trait]
impl RpcHandler for BlockingHandler {
    fn call_blocking(&self, kwargs: StructValue) -> Result<Value> {
        (self.f)(kwargs)
    }

    fn is_streaming(&self) -> bool {
        false
    }

    fn is_blocking(&self) -> bool {
        true
    }
}

/// Functions exposed by an actor under one namespace.
#[derive(Default)]
pub struct Module {
    handlers: HashMap<String, Arc<dyn RpcHandler>>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_unary<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(StructValue) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(UnaryHandler::new(f)));
        self
    }

    pub fn with_stream<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(StructValue) -> BoxStream<'static, YieldResult> + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(StreamHandler::new(f)));
        self
    }

    /// Registers a synchronous function dispatched via
    /// `tokio::task::spawn_blocking` rather than run inline. See
    /// [`BlockingHandler`].
    pub fn with_blocking<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(StructValue) -> Result<Value> + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(BlockingHandler::new(f)));
        self
    }

    /// Registers a streaming handler that the serving loop must not cancel
    /// on ambient scope cancellation. See [`RpcHandler::is_shielded`].
    pub fn with_shielded_stream<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(StructValue) -> BoxStream<'static, YieldResult> + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(StreamHandler::new_shielded(f)));
        self
    }

    pub fn function_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// The set of namespaces one actor exposes to peers.
#[derive(Default)]
pub struct Registry {
    modules: HashMap<String, Module>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, ns: impl Into<String>, module: Module) -> Self {
        self.modules.insert(ns.into(), module);
        self
    }

    pub fn functions(&self, ns: &str) -> Result<Vec<String>> {
        self.modules
            .get(ns)
            .map(|m| m.function_names())
            .ok_or_else(|| Error::ModuleNotExposed(ns.to_string()))
    }

    pub fn lookup(&self, ns: &str, func: &str) -> Result<Arc<dyn RpcHandler>> {
        let module = self
            .modules
            .get(ns)
            .ok_or_else(|| Error::ModuleNotExposed(ns.to_string()))?;
        module
            .handlers
            .get(func)
            .cloned()
            .ok_or_else(|| Error::FuncNotFound(ns.to_string(), func.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::kwargs;

    #[tokio::test]
    async fn test_unary_dispatch() {
        let registry = Registry::new().register(
            "math",
            Module::new().with_unary("double", |kw: StructValue| async move {
                let n = kw.get("n").and_then(|v| v.as_f64()).unwrap_or(0.0);
                Ok(Value::from(n * 2.0))
            }),
        );

        let handler = registry.lookup("math", "double").unwrap();
        let result = handler.call_unary(kwargs([("n", Value::from(21.0))])).await.unwrap();
        assert_eq!(result.as_f64(), Some(42.0));
    }

    #[test]
    fn test_blocking_dispatch() {
        let registry = Registry::new().register(
            "math",
            Module::new().with_blocking("double", |kw: StructValue| {
                let n = kw.get("n").and_then(|v| v.as_f64()).unwrap_or(0.0);
                Ok(Value::from(n * 2.0))
            }),
        );

        let handler = registry.lookup("math", "double").unwrap();
        assert!(handler.is_blocking());
        let result = handler.call_blocking(kwargs([("n", Value::from(21.0))])).unwrap();
        assert_eq!(result.as_f64(), Some(42.0));
    }

    #[test]
    fn test_module_not_exposed() {
        let registry = Registry::new();
        assert!(matches!(registry.lookup("missing", "f"), Err(Error::ModuleNotExposed(_))));
    }

    #[test]
    fn test_func_not_found() {
        let registry = Registry::new().register("math", Module::new());
        assert!(matches!(
            registry.lookup("math", "missing"),
            Err(Error::FuncNotFound(_, _))
        ));
    }

    #[test]
    fn test_function_names_sorted() {
        let module = Module::new()
            .with_unary("b", |_| async { Ok(Value::null()) })
            .with_unary("a", |_| async { Ok(Value::null()) });
        assert_eq!(module.function_names(), vec!["a", "b"]);
    }
}
