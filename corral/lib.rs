//! Corral - Multi-Process Actor Runtime
//!
//! Corral runs a supervision tree of actors across OS processes rather
//! than in-process tasks: every actor is its own process, with its own
//! single-threaded cooperative scheduler, and parallelism only happens
//! across actor boundaries. A nursery spawns and supervises a group of
//! child actor processes with the same one-fails-all-cancel discipline a
//! structured-concurrency nursery applies to in-process tasks.
//!
//! # Wire format
//!
//! Corral frames each message as a 4-byte big-endian length prefix
//! followed by a protobuf-encoded [`proto::Envelope`], carried over an
//! ordinary TCP connection set up during [`actor::Actor::listen`] /
//! [`actor::Actor::connect`]'s handshake.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use corral::context::Uid;
//! use corral::registry::{Module, Registry};
//! use corral::runtime;
//! use corral::state::RuntimeConfig;
//!
//! let registry = Registry::new().register(
//!     "math",
//!     Module::new().with_unary("double", |kw| async move {
//!         let n = kw.get("n").and_then(|v| v.as_f64()).unwrap_or(0.0);
//!         Ok(corral::proto::Value::from(n * 2.0))
//!     }),
//! );
//!
//! runtime::run(
//!     Uid::new("root", "r0"),
//!     registry,
//!     RuntimeConfig::from_env(),
//!     "127.0.0.1:0",
//!     |actor| async move {
//!         let nursery = corral::nursery::open_nursery(actor, std::sync::Arc::new(
//!             corral::launcher::TokioProcessLauncher,
//!         ));
//!         nursery.start_actor("worker").await?;
//!         nursery.close().await
//!     },
//! )
//! .await?;
//! # Ok::<(), corral::error::Error>(())
//! ```

pub mod actor;
pub mod arbiter;
pub mod channel;
pub mod cli;
pub mod codec;
pub mod context;
pub mod debug_mutex;
pub mod envelope;
pub mod error;
pub mod launcher;
pub mod logging;
pub mod nursery;
pub mod portal;
pub mod proto;
pub mod registry;
pub mod remote_error;
pub mod runtime;
pub mod state;
pub mod tasks;
pub mod testing;
pub mod transport;
pub mod value;

// Re-exports for convenience.
pub use actor::Actor;
pub use context::{Cid, Scope, Uid};
pub use error::{Error, Result};
pub use launcher::{ProcessHandle, ProcessLauncher, TokioProcessLauncher};
pub use nursery::{open_nursery, Nursery};
pub use portal::Portal;
pub use proto::{StructValue, Value};
pub use registry::{Module, Registry, RpcHandler};
pub use remote_error::RemoteError;

// Re-export async_trait for use by application code implementing
// `ProcessLauncher`/`ProcessHandle` or `RpcHandler` directly.
pub use async_trait::async_trait;
pub use prost::Message as ProstMessage;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::actor::Actor;
    pub use crate::context::{Cid, Scope, Uid};
    pub use crate::error::{Error, Result};
    pub use crate::nursery::{open_nursery, Nursery};
    pub use crate::portal::Portal;
    pub use crate::proto::{StructValue, Value};
    pub use crate::registry::{Module, Registry, RpcHandler};
    pub use crate::runtime;
    pub use crate::state::RuntimeConfig;

    pub use async_trait::async_trait;
    pub use prost::Message as ProstMessage;
}
