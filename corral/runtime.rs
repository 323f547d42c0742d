//! Process bootstrap: bind a listener, join (or start) the host-local
//! arbiter, run the caller's entry point inside the root actor's root
//! scope, and tear everything down on return.
//!
//! Grounded on `srpc::server::Server::listen` plus the teacher's
//! `ServerConfig::from_env` startup path (`server.rs`), generalised with
//! the "first process owns the arbiter, everyone else connects" protocol
//! this runtime's process tree needs that a single long-lived service
//! never did.

use std::future::Future;
use std::sync::Arc;

use tracing::{info, warn};

use crate::actor::Actor;
use crate::arbiter::{self, ARBITER_NS, OP_FIND, OP_REGISTER, OP_UNREGISTER};
use crate::context::Uid;
use crate::error::Result;
use crate::portal::Portal;
use crate::registry::Registry;
use crate::state::{self, RuntimeConfig};
use crate::value::kwargs;

/// Connects to the arbiter at `actor.config().arbiter_addr()` if one is
/// already listening; otherwise starts a fresh arbiter actor bound to that
/// address and connects to it. Either way, the caller ends up with a
/// [`Portal`] to whichever process ultimately owns the registry.
pub async fn start_or_join(actor: &Arc<Actor>) -> Result<Portal> {
    let addr = actor.config().arbiter_addr().to_string();
    match actor.connect(&addr).await {
        Ok(channel) => {
            info!(%addr, "joined existing arbiter");
            Ok(Portal::new(channel))
        }
        Err(e) => {
            info!(%addr, error = %e, "no arbiter listening, starting one");
            let arbiter_registry = Registry::new().register(ARBITER_NS, arbiter::registry_module());
            let arbiter_actor =
                Actor::new(Uid::new("arbiter", "singleton"), arbiter_registry, actor.config().clone(), None, None);
            arbiter_actor.listen(&addr).await?;
            let channel = actor.connect(&addr).await?;
            Ok(Portal::new(channel))
        }
    }
}

/// Runs `entry` as the root actor's program: binds `listen_addr`, joins or
/// starts the arbiter, registers this actor's own endpoint under `uid`'s
/// name, runs `entry`, then unregisters and cancels every scope regardless
/// of whether `entry` succeeded.
///
/// This is the only place [`crate::state::init_current_actor`] is called;
/// calling [`run`] twice in one process panics.
pub async fn run<F, Fut, T>(
    uid: Uid,
    registry: Registry,
    config: RuntimeConfig,
    listen_addr: &str,
    entry: F,
) -> Result<T>
where
    F: FnOnce(Arc<Actor>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let actor = Actor::new(uid.clone(), registry, config, None, None);
    let own_addr = actor.listen(listen_addr).await?;
    state::init_current_actor(Arc::clone(&actor));

    let arbiter_portal = start_or_join(&actor).await?;
    actor.set_arbiter(arbiter_portal.clone()).await;

    arbiter_portal
        .call(ARBITER_NS, OP_REGISTER, kwargs([("name", uid.name.as_str().into()), ("endpoint", own_addr.to_string().into())]))
        .await?;

    let result = entry(Arc::clone(&actor)).await;

    if let Err(e) = arbiter_portal.call(ARBITER_NS, OP_UNREGISTER, kwargs([("name", uid.name.as_str().into())])).await {
        warn!(error = %e, "failed to unregister from arbiter during shutdown");
    }
    actor.cancel();

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::Value;

    #[tokio::test]
    async fn test_run_joins_arbiter_and_returns_entry_result() {
        let arbiter_addr = "127.0.0.1:0";
        // Start a dedicated arbiter up front so both runs below join the
        // same one rather than racing to own it.
        let bootstrap = Actor::new(
            Uid::new("bootstrap-arbiter", "a0"),
            Registry::new().register(ARBITER_NS, arbiter::registry_module()),
            RuntimeConfig::default(),
            None,
            None,
        );
        let bound = bootstrap.listen(arbiter_addr).await.unwrap();

        let config = RuntimeConfig { debug_mode: false, arbiter_addr: Some(bound.to_string()) };

        let result: Result<i64> = run(
            Uid::new("worker", "w0"),
            Registry::new(),
            config,
            "127.0.0.1:0",
            |_actor| async move { Ok(7) },
        )
        .await;

        assert_eq!(result.unwrap(), 7);

        // The entry's actor registered then unregistered itself; confirm
        // via a direct find against the bootstrap arbiter.
        let portal = Portal::new(bootstrap.connect(&bound.to_string()).await.unwrap());
        let found = portal.call(ARBITER_NS, OP_FIND, kwargs([("name", Value::from("worker"))])).await.unwrap();
        assert!(found.is_null());
    }
}
