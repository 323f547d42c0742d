//! `corral-linguist`: the smallest possible two-process corral program.
//!
//! Launched with no arguments it is the root actor: it starts (or joins)
//! the host-local arbiter, opens a nursery, spawns one child actor process
//! named `some_linguist` running the `translate` task, and prints whatever
//! that task returns. Launched with `--uid ...` it is that spawned child,
//! re-exec'd by the nursery (see `corral::nursery::Nursery::spawn_child`)
//! with the argv contract `corral::cli::ChildArgs` parses.

use std::sync::Arc;

use clap::Parser;
use corral::cli::ChildArgs;
use corral::context::Uid;
use corral::launcher::TokioProcessLauncher;
use corral::proto::{StructValue, Value};
use corral::registry::Registry;
use corral::state::RuntimeConfig;
use corral::{logging, nursery, runtime, tasks};
use uuid::Uuid;

const TRANSLATE_TASK: &str = "translate";

#[tokio::main]
async fn main() -> corral::Result<()> {
    tasks::register_task(TRANSLATE_TASK, |_kwargs: StructValue| async move {
        Ok(Value::from("Dang that's beautiful"))
    });

    if std::env::args().any(|a| a == "--uid") {
        run_child().await
    } else {
        run_root().await
    }
}

/// The root process: owns the nursery, spawns `some_linguist`, and waits
/// for its one task to finish.
async fn run_root() -> corral::Result<()> {
    logging::init_tracing("info");

    let uid = Uid::new("root", Uuid::new_v4().to_string());
    runtime::run(uid, Registry::new(), RuntimeConfig::from_env(), "127.0.0.1:0", |actor| async move {
        let nursery = nursery::open_nursery(Arc::clone(&actor), Arc::new(TokioProcessLauncher));

        let portal = nursery.run_in_actor("some_linguist", TRANSLATE_TASK, StructValue::new()).await?;
        let translation = portal.result().await?;
        tracing::info!(%translation, "some_linguist replied");
        println!("{}", translation.as_str().unwrap_or_default());

        nursery.close().await
    })
    .await
}

/// A spawned child: parses its argv, constructs its own actor, dials back
/// to the parent and the arbiter, then idles until cancelled. Its
/// `translate` task runs automatically the first time the parent calls
/// `__system__.main`, dispatched by `corral::actor::Actor::new`.
async fn run_child() -> corral::Result<()> {
    let args = ChildArgs::try_parse_from(std::env::args())
        .map_err(|e| corral::Error::Protocol(format!("bad child argv: {e}")))?;
    logging::init_tracing(&args.loglevel);

    let config = RuntimeConfig { debug_mode: false, arbiter_addr: Some(args.arbiter.clone()) };
    let actor = corral::Actor::new(
        Uid::new(args.name(), args.instance_id()),
        Registry::new(),
        config,
        None,
        args.task.clone(),
    );

    actor.listen("127.0.0.1:0").await?;
    actor.connect_to_parent(&args.parent).await?;

    let arbiter_channel = actor.connect(&args.arbiter).await?;
    actor.set_arbiter(corral::Portal::new(arbiter_channel)).await;

    actor.root_scope().cancelled().await;
    if actor.main_task_failed() {
        return Err(corral::Error::Protocol("main task failed".into()));
    }
    Ok(())
}
