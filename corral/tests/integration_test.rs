//! End-to-end tests that spawn whole child actors (as in-process tasks
//! standing in for re-exec'd processes, via a custom [`ProcessLauncher`])
//! and drive them through the nursery/portal surface a real application
//! uses, rather than poking at individual modules in isolation.

use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::StreamExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use corral::cli::ChildArgs;
use corral::context::Uid;
use corral::launcher::{ProcessHandle, ProcessLauncher};
use corral::nursery;
use corral::proto::{StructValue, Value};
use corral::registry::Module;
use corral::state::RuntimeConfig;
use corral::value::kwargs;
use corral::{tasks, Actor, Error, Registry};

#[cfg(unix)]
fn exit_status(code: i32) -> ExitStatus {
    use std::os::unix::process::ExitStatusExt;
    ExitStatus::from_raw(code << 8)
}

/// Like [`corral::testing::InProcessLauncher`], but the spawned task's
/// real outcome (success or failure) surfaces through `wait()`'s exit
/// status instead of the fixed "always succeeded" the plain test double
/// reports. `Nursery::close` decides the one-fails-all-cancel outcome from
/// process exit status, so exercising that path honestly needs a launcher
/// that can report a failure.
struct RecordingLauncher {
    factory: Arc<dyn Fn(ChildArgs) -> BoxFuture<'static, bool> + Send + Sync>,
}

impl RecordingLauncher {
    fn new<F, Fut>(factory: F) -> Self
    where
        F: Fn(ChildArgs) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = bool> + Send + 'static,
    {
        Self { factory: Arc::new(move |args| Box::pin(factory(args))) }
    }
}

#[async_trait]
impl ProcessLauncher for RecordingLauncher {
    async fn spawn(
        &self,
        command: &str,
        args: &[String],
        _env: &[(String, String)],
    ) -> corral::Result<Box<dyn ProcessHandle>> {
        let argv = std::iter::once(command.to_string()).chain(args.iter().cloned());
        let child_args = ChildArgs::try_parse_from(argv)
            .map_err(|e| Error::Protocol(format!("bad child argv: {e}")))?;

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let factory = Arc::clone(&self.factory);
        let handle: JoinHandle<bool> = tokio::spawn(async move {
            tokio::select! {
                ok = factory(child_args) => ok,
                _ = stop_rx => true,
            }
        });

        Ok(Box::new(RecordingHandle { handle: Some(handle), stop: Some(stop_tx) }))
    }
}

struct RecordingHandle {
    handle: Option<JoinHandle<bool>>,
    stop: Option<oneshot::Sender<()>>,
}

#[async_trait]
impl ProcessHandle for RecordingHandle {
    fn id(&self) -> Option<u32> {
        None
    }

    async fn wait(&mut self) -> corral::Result<ExitStatus> {
        let ok = match self.handle.take() {
            Some(handle) => handle.await.map_err(|e| Error::Protocol(e.to_string()))?,
            None => true,
        };
        Ok(exit_status(if ok { 0 } else { 1 }))
    }

    async fn terminate(&mut self) -> corral::Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        Ok(())
    }

    async fn kill(&mut self) -> corral::Result<()> {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        Ok(())
    }
}

/// Builds and runs a worker actor the way a re-exec'd child process would
/// (see `demos/main.rs`'s `run_child`), minus the arbiter dial-back this
/// test harness has no use for. Returns whether the actor's one-shot main
/// task (if any) succeeded.
async fn run_worker(args: ChildArgs, registry: Registry) -> bool {
    let config = RuntimeConfig { debug_mode: false, arbiter_addr: None };
    let actor = Actor::new(
        Uid::new(args.name(), args.instance_id()),
        registry,
        config,
        None,
        args.task.clone(),
    );

    if actor.listen("127.0.0.1:0").await.is_err() {
        return false;
    }
    if actor.connect_to_parent(&args.parent).await.is_err() {
        return false;
    }

    actor.root_scope().cancelled().await;
    !actor.main_task_failed()
}

fn parent_actor(name: &str) -> Arc<Actor> {
    Actor::new(Uid::new(name, "p0"), Registry::new(), RuntimeConfig::default(), None, None)
}

#[tokio::test]
async fn test_single_remote_call() {
    let parent = parent_actor("parent");
    parent.listen("127.0.0.1:0").await.unwrap();

    let launcher = RecordingLauncher::new(|args: ChildArgs| async move {
        let registry = Registry::new().register(
            "math",
            Module::new().with_unary("double", |kw: StructValue| async move {
                let n = kw.get("n").and_then(|v| v.as_f64()).unwrap_or(0.0);
                Ok(Value::from(n * 2.0))
            }),
        );
        run_worker(args, registry).await
    });

    let nursery = nursery::open_nursery(Arc::clone(&parent), Arc::new(launcher));
    let portal = nursery.start_actor("doubler").await.unwrap();

    let result = portal.call("math", "double", kwargs([("n", Value::from(21.0))])).await.unwrap();
    assert_eq!(result.as_f64(), Some(42.0));

    nursery.cancel().await;
    nursery.close().await.unwrap();
}

#[tokio::test]
async fn test_remote_streamed_sequence() {
    let parent = parent_actor("parent");
    parent.listen("127.0.0.1:0").await.unwrap();

    let launcher = RecordingLauncher::new(|args: ChildArgs| async move {
        let registry = Registry::new().register(
            "counter",
            Module::new().with_stream("count_to", |kw: StructValue| {
                let n = kw.get("n").and_then(|v| v.as_f64()).unwrap_or(0.0) as i64;
                futures::stream::iter((1..=n).map(|i| Ok(Value::from(i as f64)))).boxed()
            }),
        );
        run_worker(args, registry).await
    });

    let nursery = nursery::open_nursery(Arc::clone(&parent), Arc::new(launcher));
    let portal = nursery.start_actor("counter").await.unwrap();

    let mut stream = portal.call_stream("counter", "count_to", kwargs([("n", Value::from(4.0))])).await.unwrap();
    let mut items = Vec::new();
    while let Some(item) = stream.next().await {
        items.push(item.unwrap().as_f64().unwrap());
    }
    assert_eq!(items, vec![1.0, 2.0, 3.0, 4.0]);

    nursery.cancel().await;
    nursery.close().await.unwrap();
}

#[tokio::test]
async fn test_remote_error_propagates_as_remote_error() {
    let parent = parent_actor("parent");
    parent.listen("127.0.0.1:0").await.unwrap();

    let launcher = RecordingLauncher::new(|args: ChildArgs| async move {
        let registry = Registry::new().register(
            "risky",
            Module::new().with_unary("boom", |_kw: StructValue| async move {
                Err(Error::Protocol("deliberate failure".into()))
            }),
        );
        run_worker(args, registry).await
    });

    let nursery = nursery::open_nursery(Arc::clone(&parent), Arc::new(launcher));
    let portal = nursery.start_actor("risky").await.unwrap();

    let result = portal.call("risky", "boom", StructValue::new()).await;
    assert!(matches!(result, Err(Error::Remote(_))));

    nursery.cancel().await;
    nursery.close().await.unwrap();
}

#[tokio::test]
async fn test_one_child_failing_cancels_its_siblings() {
    tasks::register_task("integration_fail", |_kwargs: StructValue| async move {
        Err(Error::Protocol("task deliberately failed".into()))
    });

    let parent = parent_actor("parent");
    parent.listen("127.0.0.1:0").await.unwrap();

    let healthy_survived_cancellation = Arc::new(AtomicBool::new(false));
    let survived = Arc::clone(&healthy_survived_cancellation);

    let launcher = RecordingLauncher::new(move |args: ChildArgs| {
        let survived = Arc::clone(&survived);
        async move {
            let name = args.name().to_string();
            let ok = run_worker(args, Registry::new()).await;
            if name == "healthy" {
                survived.store(true, Ordering::SeqCst);
            }
            ok
        }
    });

    let nursery = Arc::new(nursery::open_nursery(Arc::clone(&parent), Arc::new(launcher)));

    // A persistent worker with no main task: nothing makes it exit on its
    // own, so it only stops once the nursery cancels it in response to its
    // sibling's failure.
    let _healthy_portal = nursery.start_actor("healthy").await.unwrap();
    let failing_portal =
        nursery.run_in_actor("failing", "integration_fail", StructValue::new()).await.unwrap();

    // Awaiting the failed task's result also drives its own actor to
    // cancel its own root scope (see `Actor::new`'s `__system__.main`
    // handler), which is what eventually makes its process "exit"
    // non-zero for `Nursery::close` to notice.
    assert!(failing_portal.result().await.is_err());

    let close_result = tokio::time::timeout(Duration::from_secs(5), nursery.close()).await.unwrap();
    assert!(close_result.is_err(), "one failing child must surface as a close() failure");
    assert!(
        healthy_survived_cancellation.load(Ordering::SeqCst),
        "the healthy sibling must have been cancelled and its worker loop unwound, \
         not left dangling, once its sibling failed"
    );
}
