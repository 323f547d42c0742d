//! Structured-concurrency supervision of spawned child actor processes.
//!
//! Grounded on `srpc::server::Server`'s accept loop paired with the
//! teacher's connection bookkeeping, generalised from "accept whatever
//! connects" to "spawn a specific child and wait for it to connect back",
//! plus the supervision rule this runtime adds: one failing child cancels
//! every sibling, the way a `trio` nursery does in the source system this
//! was distilled from.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{info, warn};
use uuid::Uuid;

use crate::actor::Actor;
use crate::context::{Scope, Uid};
use crate::error::{Error, Result};
use crate::launcher::{ProcessHandle, ProcessLauncher};
use crate::portal::Portal;
use crate::proto::StructValue;
use crate::registry::Registry;
use crate::remote_error::{MultiRemoteError, RemoteError};

/// How long a spawned child is given to dial back and complete its
/// handshake before the nursery gives up on it.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period between SIGTERM and a forced kill when tearing a child
/// down at scope exit.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(2);

struct ChildEntry {
    process: Box<dyn ProcessHandle>,
    portal: Portal,
}

/// One child's outcome, recorded when its process exits or its nursery
/// scope is cancelled. Exactly one entry per child, per the state machine
/// `spawned -> connected -> running -> {completed | errored | cancelled}`.
enum Outcome {
    Completed,
    Errored(RemoteError),
    Cancelled,
}

/// Owns a set of child actor processes spawned from one parent actor.
///
/// `close()` is the structured-concurrency join point: it does not return
/// until every child has reached a terminal state, and propagates a
/// failure (single or aggregated) if any child failed.
pub struct Nursery {
    actor: Arc<Actor>,
    launcher: Arc<dyn ProcessLauncher>,
    scope: Scope,
    children: Mutex<HashMap<Uid, ChildEntry>>,
    outcomes: Mutex<HashMap<Uid, Outcome>>,
}

/// Opens a nursery scoped to `actor.service_scope()`. Children spawned
/// through it are cancelled as a group if the nursery's own scope is
/// cancelled, and the nursery scope is cancelled if any child fails.
pub fn open_nursery(actor: Arc<Actor>, launcher: Arc<dyn ProcessLauncher>) -> Nursery {
    let scope = actor.service_scope().child();
    Nursery {
        actor,
        launcher,
        scope,
        children: Mutex::new(HashMap::new()),
        outcomes: Mutex::new(HashMap::new()),
    }
}

impl Nursery {
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Spawns a child process named `name`, waits for it to connect back
    /// and complete its handshake, and registers it. `rpc_modules` becomes
    /// the child's own registry via the `task_name: None` path, so the
    /// child serves ordinary RPCs rather than a one-shot main task.
    pub async fn start_actor(&self, name: &str) -> Result<Portal> {
        self.spawn_child(name, None).await
    }

    /// Like [`Nursery::start_actor`], but tells the child to run the task
    /// registered under `task_name` (see [`crate::tasks::register_task`])
    /// as its main task. `portal.result()` awaits that task's return
    /// value, delivered as an ordinary unary reply on the `__system__.main`
    /// call the child's [`crate::actor::Actor`] auto-registers.
    pub async fn run_in_actor(
        &self,
        name: &str,
        task_name: &str,
        kwargs: StructValue,
    ) -> Result<Portal> {
        let portal = self.spawn_child(name, Some(task_name)).await?;
        Ok(portal.with_main_task(kwargs))
    }

    async fn spawn_child(&self, name: &str, task_name: Option<&str>) -> Result<Portal> {
        let instance_id = Uuid::new_v4().to_string();
        let uid = Uid::new(name, instance_id.clone());

        let parent_addr = self
            .actor
            .listen_addr()
            .await
            .ok_or_else(|| Error::Protocol("actor is not listening; call Actor::listen first".into()))?;

        let exe = std::env::current_exe()?;
        let mut args = vec![
            "--uid".to_string(),
            name.to_string(),
            instance_id.clone(),
            "--parent".to_string(),
            parent_addr.to_string(),
            "--arbiter".to_string(),
            self.actor.config().arbiter_addr().to_string(),
        ];
        if let Some(task) = task_name {
            args.push("--task".to_string());
            args.push(task.to_string());
        }

        let process = self.launcher.spawn(&exe.to_string_lossy(), &args, &[]).await?;
        info!(uid = %uid, pid = ?process.id(), "spawned child actor");

        let channel = tokio::time::timeout(CONNECT_TIMEOUT, self.wait_for_child(&uid))
            .await
            .map_err(|_| Error::Timeout(CONNECT_TIMEOUT))??;

        let portal = Portal::new(channel);
        self.children.lock().await.insert(uid.clone(), ChildEntry { process, portal: portal.clone() });
        Ok(portal)
    }

    /// Polls the actor's peer table until the child with `uid` has
    /// connected and completed its handshake.
    async fn wait_for_child(&self, uid: &Uid) -> Result<Arc<crate::channel::Channel>> {
        loop {
            if let Some(channel) = self.actor.peer_channel(uid).await {
                return Ok(channel);
            }
            sleep(Duration::from_millis(20)).await;
        }
    }

    /// Cancels every child (`__system__.cancel` over its channel) and then
    /// the nursery's own scope, so any task still waiting on
    /// `scope.cancelled()` unwinds.
    pub async fn cancel(&self) {
        let children = self.children.lock().await;
        for (uid, entry) in children.iter() {
            if entry.portal.cancel_actor().await.is_err() {
                warn!(uid = %uid, "failed to deliver cancel to child");
            }
            self.outcomes.lock().await.entry(uid.clone()).or_insert(Outcome::Cancelled);
        }
        drop(children);
        self.scope.cancel();
    }

    /// Waits for every child to reach a terminal state, terminating any
    /// still-running process once the nursery scope is cancelled, then
    /// aggregates failures per the supervision rule: a single failure
    /// surfaces as [`Error::Remote`], several concurrent failures as
    /// [`Error::Multi`].
    ///
    /// All children are awaited concurrently, not one after another: a
    /// sequential wait would let an earlier, still-healthy child block
    /// inspection of a later, already-failed one forever, which would
    /// defeat the one-fails-all-cancel rule outright. The first child
    /// whose outcome is [`Outcome::Errored`] cancels `self.scope` itself,
    /// so every sibling still inside its own `select!` wakes up on the
    /// `scope.cancelled()` branch without the caller having to call
    /// [`Nursery::cancel`] first.
    pub async fn close(&self) -> Result<()> {
        let entries: Vec<(Uid, Box<dyn ProcessHandle>)> =
            self.children.lock().await.drain().map(|(uid, entry)| (uid, entry.process)).collect();

        let scope = &self.scope;
        let outcomes = futures::future::join_all(entries.into_iter().map(|(uid, mut process)| async move {
            let outcome = tokio::select! {
                status = process.wait() => match status {
                    Ok(s) if s.success() => Outcome::Completed,
                    Ok(_) => Outcome::Errored(RemoteError::new(
                        uid.clone(),
                        "ProcessExit",
                        "child process exited with non-zero status",
                        "",
                    )),
                    Err(e) => Outcome::Errored(RemoteError::new(uid.clone(), "Io", e.to_string(), "")),
                },
                _ = scope.cancelled() => {
                    if process.terminate().await.is_ok() {
                        tokio::select! {
                            _ = process.wait() => {}
                            _ = sleep(TERMINATE_GRACE) => {
                                let _ = process.kill().await;
                            }
                        }
                    }
                    Outcome::Cancelled
                }
            };

            // Wake every sibling's `scope.cancelled()` branch the moment
            // one child is known to have failed, instead of waiting for
            // this whole join to finish before anyone reacts.
            if matches!(outcome, Outcome::Errored(_)) {
                scope.cancel();
            }

            (uid, outcome)
        }))
        .await;

        let mut failures = Vec::new();
        let mut outcome_map = self.outcomes.lock().await;
        for (uid, outcome) in outcomes {
            if let Outcome::Errored(ref e) = outcome {
                failures.push(e.clone());
            }
            outcome_map.insert(uid, outcome);
        }
        drop(outcome_map);

        match failures.len() {
            0 => Ok(()),
            1 => Err(Error::Remote(failures.remove(0))),
            _ => Err(Error::Multi(MultiRemoteError::new(failures))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::state::RuntimeConfig;
    use async_trait::async_trait;
    use std::process::ExitStatus;

    /// A fake launcher that never actually starts a process; used to check
    /// the nursery's argv construction and timeout behaviour without
    /// spawning anything.
    struct NeverConnectsLauncher;

    struct FakeHandle;

    #[async_trait]
    impl ProcessHandle for FakeHandle {
        fn id(&self) -> Option<u32> {
            None
        }
        async fn wait(&mut self) -> Result<ExitStatus> {
            std::future::pending::<()>().await;
            unreachable!()
        }
        async fn terminate(&mut self) -> Result<()> {
            Ok(())
        }
        async fn kill(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl ProcessLauncher for NeverConnectsLauncher {
        async fn spawn(
            &self,
            _command: &str,
            _args: &[String],
            _env: &[(String, String)],
        ) -> Result<Box<dyn ProcessHandle>> {
            Ok(Box::new(FakeHandle))
        }
    }

    #[tokio::test]
    async fn test_start_actor_times_out_when_child_never_connects() {
        let actor = Actor::new(
            Uid::new("parent", "p0"),
            Registry::new(),
            RuntimeConfig::default(),
            None,
            None,
        );
        actor.listen("127.0.0.1:0").await.unwrap();

        let nursery = open_nursery(Arc::clone(&actor), Arc::new(NeverConnectsLauncher));
        // The fake launcher never makes the child dial back, so this must
        // time out rather than hang forever.
        let result = tokio::time::timeout(Duration::from_millis(200), async {
            nursery.start_actor("worker").await
        })
        .await;
        // Either our outer test timeout or the nursery's own CONNECT_TIMEOUT
        // would make this hang without the fix; assert we got some result
        // path (the nursery's internal timeout is 10s, so the outer timeout
        // fires first here, which still proves spawn_child did not block
        // the executor).
        assert!(result.is_err() || result.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_start_actor_errors_without_listener() {
        let actor = Actor::new(
            Uid::new("parent", "p0"),
            Registry::new(),
            RuntimeConfig::default(),
            None,
            None,
        );
        let nursery = open_nursery(Arc::clone(&actor), Arc::new(NeverConnectsLauncher));
        let result = nursery.start_actor("worker").await;
        assert!(matches!(result, Err(Error::Protocol(_))));
    }
}
