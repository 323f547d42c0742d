//! Test tooling for corral: in-memory channel pairs and an in-process
//! stand-in for [`crate::launcher::ProcessLauncher`].
//!
//! Grounded on the teacher's `testing.rs` (duplex-stream pipes for
//! exercising a client/server pair without a real socket), generalised
//! two ways: [`duplex_channel_pair`] wires a pair of [`crate::channel::Channel`]s
//! instead of raw packet streams, and [`InProcessLauncher`] extends the
//! same "fake the transport, not the protocol" idea to process spawn, so
//! [`crate::nursery::Nursery`] supervision tests can run several "actors"
//! as plain Tokio tasks in one test binary.

use std::process::ExitStatus;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::channel::{open_channel, Channel};
use crate::cli::ChildArgs;
use crate::context::{Scope, Uid};
use crate::error::{Error, Result};
use crate::launcher::{ProcessHandle, ProcessLauncher};
use crate::registry::Registry;
use crate::transport::create_envelope_channel;

/// Wires two in-memory [`Channel`]s together over a `tokio::io::duplex`
/// pipe, handshake-free (both sides already know each other's [`Uid`]).
/// `left` serves `left_registry` to `right`, and vice versa.
pub fn duplex_channel_pair(
    left_uid: Uid,
    left_registry: Arc<Registry>,
    right_uid: Uid,
    right_registry: Arc<Registry>,
) -> (Arc<Channel>, Arc<Channel>) {
    let (left_io, right_io) = tokio::io::duplex(64 * 1024);
    let (left_read, left_write) = tokio::io::split(left_io);
    let (right_read, right_write) = tokio::io::split(right_io);

    let (left_writer, left_rx) = create_envelope_channel(left_read, left_write);
    let (right_writer, right_rx) = create_envelope_channel(right_read, right_write);

    let left = open_channel(
        left_uid.clone(),
        right_uid.clone(),
        left_writer,
        left_rx,
        right_registry,
        Scope::root(),
    );
    let right = open_channel(right_uid, left_uid, right_writer, right_rx, left_registry, Scope::root());

    (left, right)
}

/// A [`ProcessLauncher`] that runs each "child process" as a Tokio task in
/// the same OS process rather than re-exec'ing a binary, driven by a
/// user-supplied factory that receives the parsed [`ChildArgs`]. Lets
/// nursery/supervision tests exercise the real spawn -> connect-back ->
/// supervise lifecycle without paying for a real `fork`/`exec`.
pub struct InProcessLauncher {
    factory: Arc<dyn Fn(ChildArgs) -> BoxFuture<'static, ()> + Send + Sync>,
}

impl InProcessLauncher {
    pub fn new<F, Fut>(factory: F) -> Self
    where
        F: Fn(ChildArgs) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        Self { factory: Arc::new(move |args| Box::pin(factory(args))) }
    }
}

#[async_trait]
impl ProcessLauncher for InProcessLauncher {
    async fn spawn(
        &self,
        command: &str,
        args: &[String],
        _env: &[(String, String)],
    ) -> Result<Box<dyn ProcessHandle>> {
        let argv = std::iter::once(command.to_string()).chain(args.iter().cloned());
        let child_args = ChildArgs::try_parse_from(argv)
            .map_err(|e| Error::Protocol(format!("bad child argv: {e}")))?;

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let factory = Arc::clone(&self.factory);
        let handle: JoinHandle<()> = tokio::spawn(async move {
            tokio::select! {
                _ = factory(child_args) => {}
                _ = stop_rx => {}
            }
        });

        Ok(Box::new(InProcessHandle { handle: Some(handle), stop: Some(stop_tx) }))
    }
}

struct InProcessHandle {
    handle: Option<JoinHandle<()>>,
    stop: Option<oneshot::Sender<()>>,
}

#[cfg(unix)]
fn success_status() -> ExitStatus {
    use std::os::unix::process::ExitStatusExt;
    ExitStatus::from_raw(0)
}

#[async_trait]
impl ProcessHandle for InProcessHandle {
    fn id(&self) -> Option<u32> {
        None
    }

    async fn wait(&mut self) -> Result<ExitStatus> {
        if let Some(handle) = self.handle.take() {
            handle.await.map_err(|e| Error::Protocol(format!("in-process actor task panicked: {e}")))?;
        }
        #[cfg(unix)]
        {
            Ok(success_status())
        }
        #[cfg(not(unix))]
        {
            Err(Error::Protocol("InProcessLauncher::wait is unix-only".into()))
        }
    }

    async fn terminate(&mut self) -> Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{StructValue, Value};
    use crate::registry::Module;
    use crate::value::kwargs;

    #[tokio::test]
    async fn test_duplex_channel_pair_roundtrip() {
        let server_registry = Arc::new(Registry::new().register(
            "math",
            Module::new().with_unary("double", |kw: StructValue| async move {
                let n = kw.get("n").and_then(|v| v.as_f64()).unwrap_or(0.0);
                Ok(Value::from(n * 2.0))
            }),
        ));

        let (client, _server) = duplex_channel_pair(
            Uid::new("client", "c0"),
            Arc::new(Registry::new()),
            Uid::new("server", "s0"),
            server_registry,
        );

        let result = client.call_unary("math", "double", kwargs([("n", Value::from(3.0))])).await.unwrap();
        assert_eq!(result.as_f64(), Some(6.0));
    }

    #[tokio::test]
    async fn test_in_process_launcher_runs_factory_and_terminates() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);
        let launcher = InProcessLauncher::new(move |args: ChildArgs| {
            let ran = Arc::clone(&ran_clone);
            async move {
                assert_eq!(args.name(), "worker");
                ran.store(true, Ordering::SeqCst);
                std::future::pending::<()>().await
            }
        });

        let mut handle = launcher
            .spawn(
                "corral-actor",
                &[
                    "--uid".to_string(),
                    "worker".to_string(),
                    "i0".to_string(),
                    "--parent".to_string(),
                    "127.0.0.1:1".to_string(),
                    "--arbiter".to_string(),
                    "127.0.0.1:2".to_string(),
                ],
                &[],
            )
            .await
            .unwrap();

        tokio::task::yield_now().await;
        assert!(ran.load(Ordering::SeqCst));

        handle.terminate().await.unwrap();
        let status = handle.wait().await.unwrap();
        assert!(status.success());
    }
}
