//! Abstraction over how a child actor process comes into existence.
//!
//! Grounded on how the teacher hides transport construction behind traits
//! (`OpenStream` in `client.rs`) rather than calling `tokio::net`/`tokio::process`
//! directly at call sites; this module does the same for process spawn so
//! nursery tests can substitute [`InProcessLauncher`] for the real
//! [`TokioProcessLauncher`].

use std::process::ExitStatus;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::error::{Error, Result};

/// A running child process (or its in-process stand-in).
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    fn id(&self) -> Option<u32>;
    async fn wait(&mut self) -> Result<ExitStatus>;
    async fn terminate(&mut self) -> Result<()>;
    async fn kill(&mut self) -> Result<()>;
}

/// Spawns child actor processes.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn spawn(
        &self,
        command: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<Box<dyn ProcessHandle>>;
}

/// Default launcher: wraps `tokio::process::Command`.
#[derive(Debug, Default, Clone)]
pub struct TokioProcessLauncher;

#[async_trait]
impl ProcessLauncher for TokioProcessLauncher {
    async fn spawn(
        &self,
        command: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<Box<dyn ProcessHandle>> {
        let mut cmd = Command::new(command);
        cmd.args(args);
        for (k, v) in env {
            cmd.env(k, v);
        }
        cmd.kill_on_drop(true);
        let child = cmd.spawn()?;
        Ok(Box::new(TokioProcessHandle { child }))
    }
}

struct TokioProcessHandle {
    child: Child,
}

#[async_trait]
impl ProcessHandle for TokioProcessHandle {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> Result<ExitStatus> {
        Ok(self.child.wait().await?)
    }

    async fn terminate(&mut self) -> Result<()> {
        #[cfg(unix)]
        {
            if let Some(pid) = self.child.id() {
                // SIGTERM; nursery escalates to kill() after a grace period.
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
            }
            Ok(())
        }
        #[cfg(not(unix))]
        {
            self.kill().await
        }
    }

    async fn kill(&mut self) -> Result<()> {
        self.child.kill().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tokio_launcher_spawns_and_waits() {
        let launcher = TokioProcessLauncher;
        let mut handle = launcher
            .spawn("true", &[], &[])
            .await
            .expect("spawn true(1)");
        let status = handle.wait().await.unwrap();
        assert!(status.success());
    }
}
