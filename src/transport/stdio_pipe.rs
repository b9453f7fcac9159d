//! Stdin/stdout pipe transport to a companion process.
//!
//! Owns the companion child process and talks framed JSON over the child's
//! stdin (requests) and stdout (responses). The child's stderr is inherited
//! so its logs land next to the deployer's.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::protocol::{ServerRequest, ServerResponse};
use super::{ChannelError, ChannelTransport, FramedChannel, Transport};

/// How long a companion gets to exit on its own after its stdin closes.
const EXIT_GRACE: Duration = Duration::from_secs(5);

pub struct StdioPipeTransport {
    child: Mutex<Child>,
    channel: ChannelTransport<ChildStdout, ChildStdin>,
}

impl StdioPipeTransport {
    /// Spawn the companion process.
    ///
    /// `program` is typically a wrapper that starts `live-update-server --stdio`
    /// inside the target device or sandbox.
    pub fn spawn(program: &str, args: &[String], max_message_size: u32) -> Result<Self> {
        debug!(program = %program, ?args, "Spawning companion process");

        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn companion: {program}"))?;

        let stdin = child.stdin.take().context("Failed to take companion stdin")?;
        let stdout = child.stdout.take().context("Failed to take companion stdout")?;

        let channel = FramedChannel::new(stdout, stdin).with_max_message_size(max_message_size);

        Ok(Self {
            child: Mutex::new(child),
            channel: ChannelTransport::new(channel),
        })
    }
}

#[async_trait]
impl Transport for StdioPipeTransport {
    async fn request(&self, req: &ServerRequest) -> Result<ServerResponse, ChannelError> {
        self.channel.request(req).await
    }

    async fn shutdown(&self) -> Result<()> {
        // Closing stdin lets the companion finish cleanly.
        self.channel.shutdown().await?;

        let mut child = self.child.lock().await;
        match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "Companion exited"),
            Ok(Err(e)) => warn!(error = %e, "Failed to wait for companion"),
            Err(_) => {
                warn!("Companion did not exit after its input closed, killing it");
                let _ = child.kill().await;
            }
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.channel.is_alive()
    }
}
