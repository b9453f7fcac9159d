//! Command-template activator.
//!
//! Runs a configured command such as
//! `am attach-agent {package} /data/local/tmp/agent.so={socket}`, with
//! `{package}` and `{socket}` substituted in every argument.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument};

use super::AgentActivator;
use crate::config::ActivatorConfig;

#[derive(Debug, Clone)]
pub struct CommandActivator {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandActivator {
    pub fn new(config: ActivatorConfig) -> Self {
        Self {
            program: config.program,
            args: config.args,
            timeout: Duration::from_secs(config.timeout_seconds),
        }
    }

    fn render_args(&self, package: &str, socket: &Path) -> Vec<String> {
        let socket = socket.to_string_lossy();
        self.args
            .iter()
            .map(|arg| arg.replace("{package}", package).replace("{socket}", &socket))
            .collect()
    }
}

#[async_trait]
impl AgentActivator for CommandActivator {
    #[instrument(skip(self), fields(program = %self.program))]
    async fn activate(&self, package: &str, socket: &Path) -> Result<()> {
        let args = self.render_args(package, socket);
        debug!(?args, "Activating agent");

        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn activator: {}", self.program))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| anyhow::anyhow!("Activator timed out after {:?}", self.timeout))?
            .context("Failed to wait for activator")?;

        anyhow::ensure!(
            output.status.success(),
            "Activator exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );

        debug!("Agent activation requested");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn activator(program: &str, args: &[&str]) -> CommandActivator {
        CommandActivator::new(ActivatorConfig {
            program: program.into(),
            args: args.iter().map(ToString::to_string).collect(),
            timeout_seconds: 5,
        })
    }

    #[test]
    fn placeholders_are_substituted() {
        let activator = activator(
            "am",
            &["attach-agent", "{package}", "/data/agent.so={socket}"],
        );
        let args = activator.render_args("com.app", Path::new("/tmp/s.sock"));
        assert_eq!(args, vec!["attach-agent", "com.app", "/data/agent.so=/tmp/s.sock"]);
    }

    #[tokio::test]
    async fn successful_command() {
        let activator = activator("sh", &["-c", "test \"$0\" = com.app", "{package}"]);
        activator
            .activate("com.app", Path::new("/tmp/s.sock"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn failing_command_reports_stderr() {
        let activator = activator("sh", &["-c", "echo no such process >&2; exit 3"]);
        let err = activator
            .activate("com.app", Path::new("/tmp/s.sock"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no such process"), "{err}");
    }
}
