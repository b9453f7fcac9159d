//! Configuration for the deployer and the companion server.
//!
//! Read as JSON from a file, from the `LIVE_UPDATE_CONFIG` environment
//! variable, or taken from defaults when neither is provided.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::server::ServerConfig;
use crate::session::SessionConfig;
use crate::transport::DEFAULT_MAX_MESSAGE_SIZE;

/// Environment variable holding inline JSON configuration.
pub const CONFIG_ENV: &str = "LIVE_UPDATE_CONFIG";

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Directory holding per-session agent sockets.
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,

    /// Largest frame either side accepts.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: u32,

    /// Timeouts (optional).
    #[serde(default)]
    pub session: SessionSettings,

    /// How the companion attaches agents. Required by the companion binary.
    #[serde(default)]
    pub activator: Option<ActivatorConfig>,
}

/// Session timeouts, in seconds as read from JSON.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSettings {
    /// How long the deployer waits for the companion to answer a request.
    /// Must exceed the companion's accept and reply timeouts combined.
    #[serde(default = "default_reply_timeout")]
    pub reply_timeout_seconds: u64,

    /// How long the companion waits for each agent to connect.
    #[serde(default = "default_agent_accept_timeout")]
    pub agent_accept_timeout_seconds: u64,

    /// How long the companion waits for a connected agent's outcome.
    #[serde(default = "default_agent_reply_timeout")]
    pub agent_reply_timeout_seconds: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            reply_timeout_seconds: default_reply_timeout(),
            agent_accept_timeout_seconds: default_agent_accept_timeout(),
            agent_reply_timeout_seconds: default_agent_reply_timeout(),
        }
    }
}

/// Command template used to attach the agent.
#[derive(Debug, Clone, Deserialize)]
pub struct ActivatorConfig {
    pub program: String,

    /// Arguments; `{package}` and `{socket}` are substituted.
    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default = "default_activation_timeout")]
    pub timeout_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_dir: default_socket_dir(),
            max_message_size: default_max_message_size(),
            session: SessionSettings::default(),
            activator: None,
        }
    }
}

impl Config {
    /// Load configuration.
    ///
    /// Priority: explicit `path` > `LIVE_UPDATE_CONFIG` env var > defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        match std::env::var(CONFIG_ENV) {
            Ok(json) => Self::from_json(&json).with_context(|| format!("Failed to parse {CONFIG_ENV}")),
            Err(_) => {
                debug!("No configuration provided, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&json).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        anyhow::ensure!(config.max_message_size > 0, "max_message_size must be positive");
        let session = &config.session;
        let server_budget = session
            .agent_accept_timeout_seconds
            .saturating_add(session.agent_reply_timeout_seconds);
        anyhow::ensure!(
            session.reply_timeout_seconds > server_budget,
            "reply_timeout_seconds ({}) must exceed agent_accept_timeout_seconds + agent_reply_timeout_seconds ({server_budget})",
            session.reply_timeout_seconds
        );
        Ok(config)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::from_settings(&self.session)
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            socket_dir: self.socket_dir.clone(),
            agent_accept_timeout: Duration::from_secs(self.session.agent_accept_timeout_seconds),
            agent_reply_timeout: Duration::from_secs(self.session.agent_reply_timeout_seconds),
            max_message_size: self.max_message_size,
        }
    }
}

fn default_socket_dir() -> PathBuf {
    std::env::temp_dir().join("live-update")
}

const fn default_max_message_size() -> u32 {
    DEFAULT_MAX_MESSAGE_SIZE
}

const fn default_reply_timeout() -> u64 {
    60
}

const fn default_agent_accept_timeout() -> u64 {
    15
}

const fn default_agent_reply_timeout() -> u64 {
    30
}

const fn default_activation_timeout() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_json() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config.socket_dir, std::env::temp_dir().join("live-update"));
        assert_eq!(config.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
        assert_eq!(config.session.reply_timeout_seconds, 60);
        assert_eq!(config.session.agent_accept_timeout_seconds, 15);
        assert!(config.activator.is_none());
    }

    #[test]
    fn parse_full_json() {
        let json = r#"{
            "socket_dir": "/data/local/tmp/live-update",
            "max_message_size": 1048576,
            "session": {
                "reply_timeout_seconds": 45,
                "agent_accept_timeout_seconds": 2
            },
            "activator": {
                "program": "am",
                "args": ["attach-agent", "{package}", "/data/agent.so={socket}"]
            }
        }"#;

        let config = Config::from_json(json).unwrap();
        assert_eq!(config.socket_dir, PathBuf::from("/data/local/tmp/live-update"));
        assert_eq!(config.max_message_size, 1_048_576);

        // Defaults still apply to omitted fields
        assert_eq!(config.session.agent_reply_timeout_seconds, 30);
        let activator = config.activator.as_ref().expect("activator should be set");
        assert_eq!(activator.program, "am");
        assert_eq!(activator.args.len(), 3);
        assert_eq!(activator.timeout_seconds, 10);

        let server = config.server_config();
        assert_eq!(server.agent_accept_timeout, Duration::from_secs(2));
        assert_eq!(server.max_message_size, 1_048_576);
        assert_eq!(config.session_config().reply_timeout, Duration::from_secs(45));
    }

    #[test]
    fn zero_message_size_is_rejected() {
        assert!(Config::from_json(r#"{"max_message_size": 0}"#).is_err());
    }

    #[test]
    fn reply_timeout_must_cover_the_companion() {
        let json = r#"{"session": {"reply_timeout_seconds": 40}}"#;
        let err = Config::from_json(json).unwrap_err();
        assert!(err.to_string().contains("must exceed"), "{err}");

        let json = r#"{"session": {
            "reply_timeout_seconds": 40,
            "agent_accept_timeout_seconds": 10,
            "agent_reply_timeout_seconds": 20
        }}"#;
        let config = Config::from_json(json).unwrap();
        assert!(config.session_config().reply_timeout > config.server_config().request_budget());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live-update.json");
        std::fs::write(&path, r#"{"socket_dir": "/run/lu"}"#).unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.socket_dir, PathBuf::from("/run/lu"));
    }

    #[test]
    fn load_missing_file_fails() {
        let err = Config::load(Some(Path::new("/nonexistent/live-update.json"))).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
