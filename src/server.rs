//! Companion server: the process on the target side of the session.
//!
//! Reads framed requests from the deployer (normally stdin/stdout), owns the
//! per-session agent socket, fires agent activation, and relays each update
//! to the agents that connect back.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{UnixListener, UnixStream};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::activator::AgentActivator;
use crate::outcome::AgentOutcome;
use crate::request::UpdateRequest;
use crate::transport::{
    ChannelError, FramedChannel, SendStatus, ServerRequest, ServerResponse, DEFAULT_MAX_MESSAGE_SIZE,
};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub socket_dir: PathBuf,
    /// Bound on waiting for each agent to connect.
    pub agent_accept_timeout: Duration,
    /// Bound on waiting for a connected agent's outcome. Together with
    /// `agent_accept_timeout` this also caps the whole request.
    pub agent_reply_timeout: Duration,
    pub max_message_size: u32,
}

impl ServerConfig {
    /// Upper bound on relaying one update, from activation to the last reply.
    pub fn request_budget(&self) -> Duration {
        self.agent_accept_timeout + self.agent_reply_timeout
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_dir: std::env::temp_dir().join("live-update"),
            agent_accept_timeout: Duration::from_secs(15),
            agent_reply_timeout: Duration::from_secs(30),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// A bound agent socket. The socket file is removed when this is dropped.
struct AgentSocket {
    name: String,
    path: PathBuf,
    listener: UnixListener,
}

impl AgentSocket {
    /// Replace the listener so connections still queued from an earlier
    /// request are refused instead of served the next one.
    fn rebind(&mut self) -> std::io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        self.listener = UnixListener::bind(&self.path)?;
        Ok(())
    }
}

impl Drop for AgentSocket {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(socket = %self.name, "Removed agent socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove agent socket"),
        }
    }
}

pub struct SessionServer {
    config: ServerConfig,
    activator: Arc<dyn AgentActivator>,
    socket: Option<AgentSocket>,
}

impl SessionServer {
    pub fn new(config: ServerConfig, activator: Arc<dyn AgentActivator>) -> Self {
        Self {
            config,
            activator,
            socket: None,
        }
    }

    /// Serve requests until the deployer closes the channel.
    ///
    /// A clean end of stream returns `Ok`. An undecodable request is answered
    /// with [`ServerResponse::Exited`] and ends serving with `Ok`. Framing
    /// errors end serving with the error.
    pub async fn serve<R, W>(&mut self, reader: R, writer: W) -> Result<(), ChannelError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut channel =
            FramedChannel::new(reader, writer).with_max_message_size(self.config.max_message_size);
        info!("Companion serving");

        let result = loop {
            let payload = match channel.receive().await {
                Ok(payload) => payload,
                Err(ChannelError::Closed) => {
                    info!("Deployer closed the channel");
                    break Ok(());
                }
                Err(e) => {
                    error!(error = %e, "Framing error, stopping");
                    break Err(e);
                }
            };

            let request: ServerRequest = match serde_json::from_slice(&payload) {
                Ok(request) => request,
                Err(e) => {
                    warn!(error = %e, len = payload.len(), "Undecodable request, exiting");
                    let exited = ServerResponse::Exited {
                        reason: "unparseable request".into(),
                    };
                    if let Err(e) = channel.send_message(&exited).await {
                        warn!(error = %e, "Failed to report exit");
                    }
                    break Ok(());
                }
            };

            let response = self.handle(request).await;
            if let Err(e) = channel.send_message(&response).await {
                error!(error = %e, "Failed to send response, stopping");
                break Err(e);
            }
        };

        self.socket = None;
        if let Err(e) = channel.shutdown().await {
            debug!(error = %e, "Channel shutdown failed");
        }
        result
    }

    async fn handle(&mut self, request: ServerRequest) -> ServerResponse {
        match request {
            ServerRequest::OpenSocket { socket_name } => self.open_socket(socket_name).await,
            ServerRequest::SendAgentMessage {
                agent_count,
                request,
            } => self.forward(agent_count, &request).await,
        }
    }

    /// Bind the agent socket, replacing any previous one.
    #[instrument(skip(self))]
    async fn open_socket(&mut self, socket_name: String) -> ServerResponse {
        self.socket = None;

        if !is_valid_socket_name(&socket_name) {
            return ServerResponse::SocketFailed {
                reason: format!("invalid socket name: {socket_name:?}"),
            };
        }

        if let Err(e) = tokio::fs::create_dir_all(&self.config.socket_dir).await {
            return ServerResponse::SocketFailed {
                reason: format!("cannot create {}: {e}", self.config.socket_dir.display()),
            };
        }

        let path = self.config.socket_dir.join(&socket_name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "Removed stale socket file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return ServerResponse::SocketFailed {
                    reason: format!("cannot replace {}: {e}", path.display()),
                }
            }
        }

        match UnixListener::bind(&path) {
            Ok(listener) => {
                info!(path = %path.display(), "Agent socket listening");
                self.socket = Some(AgentSocket {
                    name: socket_name.clone(),
                    path,
                    listener,
                });
                ServerResponse::SocketOpened { socket_name }
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to bind agent socket");
                ServerResponse::SocketFailed {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Activate agents and relay `request` to up to `agent_count` of them.
    ///
    /// The whole exchange is bounded by [`ServerConfig::request_budget`], no
    /// matter how many agents are expected.
    #[instrument(skip(self, request), fields(kind = request.kind()))]
    async fn forward(&mut self, agent_count: u32, request: &UpdateRequest) -> ServerResponse {
        let rebound = match self.socket.as_mut() {
            Some(socket) => socket.rebind(),
            None => {
                warn!("Update received before a socket was opened");
                return no_socket();
            }
        };
        if let Err(e) = rebound {
            warn!(error = %e, "Failed to rebind agent socket");
            self.socket = None;
            return no_socket();
        }
        let Some(socket) = &self.socket else {
            return no_socket();
        };

        if agent_count > 0 {
            let activator = Arc::clone(&self.activator);
            let package = request.package_name().to_owned();
            let path = socket.path.clone();
            tokio::spawn(async move {
                if let Err(e) = activator.activate(&package, &path).await {
                    warn!(package = %package, error = %e, "Agent activation failed");
                }
            });
        }

        let deadline = Instant::now() + self.config.request_budget();
        let mut outcomes = Vec::new();
        for index in 0..agent_count {
            let accept_by = deadline.min(Instant::now() + self.config.agent_accept_timeout);
            let stream = match tokio::time::timeout_at(accept_by, socket.listener.accept()).await {
                Ok(Ok((stream, _))) => stream,
                Ok(Err(e)) => {
                    warn!(index, error = %e, "Failed to accept agent connection");
                    break;
                }
                Err(_) => {
                    warn!(index, "Timed out waiting for agent to connect");
                    break;
                }
            };

            match self.exchange_with_agent(stream, request, deadline).await {
                Ok(outcome) => {
                    debug!(index, status = ?outcome.status, "Agent replied");
                    outcomes.push(outcome);
                }
                Err(e) => warn!(index, error = %e, "Agent dropped its connection"),
            }
        }

        let received = u32::try_from(outcomes.len()).unwrap_or(u32::MAX);
        let status = if received == agent_count {
            SendStatus::Complete
        } else {
            SendStatus::Incomplete {
                expected: agent_count,
                received,
            }
        };
        ServerResponse::AgentMessage { status, outcomes }
    }

    /// Send the request to one agent and read its single outcome.
    async fn exchange_with_agent(
        &self,
        stream: UnixStream,
        request: &UpdateRequest,
        deadline: Instant,
    ) -> Result<AgentOutcome, ChannelError> {
        let (reader, writer) = stream.into_split();
        let mut channel =
            FramedChannel::new(reader, writer).with_max_message_size(self.config.max_message_size);

        channel.send_message(request).await?;
        let timeout = self.config.agent_reply_timeout;
        let reply_by = deadline.min(Instant::now() + timeout);
        let payload = tokio::time::timeout_at(reply_by, channel.receive())
            .await
            .map_err(|_| ChannelError::Timeout(timeout))??;

        Ok(serde_json::from_slice(&payload).unwrap_or_else(|e| {
            warn!(error = %e, "Undecodable agent reply");
            AgentOutcome::unparseable(format!("undecodable agent reply: {e}"))
        }))
    }
}

fn no_socket() -> ServerResponse {
    ServerResponse::AgentMessage {
        status: SendStatus::NoSocket,
        outcomes: Vec::new(),
    }
}

/// Socket names become a single path component under the socket directory.
fn is_valid_socket_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\0'])
}
