//! Host-side session with the companion process.
//!
//! A session owns one transport and walks a small state machine:
//! `Idle → SocketOpening → SocketOpen → AwaitingReply → SocketOpen → … → Closed`.
//! Only one request is ever outstanding; every operation takes `&mut self`.
//! Any transport failure abandons the session for good.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::SessionSettings;
use crate::outcome::{AgentOutcome, UpdateReply};
use crate::request::UpdateRequest;
use crate::transport::{ChannelError, SendStatus, ServerRequest, ServerResponse, Transport};

/// Parsed session configuration with `Duration` fields.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long to wait for the companion to answer one request.
    pub reply_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(60),
        }
    }
}

impl SessionConfig {
    pub fn from_settings(settings: &SessionSettings) -> Self {
        Self {
            reply_timeout: Duration::from_secs(settings.reply_timeout_seconds),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    SocketOpening,
    SocketOpen,
    AwaitingReply,
    Closed,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,

    #[error("session is {actual:?}, expected {expected:?}")]
    InvalidState {
        expected: SessionState,
        actual: SessionState,
    },

    #[error("companion could not open the agent socket: {0}")]
    SocketFailed(String),

    #[error("channel closed abnormally: {0}")]
    ChannelClosedAbnormally(#[source] ChannelError),

    #[error("companion exited: {0}")]
    CompanionExited(String),

    #[error("unexpected companion response: {0}")]
    UnexpectedResponse(String),

    /// Not every agent replied. `outcomes` holds the replies that did arrive.
    #[error("only {received} of {expected} agents replied")]
    AgentsUnavailable {
        expected: u32,
        received: u32,
        outcomes: Vec<AgentOutcome>,
    },

    #[error("companion has no agent socket open")]
    NoSocket,
}

impl SessionError {
    /// Whether the session was abandoned because of this error.
    pub const fn is_transport_fatal(&self) -> bool {
        matches!(
            self,
            Self::ChannelClosedAbnormally(_) | Self::CompanionExited(_) | Self::UnexpectedResponse(_)
        )
    }
}

pub struct Session {
    id: String,
    state: SessionState,
    transport: Box<dyn Transport>,
    config: SessionConfig,
}

impl Session {
    /// Create a session with a fresh socket name.
    pub fn new(transport: Box<dyn Transport>, config: SessionConfig) -> Self {
        Self {
            id: format!("live-update-{}", Uuid::new_v4()),
            state: SessionState::Idle,
            transport,
            config,
        }
    }

    /// Use `id` as the socket name instead of a generated one.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Ask the companion to open the socket agents will connect to.
    ///
    /// A refusal returns the session to `Idle` so the caller can retry.
    #[instrument(skip(self), fields(session = %self.id))]
    pub async fn open_socket(&mut self) -> Result<(), SessionError> {
        self.expect_state(SessionState::Idle)?;
        self.state = SessionState::SocketOpening;

        let req = ServerRequest::OpenSocket {
            socket_name: self.id.clone(),
        };
        match self.exchange(&req).await? {
            ServerResponse::SocketOpened { socket_name } if socket_name == self.id => {
                info!("Agent socket opened");
                self.state = SessionState::SocketOpen;
                Ok(())
            }
            ServerResponse::SocketFailed { reason } => {
                warn!(reason = %reason, "Companion could not open agent socket");
                self.state = SessionState::Idle;
                Err(SessionError::SocketFailed(reason))
            }
            other => Err(self.unexpected(&other).await),
        }
    }

    /// Relay `request` to `expected_replies` agents and collect their outcomes.
    #[instrument(skip(self, request), fields(session = %self.id, kind = request.kind()))]
    pub async fn send_update(
        &mut self,
        request: UpdateRequest,
        expected_replies: u32,
    ) -> Result<UpdateReply, SessionError> {
        self.expect_state(SessionState::SocketOpen)?;
        self.state = SessionState::AwaitingReply;

        let req = ServerRequest::SendAgentMessage {
            agent_count: expected_replies,
            request,
        };
        let (status, outcomes) = match self.exchange(&req).await? {
            ServerResponse::AgentMessage { status, outcomes } => (status, outcomes),
            other => return Err(self.unexpected(&other).await),
        };

        match status {
            SendStatus::Complete => {
                self.state = SessionState::SocketOpen;
                debug!(outcomes = outcomes.len(), "Update reply received");
                Ok(UpdateReply::new(outcomes))
            }
            SendStatus::Incomplete { expected, received } => {
                self.state = SessionState::SocketOpen;
                warn!(expected, received, "Not every agent replied");
                Err(SessionError::AgentsUnavailable {
                    expected,
                    received,
                    outcomes,
                })
            }
            SendStatus::NoSocket => {
                // The companion lost the socket; it has to be opened again.
                self.state = SessionState::Idle;
                Err(SessionError::NoSocket)
            }
        }
    }

    /// Close the session. Safe to call from any state, any number of times.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        if let Err(e) = self.transport.shutdown().await {
            warn!(session = %self.id, error = %e, "Error shutting down transport");
        }
        info!(session = %self.id, "Session closed");
    }

    fn expect_state(&self, expected: SessionState) -> Result<(), SessionError> {
        match self.state {
            actual if actual == expected => Ok(()),
            SessionState::Closed => Err(SessionError::Closed),
            actual => Err(SessionError::InvalidState { expected, actual }),
        }
    }

    /// One request/response cycle. Every failure here abandons the session.
    async fn exchange(&mut self, req: &ServerRequest) -> Result<ServerResponse, SessionError> {
        let timeout = self.config.reply_timeout;
        let result = match tokio::time::timeout(timeout, self.transport.request(req)).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Timeout(timeout)),
        };

        match result {
            Ok(ServerResponse::Exited { reason }) => {
                warn!(session = %self.id, reason = %reason, "Companion exited");
                self.close().await;
                Err(SessionError::CompanionExited(reason))
            }
            Ok(response) => Ok(response),
            Err(e) => {
                warn!(session = %self.id, error = %e, "Channel failed, abandoning session");
                self.close().await;
                Err(SessionError::ChannelClosedAbnormally(e))
            }
        }
    }

    async fn unexpected(&mut self, response: &ServerResponse) -> SessionError {
        let error = SessionError::UnexpectedResponse(format!("{response:?}"));
        warn!(session = %self.id, error = %error, "Abandoning session");
        self.close().await;
        error
    }
}
