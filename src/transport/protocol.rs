//! Companion protocol message types.
//!
//! JSON envelopes carried in frames between the deployer and the companion
//! process. There are no correlation identifiers: each request gets exactly
//! one response, matched by arrival order.

use serde::{Deserialize, Serialize};

use crate::outcome::AgentOutcome;
use crate::request::UpdateRequest;

/// Request sent from deployer to companion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerRequest {
    /// Open the per-session socket agents will connect to.
    OpenSocket { socket_name: String },
    /// Activate the agent and relay `request` to `agent_count` agents.
    SendAgentMessage {
        agent_count: u32,
        request: UpdateRequest,
    },
}

/// Response sent from companion to deployer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerResponse {
    SocketOpened { socket_name: String },
    SocketFailed { reason: String },
    /// Aggregated agent outcomes, in arrival order.
    AgentMessage {
        status: SendStatus,
        outcomes: Vec<AgentOutcome>,
    },
    /// The companion could not decode a request and has stopped serving.
    Exited { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SendStatus {
    /// Every expected agent replied.
    Complete,
    /// Some agents never connected or dropped their connection.
    Incomplete { expected: u32, received: u32 },
    /// No socket was open when the request arrived.
    NoSocket,
}
