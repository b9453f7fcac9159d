//! Agent activation side channel.
//!
//! After a request is relayed, the companion asks the target runtime to
//! attach the in-process agent, handing it the session socket as its only
//! argument. How that attachment happens is platform specific; the server
//! only sees this trait.

mod command;

pub use command::CommandActivator;

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;

/// Attach-by-name capability of the target runtime.
///
/// Activation is fire-and-forget from the server's point of view: a failure
/// is logged, and the missing agent shows up later as an incomplete reply.
#[async_trait]
pub trait AgentActivator: Send + Sync {
    /// Ask `package`'s running process to start an agent connected to `socket`.
    async fn activate(&self, package: &str, socket: &Path) -> Result<()>;
}
