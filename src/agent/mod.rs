//! In-process agent endpoint.
//!
//! The agent runs inside the target process. It connects to the session
//! socket, reads exactly one [`UpdateRequest`], hands it to the runtime's
//! [`Redefiner`], and writes back one [`AgentOutcome`].

mod memory;

pub use memory::{InMemoryRuntime, LiveEditRecord};

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tracing::{debug, instrument, warn};

use crate::activator::AgentActivator;
use crate::outcome::AgentOutcome;
use crate::request::{ClassSwapRequest, LiveEditRequest, LiveLiteralUpdateRequest, UpdateRequest};
use crate::transport::{ChannelError, FramedChannel};

/// Redefinition capability of the target runtime.
pub trait Redefiner: Send + Sync {
    /// Redefine every class in the request, or none of them.
    fn swap(&self, request: &ClassSwapRequest) -> AgentOutcome;

    fn live_edit(&self, request: &LiveEditRequest) -> AgentOutcome;

    fn update_literals(&self, request: &LiveLiteralUpdateRequest) -> AgentOutcome;
}

/// Dispatch one request to the matching redefiner operation.
pub fn apply<R: Redefiner + ?Sized>(runtime: &R, request: &UpdateRequest) -> AgentOutcome {
    match request {
        UpdateRequest::ClassSwap(req) => runtime.swap(req),
        UpdateRequest::LiveEdit(req) => runtime.live_edit(req),
        UpdateRequest::LiveLiteralUpdate(req) => runtime.update_literals(req),
    }
}

/// Serve one request on an established connection.
///
/// A request that does not decode is answered with an `UnparseableMessage`
/// outcome; framing errors are returned.
pub async fn serve_connection<S, R>(stream: S, runtime: &R) -> Result<(), ChannelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: Redefiner + ?Sized,
{
    let (reader, writer) = tokio::io::split(stream);
    let mut channel = FramedChannel::new(reader, writer);

    let payload = channel.receive().await?;
    let outcome = match serde_json::from_slice::<UpdateRequest>(&payload) {
        Ok(request) => {
            debug!(kind = request.kind(), package = %request.package_name(), "Applying update");
            apply(runtime, &request)
        }
        Err(e) => {
            warn!(error = %e, "Undecodable update request");
            AgentOutcome::unparseable(e.to_string())
        }
    };

    channel.send_message(&outcome).await?;
    channel.shutdown().await
}

/// Connect to the session socket at `socket` and serve one request.
#[instrument(skip(runtime))]
pub async fn connect_and_serve<R>(socket: &Path, runtime: &R) -> Result<()>
where
    R: Redefiner + ?Sized,
{
    let stream = UnixStream::connect(socket)
        .await
        .with_context(|| format!("Failed to connect to {}", socket.display()))?;
    serve_connection(stream, runtime)
        .await
        .context("Agent connection failed")
}

/// Activator that runs agents as tasks in the current process.
///
/// Each activation starts `agents` connections against the shared runtime.
pub struct InProcessActivator<R> {
    runtime: Arc<R>,
    agents: u32,
}

impl<R> InProcessActivator<R> {
    pub const fn new(runtime: Arc<R>, agents: u32) -> Self {
        Self { runtime, agents }
    }
}

#[async_trait]
impl<R: Redefiner + 'static> AgentActivator for InProcessActivator<R> {
    async fn activate(&self, package: &str, socket: &Path) -> Result<()> {
        debug!(package = %package, agents = self.agents, "Starting in-process agents");
        for _ in 0..self.agents {
            let runtime = Arc::clone(&self.runtime);
            let socket = socket.to_path_buf();
            tokio::spawn(async move {
                if let Err(e) = connect_and_serve(&socket, runtime.as_ref()).await {
                    warn!(error = %e, "In-process agent failed");
                }
            });
        }
        Ok(())
    }
}
