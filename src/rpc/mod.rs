//! JSON-RPC 2.0 control surface.
//!
//! - `protocol`: request/response types and error codes
//! - `transport`: TCP listener with newline-delimited JSON framing
//! - `methods`: dispatch onto `Orchestrator` operations
//! - `client`: used by the CLI subcommands

pub mod client;
pub mod methods;
pub mod protocol;
mod transport;

use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;

use crate::core::Orchestrator;
use transport::Transport;

pub use client::{ClientError, RpcClient};
pub use methods::{CancelResult, DaemonStatus, MethodHandler};
pub use protocol::{Request, Response, RpcError};

pub struct RpcServer {
    transport: Transport,
}

impl RpcServer {
    /// Bind the listener. Port 0 picks a free port; see `local_addr`.
    pub async fn bind(orchestrator: Orchestrator, addr: SocketAddr) -> anyhow::Result<Self> {
        let transport = Transport::bind(addr, MethodHandler::new(orchestrator)).await?;
        Ok(Self { transport })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// Serve until `shutdown` fires.
    pub async fn serve(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        self.transport.listen(shutdown).await
    }
}
