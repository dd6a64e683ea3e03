//! Control surface: newline-delimited JSON-RPC 2.0 over TCP.
//!
//! - `protocol`: request/response types and error codes
//! - `transport`: listener and per-connection framing
//! - `methods`: dispatch to the orchestrator
//! - `client`: what the CLI subcommands use

pub mod client;
pub mod methods;
pub mod protocol;
mod transport;

use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;

use crate::core::orchestrator::Orchestrator;
use transport::Transport;

pub use client::{ClientError, RpcClient};
pub use methods::MethodHandler;
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

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        self.transport.serve(shutdown).await
    }
}
