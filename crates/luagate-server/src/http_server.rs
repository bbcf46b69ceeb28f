//! HTTP Server for luagate
//!
//! Binds a TCP listener and serves the [`http_router`](crate::http_router)
//! routes with axum. The peer address of every connection is recorded so
//! admission control can fall back to it when no client id header is sent.
//!
//! # Example
//!
//! ```no_run
//! use luagate_server::{Gateway, GatewayConfig, HttpServer};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let gateway = Arc::new(Gateway::new(GatewayConfig::new("./scripts")).unwrap());
//!     let server = HttpServer::new(gateway);
//!     server.run("127.0.0.1:8080".parse().unwrap()).await.unwrap();
//! }
//! ```

use luagate_common::error::GateError;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::gateway::Gateway;
use crate::http_router;

pub struct HttpServer {
    gateway: Arc<Gateway>,
}

impl HttpServer {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Binds `addr` and serves until the process exits.
    pub async fn run(self, addr: SocketAddr) -> Result<(), GateError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GateError::Transport(format!("Failed to bind to {}: {}", addr, e)))?;
        self.serve(listener).await
    }

    /// Serves on an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<(), GateError> {
        let local_addr = listener
            .local_addr()
            .map_err(|e| GateError::Transport(format!("Failed to get local address: {}", e)))?;
        tracing::info!("HTTP server listening on {}", local_addr);

        let app = http_router::router(self.gateway);
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .map_err(|e| GateError::Transport(format!("Server error: {}", e)))
    }
}
