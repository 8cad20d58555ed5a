//! Multi-port L4 proxy.
//!
//! This module provides:
//! - The shared listening socket and accept loop
//! - Port to service routing
//! - Round-robin backend selection
//! - Per-connection sessions with bounded dial retries
//!
//! ## Architecture
//!
//! ```text
//! Client -> (steering) -> ProxyServer -> ConnectionSession -> RoutingTable -> LoadBalancer -> Backend
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{ProxyServer, RoutingTable, ServerConfig};
//!
//! let routing = Arc::new(RoutingTable::from_apps(&apps)?);
//! let server = ProxyServer::bind(ServerConfig::new(8080), routing).await?;
//! steering.register(&server.steering_registration())?;
//! server.run(shutdown_rx).await?;
//! ```

mod balancer;
mod router;
mod server;
mod session;

pub use balancer::LoadBalancer;
pub use router::{RoutingTable, SharedRoutingTable};
pub use server::{ProxyServer, ServerConfig, ServerStats, ACCEPT_POLL_INTERVAL};
pub use session::{
    ConnectionSession, Dialer, Established, RecoveryMode, RelaySummary, SessionConfig,
    SessionState, TcpDialer, DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_RETRIES,
    DEFAULT_SESSION_TIMEOUT,
};
