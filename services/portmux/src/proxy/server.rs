//! Shared listening socket and accept loop.
//!
//! Every steered port ends up on this one loopback socket. The server
//! accepts, then hands each connection to its own session task; it never
//! waits on a session. Shutdown stops accepting and closes the socket but
//! leaves running sessions to finish on their own deadlines.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};

use super::router::SharedRoutingTable;
use super::session::{
    ConnectionSession, Dialer, RelaySummary, SessionConfig, TcpDialer, DEFAULT_CONNECT_TIMEOUT,
};
use crate::error::ProxyError;
use crate::steering::SteeringRegistration;

/// How long one accept attempt waits before the shutdown signal is polled
/// again.
pub const ACCEPT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Configuration for the proxy server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Loopback port to bind.
    pub port: u16,
    /// Per-session settings.
    pub session: SessionConfig,
    /// Bound on a single backend dial.
    pub connect_timeout: Duration,
}

impl ServerConfig {
    /// Create a configuration with default session settings.
    pub fn new(port: u16) -> Self {
        Self {
            port,
            session: SessionConfig::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    fn bind_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.port))
    }
}

/// Statistics for the server.
#[derive(Debug, Default)]
pub struct ServerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Sessions currently running.
    pub connections_active: AtomicU64,
    /// Sessions finished, for any reason.
    pub connections_closed: AtomicU64,
    /// Sessions whose original port could not be recovered.
    pub port_recovery_failures: AtomicU64,
    /// Sessions whose port maps to no service.
    pub routing_misses: AtomicU64,
    /// Individual failed dials, including those later retried.
    pub dial_failures: AtomicU64,
    /// Sessions that ran out of dial attempts.
    pub sessions_aborted: AtomicU64,
    /// Bytes proxied to backends.
    pub bytes_to_backend: AtomicU64,
    /// Bytes proxied from backends.
    pub bytes_from_backend: AtomicU64,
}

impl ServerStats {
    fn record(&self, result: &Result<RelaySummary, ProxyError>) {
        match result {
            Ok(summary) => {
                self.dial_failures
                    .fetch_add(summary.replays as u64, Ordering::Relaxed);
                self.bytes_to_backend
                    .fetch_add(summary.to_destination, Ordering::Relaxed);
                self.bytes_from_backend
                    .fetch_add(summary.from_destination, Ordering::Relaxed);
            }
            Err(ProxyError::PortRecovery(_)) => {
                self.port_recovery_failures.fetch_add(1, Ordering::Relaxed);
            }
            Err(ProxyError::RoutingMiss { .. }) => {
                self.routing_misses.fetch_add(1, Ordering::Relaxed);
            }
            Err(ProxyError::RetriesExhausted { attempts, .. }) => {
                self.dial_failures
                    .fetch_add(*attempts as u64, Ordering::Relaxed);
                self.sessions_aborted.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {}
        }
    }
}

/// The proxy: one socket, one accept loop, one session task per connection.
pub struct ProxyServer {
    /// Server configuration.
    config: ServerConfig,
    /// The shared listening socket.
    listener: TcpListener,
    /// Port and service routing.
    routing: SharedRoutingTable,
    /// Opens backend connections.
    dialer: Arc<dyn Dialer>,
    /// Statistics.
    stats: Arc<ServerStats>,
}

impl ProxyServer {
    /// Bind the shared socket on loopback.
    pub async fn bind(config: ServerConfig, routing: SharedRoutingTable) -> io::Result<Self> {
        let dialer = Arc::new(TcpDialer::new(config.connect_timeout));
        Self::bind_with_dialer(config, routing, dialer).await
    }

    /// Bind the shared socket, dialing backends through `dialer`.
    pub async fn bind_with_dialer(
        config: ServerConfig,
        routing: SharedRoutingTable,
        dialer: Arc<dyn Dialer>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr()).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            steered_ports = routing.ports().len(),
            session_timeout_ms = config.session.timeout.as_millis() as u64,
            max_retries = config.session.max_retries,
            "Proxy socket bound"
        );

        Ok(Self {
            config,
            listener,
            routing,
            dialer,
            stats: Arc::new(ServerStats::default()),
        })
    }

    /// Get the local address this server is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Every port the steering layer must redirect to this socket.
    pub fn steered_ports(&self) -> Vec<u16> {
        self.routing.ports()
    }

    /// Raw descriptor of the shared socket. Lent to the steering layer; the
    /// server still owns and closes it.
    pub fn listening_socket_descriptor(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    /// Registration to hand to the steering layer.
    pub fn steering_registration(&self) -> SteeringRegistration {
        SteeringRegistration::new(self.listening_socket_descriptor(), self.steered_ports())
    }

    /// Get server statistics.
    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.stats)
    }

    /// Accept until `shutdown` flips to true (or its sender goes away), then
    /// close the socket.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Proxy running");

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                accepted = timeout(ACCEPT_POLL_INTERVAL, self.listener.accept()) => {
                    match accepted {
                        // Poll window elapsed, check for shutdown again
                        Err(_) => continue,
                        Ok(Ok((stream, peer_addr))) => self.spawn_session(stream, peer_addr),
                        Ok(Err(e)) => {
                            error!(error = %e, "Accept error");
                            // Brief sleep to avoid tight loop on persistent errors
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }

        info!(
            bind_addr = %local_addr,
            active_sessions = self.stats.connections_active.load(Ordering::Relaxed),
            "Shutting down proxy"
        );

        Ok(())
    }

    fn spawn_session(&self, stream: TcpStream, peer_addr: SocketAddr) {
        self.stats
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);
        self.stats
            .connections_active
            .fetch_add(1, Ordering::Relaxed);

        let session = ConnectionSession::new(
            stream,
            peer_addr,
            Arc::clone(&self.routing),
            Arc::clone(&self.dialer),
            self.config.session.clone(),
        );
        let stats = Arc::clone(&self.stats);

        tokio::spawn(
            async move {
                let result = session.run().await;
                stats.record(&result);

                match &result {
                    Ok(summary) => debug!(
                        bytes_to_backend = summary.to_destination,
                        bytes_from_backend = summary.from_destination,
                        "Session closed"
                    ),
                    Err(e) => warn!(reason = e.reason_code(), error = %e, "Session ended"),
                }

                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                stats.connections_closed.fetch_add(1, Ordering::Relaxed);
            }
            .instrument(tracing::info_span!("session", peer = %peer_addr)),
        );
    }
}
