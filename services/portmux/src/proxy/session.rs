//! Per-connection session handling.
//!
//! A session walks `Accepted -> PortRecovered -> Dialing -> Relaying ->
//! Closed`, or ends in `Aborted` when no backend answers within the retry
//! budget. Port recovery failures and routing misses end the session before
//! any dial is attempted.
//!
//! Each leg gets one deadline: the origin leg when the connection is
//! accepted, the destination leg when the dial succeeds. Deadlines are not
//! re-armed while relaying, so a leg is torn down once its window closes
//! even if traffic is still flowing.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use super::router::SharedRoutingTable;
use crate::error::ProxyError;

/// Default deadline for each leg of a session.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(45);

/// Default number of dial attempts per session.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default bound on a single backend dial.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

const RELAY_BUFFER_SIZE: usize = 8192;

/// How a session learns which steered port the client originally targeted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryMode {
    /// The accepted socket's local address carries the original port.
    #[default]
    LocalAddr,
    /// Ask the kernel for `SO_ORIGINAL_DST` (netfilter REDIRECT).
    OriginalDst,
}

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Accepted,
    PortRecovered,
    Dialing,
    Relaying,
    Closed,
    Aborted,
}

/// Settings shared by every session of a server.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Deadline applied to each leg.
    pub timeout: Duration,
    /// Dial attempts before the session is aborted.
    pub max_retries: u32,
    /// Port recovery strategy.
    pub recovery: RecoveryMode,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SESSION_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            recovery: RecoveryMode::default(),
        }
    }
}

/// Opens connections to backend targets.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Resolve `target` (`host:port`) and connect to it.
    async fn dial(&self, target: &str) -> io::Result<TcpStream>;
}

/// Dialer backed by the runtime resolver and plain TCP connects.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    connect_timeout: Duration,
}

impl TcpDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, target: &str) -> io::Result<TcpStream> {
        let connect = async {
            let addr = tokio::net::lookup_host(target).await?.next().ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no addresses for {}", target),
                )
            })?;
            TcpStream::connect(addr).await
        };

        match timeout(self.connect_timeout, connect).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
        }
    }
}

/// A connected backend leg, ready to relay.
#[derive(Debug)]
pub struct Established {
    destination: TcpStream,
    target: String,
    deadline: Instant,
}

impl Established {
    /// Target address the session dialed.
    pub fn target(&self) -> &str {
        &self.target
    }
}

/// Bytes moved by a finished relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelaySummary {
    pub to_destination: u64,
    pub from_destination: u64,
    /// Failed dials before the successful one.
    pub replays: u32,
}

/// One accepted connection and everything needed to serve it.
pub struct ConnectionSession {
    origin: TcpStream,
    peer_addr: SocketAddr,
    routing: SharedRoutingTable,
    dialer: Arc<dyn Dialer>,
    config: SessionConfig,
    state: SessionState,
    original_port: Option<u16>,
    replay_count: u32,
    origin_deadline: Instant,
}

impl ConnectionSession {
    /// Start a session for a freshly accepted connection. The origin leg's
    /// deadline starts now.
    pub fn new(
        origin: TcpStream,
        peer_addr: SocketAddr,
        routing: SharedRoutingTable,
        dialer: Arc<dyn Dialer>,
        config: SessionConfig,
    ) -> Self {
        let origin_deadline = Instant::now() + config.timeout;
        Self {
            origin,
            peer_addr,
            routing,
            dialer,
            config,
            state: SessionState::Accepted,
            original_port: None,
            replay_count: 0,
            origin_deadline,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Failed dial attempts so far.
    pub fn replay_count(&self) -> u32 {
        self.replay_count
    }

    pub fn original_port(&self) -> Option<u16> {
        self.original_port
    }

    /// Drive the session to completion. Both legs are closed on return.
    pub async fn run(mut self) -> Result<RelaySummary, ProxyError> {
        self.recover_port()?;
        let established = self.connect_backend().await?;
        Ok(self.relay(established).await)
    }

    /// Read back the port the client originally connected to.
    pub fn recover_port(&mut self) -> Result<u16, ProxyError> {
        let recovered = match self.config.recovery {
            RecoveryMode::LocalAddr => self
                .origin
                .local_addr()
                .map(|addr| addr.port())
                .map_err(|e| ProxyError::PortRecovery(format!("local address unavailable: {}", e))),
            RecoveryMode::OriginalDst => original_dst_port(&self.origin),
        };

        let port = match recovered {
            Ok(0) => Err(ProxyError::PortRecovery("recovered port 0".to_string())),
            other => other,
        }
        .inspect_err(|_| self.state = SessionState::Closed)?;

        self.original_port = Some(port);
        self.state = SessionState::PortRecovered;
        debug!(port = port, "Original port recovered");
        Ok(port)
    }

    /// Resolve the service for the recovered port and dial its backends in
    /// rotation until one answers or the retry budget runs out.
    pub async fn connect_backend(&mut self) -> Result<Established, ProxyError> {
        let port = match self.original_port {
            Some(port) => port,
            None => self.recover_port()?,
        };

        self.state = SessionState::Dialing;

        let routing = Arc::clone(&self.routing);
        let Some(service) = routing.resolve_service(port) else {
            self.state = SessionState::Closed;
            return Err(ProxyError::RoutingMiss { port });
        };

        loop {
            if self.replay_count >= self.config.max_retries {
                self.state = SessionState::Aborted;
                return Err(ProxyError::RetriesExhausted {
                    service: service.to_string(),
                    attempts: self.replay_count,
                });
            }

            let Some(target) = routing.resolve_backend(service) else {
                self.state = SessionState::Closed;
                return Err(ProxyError::RoutingMiss { port });
            };

            info!(
                peer_addr = %self.peer_addr,
                port = port,
                service = %service,
                target = %target,
                "Forwarding connection"
            );

            match self.dialer.dial(target).await {
                Ok(destination) => {
                    self.state = SessionState::Relaying;
                    return Ok(Established {
                        destination,
                        target: target.to_string(),
                        deadline: Instant::now() + self.config.timeout,
                    });
                }
                Err(source) => {
                    self.replay_count += 1;
                    let err = ProxyError::Dial {
                        target: target.to_string(),
                        source,
                    };
                    warn!(
                        service = %service,
                        attempt = self.replay_count,
                        error = %err,
                        "Backend dial failed"
                    );
                }
            }
        }
    }

    /// Copy bytes both ways until each direction hits end-of-stream, an
    /// error, or its deadline.
    pub async fn relay(&mut self, established: Established) -> RelaySummary {
        let Established {
            mut destination,
            target,
            deadline: destination_deadline,
        } = established;

        let (mut origin_read, mut origin_write) = self.origin.split();
        let (mut destination_read, mut destination_write) = destination.split();

        let (outbound, inbound) = tokio::join!(
            forward(
                &mut origin_read,
                &mut destination_write,
                self.origin_deadline,
                destination_deadline,
            ),
            forward(
                &mut destination_read,
                &mut origin_write,
                destination_deadline,
                self.origin_deadline,
            ),
        );

        let summary = RelaySummary {
            to_destination: outbound.bytes,
            from_destination: inbound.bytes,
            replays: self.replay_count,
        };

        outbound.log("origin->destination", self.peer_addr, &target);
        inbound.log("destination->origin", self.peer_addr, &target);

        self.state = SessionState::Closed;
        summary
    }
}

#[cfg(target_os = "linux")]
fn original_dst_port(stream: &TcpStream) -> Result<u16, ProxyError> {
    use nix::sys::socket::{getsockopt, sockopt::OriginalDst};

    let addr = getsockopt(stream, OriginalDst)
        .map_err(|e| ProxyError::PortRecovery(format!("SO_ORIGINAL_DST: {}", e)))?;
    Ok(u16::from_be(addr.sin_port))
}

#[cfg(not(target_os = "linux"))]
fn original_dst_port(_stream: &TcpStream) -> Result<u16, ProxyError> {
    Err(ProxyError::PortRecovery(
        "SO_ORIGINAL_DST is only available on Linux".to_string(),
    ))
}

/// How one relay direction ended.
#[derive(Debug)]
enum ForwardEnd {
    Eof,
    Deadline,
    Error(io::Error),
}

#[derive(Debug)]
struct Forwarded {
    bytes: u64,
    end: ForwardEnd,
}

impl Forwarded {
    fn log(self, direction: &'static str, peer_addr: SocketAddr, target: &str) {
        let deadline = matches!(self.end, ForwardEnd::Deadline);
        match self.end {
            ForwardEnd::Eof | ForwardEnd::Deadline => {
                debug!(
                    direction = direction,
                    peer_addr = %peer_addr,
                    target = %target,
                    bytes = self.bytes,
                    deadline = deadline,
                    "Relay direction finished"
                );
            }
            ForwardEnd::Error(source) => {
                let err = ProxyError::Relay { direction, source };
                warn!(
                    peer_addr = %peer_addr,
                    target = %target,
                    bytes = self.bytes,
                    error = %err,
                    "Relay direction failed"
                );
            }
        }
    }
}

/// Copy `src` into `dst`. Reads are bounded by the source leg's deadline,
/// writes by the destination leg's. End-of-stream is passed on as a write
/// shutdown.
async fn forward<R, W>(
    src: &mut R,
    dst: &mut W,
    src_deadline: Instant,
    dst_deadline: Instant,
) -> Forwarded
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut bytes = 0u64;
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

    let end = loop {
        let n = match timeout_at(src_deadline, src.read(&mut buf)).await {
            Ok(Ok(0)) => break ForwardEnd::Eof,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => break ForwardEnd::Error(e),
            Err(_) => break ForwardEnd::Deadline,
        };

        match timeout_at(dst_deadline, dst.write_all(&buf[..n])).await {
            Ok(Ok(())) => bytes += n as u64,
            Ok(Err(e)) => break ForwardEnd::Error(e),
            Err(_) => break ForwardEnd::Deadline,
        }
    };

    if matches!(end, ForwardEnd::Eof) {
        // Peer may already be gone
        let _ = dst.shutdown().await;
    }

    Forwarded { bytes, end }
}
