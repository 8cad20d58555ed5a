//! Test harness for proxy integration tests.
//!
//! Provides helpers to spawn loopback backends and proxy servers. Steering
//! is simulated by binding a server directly on a steered port, so the
//! accepted connection's local address carries that port just as it would
//! after a kernel redirect.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use portmux::{
    App, ProxyServer, RoutingTable, ServerConfig, ServerStats, SessionConfig, SharedRoutingTable,
};

/// Grab a free loopback port. The listener is dropped, so the port is only
/// very likely to still be free when reused.
pub async fn reserve_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// An address nothing listens on.
pub async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Poll `cond` until it holds or `limit` passes.
pub async fn wait_for(limit: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

#[allow(dead_code)]
pub struct TcpEchoBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    pub bytes_received: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TcpEchoBackend {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let bytes_received = Arc::new(AtomicU64::new(0));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);
        let bytes_clone = Arc::clone(&bytes_received);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((mut stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                let bytes = Arc::clone(&bytes_clone);
                                tokio::spawn(async move {
                                    let mut buf = vec![0u8; 8192];
                                    loop {
                                        match stream.read(&mut buf).await {
                                            Ok(0) => break,
                                            Ok(n) => {
                                                bytes.fetch_add(n as u64, Ordering::Relaxed);
                                                if stream.write_all(&buf[..n]).await.is_err() {
                                                    break;
                                                }
                                            }
                                            Err(_) => break,
                                        }
                                    }
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            bytes_received,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

impl Drop for TcpEchoBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Backend that answers every connection with a fixed tag, then closes.
#[allow(dead_code)]
pub struct TaggedBackend {
    pub addr: SocketAddr,
    pub tag: String,
    pub connections: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TaggedBackend {
    pub async fn spawn(tag: &str) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);
        let tag_bytes = tag.as_bytes().to_vec();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((mut stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                let response = tag_bytes.clone();
                                tokio::spawn(async move {
                                    let _ = stream.write_all(&response).await;
                                    let _ = stream.shutdown().await;
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            tag: tag.to_string(),
            connections,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

impl Drop for TaggedBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A running proxy server bound on one steered port.
#[allow(dead_code)]
pub struct ProxyHandle {
    pub listen_addr: SocketAddr,
    pub stats: Arc<ServerStats>,
    pub handle: Option<JoinHandle<io::Result<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

#[allow(dead_code)]
impl ProxyHandle {
    /// Serve `port` with routing built from `apps`.
    pub async fn spawn(apps: &[App], port: u16, session_timeout: Duration) -> io::Result<Self> {
        let routing = Arc::new(RoutingTable::from_apps(apps).map_err(io::Error::other)?);
        Self::spawn_shared(routing, port, session_timeout).await
    }

    /// Serve `port` with an existing routing table, so several handles can
    /// stand in for several steered ports of one proxy.
    pub async fn spawn_shared(
        routing: SharedRoutingTable,
        port: u16,
        session_timeout: Duration,
    ) -> io::Result<Self> {
        let config = ServerConfig {
            port,
            session: SessionConfig {
                timeout: session_timeout,
                ..SessionConfig::default()
            },
            connect_timeout: Duration::from_millis(500),
        };

        let server = ProxyServer::bind(config, routing).await?;
        let listen_addr = server.local_addr()?;
        let stats = server.stats();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(server.run(shutdown_rx));

        Ok(Self {
            listen_addr,
            stats,
            handle: Some(handle),
            shutdown_tx,
        })
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn stat(&self, counter: impl Fn(&ServerStats) -> &AtomicU64) -> u64 {
        counter(&self.stats).load(Ordering::Relaxed)
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
