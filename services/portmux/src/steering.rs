//! Hand-off to the kernel steering layer.
//!
//! The steering layer itself lives outside this process. It needs two
//! things from us: the set of ports whose traffic should be redirected, and
//! the descriptor of the one socket that traffic lands on. The descriptor is
//! lent, never transferred; the server keeps owning the socket.

use std::fs;
use std::os::fd::RawFd;
use std::path::PathBuf;

use serde::Serialize;
use tracing::{debug, info};

use crate::error::ProxyError;

/// Everything the steering layer needs to redirect traffic to us.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SteeringRegistration {
    /// Process owning the socket (for `pidfd_getfd`-style lookups).
    pub pid: u32,
    /// Descriptor of the shared listening socket.
    pub socket_fd: RawFd,
    /// Ports to steer.
    pub ports: Vec<u16>,
}

impl SteeringRegistration {
    pub fn new(socket_fd: RawFd, ports: Vec<u16>) -> Self {
        Self {
            pid: std::process::id(),
            socket_fd,
            ports,
        }
    }

    fn validate(&self) -> Result<(), ProxyError> {
        if self.ports.is_empty() {
            return Err(ProxyError::SteeringSetup("no ports to steer".to_string()));
        }
        if self.socket_fd < 0 {
            return Err(ProxyError::SteeringSetup(format!(
                "invalid socket descriptor {}",
                self.socket_fd
            )));
        }
        Ok(())
    }
}

/// Registers the port set and socket with a steering layer.
pub trait Steering: Send + Sync {
    fn register(&self, registration: &SteeringRegistration) -> Result<(), ProxyError>;
}

/// For steering managed entirely out of band: validates and logs the
/// registration an operator has to mirror.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSteering;

impl Steering for LogSteering {
    fn register(&self, registration: &SteeringRegistration) -> Result<(), ProxyError> {
        registration.validate()?;
        info!(
            pid = registration.pid,
            socket_fd = registration.socket_fd,
            ports = ?registration.ports,
            "Steering registration ready"
        );
        Ok(())
    }
}

/// Publishes the registration as JSON for an external loader to pick up.
#[derive(Debug, Clone)]
pub struct FileSteering {
    path: PathBuf,
}

impl FileSteering {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Steering for FileSteering {
    fn register(&self, registration: &SteeringRegistration) -> Result<(), ProxyError> {
        registration.validate()?;

        let setup_err = |what: &str, e: &dyn std::fmt::Display| {
            ProxyError::SteeringSetup(format!("{} {}: {}", what, self.path.display(), e))
        };

        let content = serde_json::to_string_pretty(registration)
            .map_err(|e| setup_err("failed to serialize registration for", &e))?;

        // Write to temp file, then rename so a loader never sees a partial file
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, content).map_err(|e| setup_err("failed to write", &e))?;
        fs::rename(&tmp_path, &self.path).map_err(|e| setup_err("failed to publish", &e))?;

        debug!(
            path = %self.path.display(),
            port_count = registration.ports.len(),
            "Steering registration written"
        );

        Ok(())
    }
}
