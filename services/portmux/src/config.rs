//! Proxy configuration.
//!
//! Two layers: runtime settings read from the environment, and the Apps
//! document (JSON) describing which ports belong to which service and where
//! that service's backends live.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::proxy::{
    RecoveryMode, DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_RETRIES, DEFAULT_SESSION_TIMEOUT,
};

/// Default port for the shared listening socket.
pub const DEFAULT_PROXY_PORT: u16 = 8080;

/// Proxy runtime configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the Apps document.
    pub apps_path: PathBuf,

    /// Loopback port the shared socket binds to.
    pub proxy_port: u16,

    /// Deadline applied to each leg of a session.
    pub session_timeout: Duration,

    /// Dial attempts per session before giving up.
    pub max_retries: u32,

    /// Bound on a single resolve + connect.
    pub connect_timeout: Duration,

    /// How the original destination port is recovered.
    pub recovery: RecoveryMode,

    /// Optional file the steering registration is written to.
    pub steering_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let apps_path = std::env::var("PORTMUX_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./config.json"));

        let proxy_port: u16 = std::env::var("PORTMUX_PORT")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("PORTMUX_PORT must be a port number.")?
            .unwrap_or(DEFAULT_PROXY_PORT);

        let session_timeout_ms: u64 = std::env::var("PORTMUX_SESSION_TIMEOUT_MS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("PORTMUX_SESSION_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(DEFAULT_SESSION_TIMEOUT.as_millis() as u64);
        let session_timeout = Duration::from_millis(session_timeout_ms.max(1));

        let max_retries: u32 = std::env::var("PORTMUX_MAX_RETRIES")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("PORTMUX_MAX_RETRIES must be an integer.")?
            .unwrap_or(DEFAULT_MAX_RETRIES)
            .max(1);

        let connect_timeout_ms: u64 = std::env::var("PORTMUX_CONNECT_TIMEOUT_MS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("PORTMUX_CONNECT_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT.as_millis() as u64);
        let connect_timeout = Duration::from_millis(connect_timeout_ms.max(1));

        let recovery = match std::env::var("PORTMUX_RECOVERY") {
            Ok(v) => parse_recovery(&v)?,
            Err(_) => RecoveryMode::LocalAddr,
        };

        let steering_file = std::env::var("PORTMUX_STEERING_FILE")
            .ok()
            .map(PathBuf::from);

        let log_level = std::env::var("PORTMUX_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            apps_path,
            proxy_port,
            session_timeout,
            max_retries,
            connect_timeout,
            recovery,
            steering_file,
            log_level,
        })
    }
}

fn parse_recovery(value: &str) -> Result<RecoveryMode> {
    match value.to_lowercase().as_str() {
        "local-addr" | "local" => Ok(RecoveryMode::LocalAddr),
        "original-dst" | "redirect" => Ok(RecoveryMode::OriginalDst),
        other => bail!("PORTMUX_RECOVERY must be 'local-addr' or 'original-dst', got '{other}'."),
    }
}

/// The Apps document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppsConfig {
    #[serde(rename = "Apps", alias = "apps", default)]
    pub apps: Vec<App>,
}

/// A logical service: the ports steered to it and the backends behind it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct App {
    #[serde(rename = "Name", alias = "name")]
    pub name: String,

    #[serde(rename = "Ports", alias = "ports", default)]
    pub ports: Vec<u16>,

    /// Backend addresses as `host:port`, in rotation order.
    #[serde(rename = "Targets", alias = "targets", default)]
    pub targets: Vec<String>,
}

impl App {
    pub fn new(name: impl Into<String>, ports: Vec<u16>, targets: Vec<String>) -> Self {
        Self {
            name: name.into(),
            ports,
            targets,
        }
    }
}

impl AppsConfig {
    /// Read, parse and validate the Apps document at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_slice(&data)
    }

    /// Parse and validate an Apps document.
    pub fn from_slice(data: &[u8]) -> Result<Self, ConfigError> {
        let config: AppsConfig = serde_json::from_slice(data)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that no port is claimed twice and every app is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut claimed: HashMap<u16, &str> = HashMap::new();
        let mut names = HashSet::new();

        for app in &self.apps {
            if app.name.is_empty() {
                return Err(ConfigError::EmptyName(app.ports.clone()));
            }
            if !names.insert(app.name.as_str()) {
                return Err(ConfigError::DuplicateService(app.name.clone()));
            }
            if app.targets.is_empty() {
                return Err(ConfigError::EmptyTargets(app.name.clone()));
            }
            for &port in &app.ports {
                if port == 0 {
                    return Err(ConfigError::InvalidPort(app.name.clone()));
                }
                if let Some(first) = claimed.insert(port, &app.name) {
                    return Err(ConfigError::DuplicatePort {
                        port,
                        first: first.to_string(),
                        second: app.name.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}
