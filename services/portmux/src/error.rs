//! Error types for the proxy.
//!
//! Only configuration and steering errors stop the process. Everything at
//! or below session level is logged and confined to its connection.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Problems with the Apps document or the routing tables built from it.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Could not read the config file.
    #[error("config_read_failed: {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Could not parse the config JSON.
    #[error("config_parse_failed: {0}")]
    Parse(#[from] serde_json::Error),

    /// A port is claimed more than once.
    #[error("duplicate port {port}: claimed by '{first}' and '{second}'")]
    DuplicatePort {
        port: u16,
        first: String,
        second: String,
    },

    /// Two apps share a name.
    #[error("duplicate service name '{0}'")]
    DuplicateService(String),

    /// A service has no targets to balance across.
    #[error("service '{0}' has no targets")]
    EmptyTargets(String),

    /// A service has no name.
    #[error("service with ports {0:?} has an empty name")]
    EmptyName(Vec<u16>),

    /// Port 0 cannot be steered.
    #[error("service '{0}' claims port 0")]
    InvalidPort(String),
}

/// Proxy errors with standardized reason codes.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Invalid configuration, fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// Could not hand the port set or socket to the steering layer.
    #[error("steering setup failed: {0}")]
    SteeringSetup(String),

    /// The original destination port could not be read back.
    #[error("port recovery failed: {0}")]
    PortRecovery(String),

    /// No service claims the recovered port.
    #[error("no service registered for port {port}")]
    RoutingMiss { port: u16 },

    /// Resolution or connect failure for a single target.
    #[error("dial {target} failed: {source}")]
    Dial {
        target: String,
        #[source]
        source: io::Error,
    },

    /// Every dial attempt in the retry budget failed.
    #[error("no backend reachable for '{service}' after {attempts} attempts")]
    RetriesExhausted { service: String, attempts: u32 },

    /// I/O failure on an established leg, excluding deadline expiry.
    #[error("relay {direction} failed: {source}")]
    Relay {
        direction: &'static str,
        #[source]
        source: io::Error,
    },
}

impl ProxyError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ProxyError::Configuration(_) => "configuration_error",
            ProxyError::SteeringSetup(_) => "steering_setup_failed",
            ProxyError::PortRecovery(_) => "port_recovery_failed",
            ProxyError::RoutingMiss { .. } => "routing_miss",
            ProxyError::Dial { .. } => "dial_failed",
            ProxyError::RetriesExhausted { .. } => "retries_exhausted",
            ProxyError::Relay { .. } => "relay_failed",
        }
    }

    /// Whether this error should stop the process.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProxyError::Configuration(_) | ProxyError::SteeringSetup(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_startup_errors_are_fatal() {
        let dup: ProxyError = ConfigError::DuplicatePort {
            port: 8001,
            first: "web".to_string(),
            second: "api".to_string(),
        }
        .into();
        assert!(dup.is_fatal());
        assert_eq!(dup.reason_code(), "configuration_error");

        assert!(ProxyError::SteeringSetup("no map".to_string()).is_fatal());
        assert!(!ProxyError::RoutingMiss { port: 1 }.is_fatal());
        assert!(!ProxyError::RetriesExhausted {
            service: "web".to_string(),
            attempts: 5
        }
        .is_fatal());
    }

    #[test]
    fn test_duplicate_port_message() {
        let err = ConfigError::DuplicatePort {
            port: 8001,
            first: "web".to_string(),
            second: "api".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "duplicate port 8001: claimed by 'web' and 'api'"
        );
    }
}
