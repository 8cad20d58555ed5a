pub mod config;
pub mod error;
pub mod proxy;
pub mod steering;

pub use config::{App, AppsConfig, Config};
pub use error::{ConfigError, ProxyError};
pub use proxy::{
    ConnectionSession, Dialer, LoadBalancer, ProxyServer, RecoveryMode, RelaySummary,
    RoutingTable, ServerConfig, ServerStats, SessionConfig, SessionState, SharedRoutingTable,
    TcpDialer,
};
pub use steering::{FileSteering, LogSteering, Steering, SteeringRegistration};
