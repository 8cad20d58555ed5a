//! Port and service routing.
//!
//! Built once from the Apps document and never mutated afterwards, so
//! lookups need no locking. The only mutable state reachable from here is
//! each balancer's atomic cursor.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, info};

use super::balancer::LoadBalancer;
use crate::config::App;
use crate::error::ConfigError;

/// Immutable routing tables for the proxy.
#[derive(Debug)]
pub struct RoutingTable {
    /// Steered port to service name.
    port_to_service: HashMap<u16, String>,
    /// Service name to its balancer. One balancer per service, shared by all
    /// of that service's ports.
    balancers: HashMap<String, LoadBalancer>,
}

impl RoutingTable {
    /// Build the tables from a list of apps.
    ///
    /// Input is normally validated already; duplicates are still rejected
    /// here rather than silently overwritten.
    pub fn from_apps(apps: &[App]) -> Result<Self, ConfigError> {
        let mut port_to_service = HashMap::new();
        let mut balancers = HashMap::new();

        for app in apps {
            if balancers.contains_key(&app.name) {
                return Err(ConfigError::DuplicateService(app.name.clone()));
            }

            for &port in &app.ports {
                if port == 0 {
                    return Err(ConfigError::InvalidPort(app.name.clone()));
                }
                if let Some(first) = port_to_service.insert(port, app.name.clone()) {
                    return Err(ConfigError::DuplicatePort {
                        port,
                        first,
                        second: app.name.clone(),
                    });
                }
            }

            let balancer = LoadBalancer::new(&app.name, app.targets.clone())?;
            debug!(
                service = %app.name,
                ports = ?app.ports,
                target_count = app.targets.len(),
                "Service registered"
            );
            balancers.insert(app.name.clone(), balancer);
        }

        info!(
            service_count = balancers.len(),
            port_count = port_to_service.len(),
            "Routing table built"
        );

        Ok(Self {
            port_to_service,
            balancers,
        })
    }

    /// Service registered for a recovered port.
    pub fn resolve_service(&self, port: u16) -> Option<&str> {
        self.port_to_service.get(&port).map(String::as_str)
    }

    /// Next backend for a service, advancing its rotation.
    pub fn resolve_backend(&self, service: &str) -> Option<&str> {
        self.balancers.get(service).map(LoadBalancer::next)
    }

    /// Every steered port, sorted.
    pub fn ports(&self) -> Vec<u16> {
        self.port_to_service
            .keys()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Number of services.
    pub fn len(&self) -> usize {
        self.balancers.len()
    }

    /// Check if no services are configured.
    pub fn is_empty(&self) -> bool {
        self.balancers.is_empty()
    }
}

/// Shared routing table reference.
pub type SharedRoutingTable = Arc<RoutingTable>;
