//! Round-robin load balancer with optional client-IP affinity
//!
//! Backends rotate per service port. When a service asks for client-IP
//! affinity, a client that connected recently is handed the same backend
//! again until its sticky entry ages out or the backend disappears.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, info};

use super::{LoadBalancer, LoadBalancerError};
use crate::service::{ClientIpAffinity, EndpointSpec, ServicePortName, ServiceSpec};

/// Sticky max age applied when affinity is requested without a timeout
pub const DEFAULT_STICKY_MAX_AGE_SECS: u32 = 180 * 60;

#[derive(Debug, Clone)]
struct AffinityState {
    endpoint: String,
    last_used: Instant,
}

#[derive(Debug)]
struct AffinityPolicy {
    max_age: Duration,
    clients: HashMap<std::net::IpAddr, AffinityState>,
}

#[derive(Debug, Default)]
struct BalancerState {
    endpoints: Vec<String>,
    index: usize,
    affinity: Option<AffinityPolicy>,
}

impl BalancerState {
    fn remove_stale_affinity(&mut self) {
        if let Some(policy) = &mut self.affinity {
            let max_age = policy.max_age;
            policy
                .clients
                .retain(|_, state| state.last_used.elapsed() <= max_age);
        }
    }

    /// Drop sticky entries pointing at backends that no longer exist.
    fn reconcile_affinity(&mut self) {
        if let Some(policy) = &mut self.affinity {
            let endpoints = &self.endpoints;
            policy
                .clients
                .retain(|_, state| endpoints.contains(&state.endpoint));
        }
    }
}

/// Round-robin [`LoadBalancer`]
#[derive(Default)]
pub struct RoundRobinBalancer {
    services: RwLock<HashMap<ServicePortName, BalancerState>>,
}

impl RoundRobinBalancer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Backends currently known for `service` (test hook)
    #[must_use]
    pub fn endpoints(&self, service: &ServicePortName) -> Vec<String> {
        self.services
            .read()
            .get(service)
            .map(|s| s.endpoints.clone())
            .unwrap_or_default()
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn new_service(
        &self,
        service: &ServicePortName,
        affinity: Option<&ClientIpAffinity>,
        sticky_max_age_seconds: u32,
    ) {
        debug!(service = %service, "Registering service with round-robin balancer");
        let mut services = self.services.write();
        let state = services.entry(service.clone()).or_default();
        match affinity {
            Some(_) => {
                let max_age_secs = if sticky_max_age_seconds == 0 {
                    DEFAULT_STICKY_MAX_AGE_SECS
                } else {
                    sticky_max_age_seconds
                };
                let max_age = Duration::from_secs(u64::from(max_age_secs));
                match &mut state.affinity {
                    Some(policy) => policy.max_age = max_age,
                    None => {
                        state.affinity = Some(AffinityPolicy {
                            max_age,
                            clients: HashMap::new(),
                        });
                    }
                }
            }
            None => state.affinity = None,
        }
    }

    fn delete_service(&self, service: &ServicePortName) {
        debug!(service = %service, "Removing service from round-robin balancer");
        self.services.write().remove(service);
    }

    fn next_endpoint(
        &self,
        service: &ServicePortName,
        client: SocketAddr,
        session_affinity_reset: bool,
    ) -> Result<String, LoadBalancerError> {
        let mut services = self.services.write();
        let state = services
            .get_mut(service)
            .ok_or_else(|| LoadBalancerError::ServiceNotFound(service.to_string()))?;
        if state.endpoints.is_empty() {
            return Err(LoadBalancerError::NoEndpoints(service.to_string()));
        }

        if let Some(policy) = &mut state.affinity {
            if session_affinity_reset {
                policy.clients.remove(&client.ip());
            } else if let Some(entry) = policy.clients.get_mut(&client.ip()) {
                if entry.last_used.elapsed() <= policy.max_age
                    && state.endpoints.contains(&entry.endpoint)
                {
                    entry.last_used = Instant::now();
                    return Ok(entry.endpoint.clone());
                }
                policy.clients.remove(&client.ip());
            }
        }

        let endpoint = state.endpoints[state.index % state.endpoints.len()].clone();
        state.index = (state.index + 1) % state.endpoints.len();

        if let Some(policy) = &mut state.affinity {
            policy.clients.insert(
                client.ip(),
                AffinityState {
                    endpoint: endpoint.clone(),
                    last_used: Instant::now(),
                },
            );
        }
        Ok(endpoint)
    }

    fn on_endpoints_add(&self, endpoints: &EndpointSpec, _service: &ServiceSpec) {
        let mut services = self.services.write();
        for port in &endpoints.ports {
            let name = ServicePortName::new(
                endpoints.namespace.clone(),
                endpoints.name.clone(),
                port.name.clone(),
            );
            let targets: Vec<String> = port.targets.iter().map(ToString::to_string).collect();
            info!(service = %name, endpoints = ?targets, "Setting endpoints");
            let state = services.entry(name).or_default();
            state.endpoints = targets;
            state.index = 0;
            state.reconcile_affinity();
        }
    }

    fn on_endpoints_delete(&self, endpoints: &EndpointSpec, _service: &ServiceSpec) {
        let mut services = self.services.write();
        for port in &endpoints.ports {
            let name = ServicePortName::new(
                endpoints.namespace.clone(),
                endpoints.name.clone(),
                port.name.clone(),
            );
            if let Some(state) = services.get_mut(&name) {
                info!(service = %name, "Clearing endpoints");
                state.endpoints.clear();
                state.index = 0;
                state.reconcile_affinity();
            }
        }
    }

    fn on_endpoints_synced(&self) {}

    fn cleanup_stale_sticky_sessions(&self, service: &ServicePortName) {
        if let Some(state) = self.services.write().get_mut(service) {
            state.remove_stale_affinity();
        }
    }
}
