//! Load balancer seam
//!
//! The reconciler registers services here and the forwarding loops ask for
//! a backend per connection or datagram. Implementations must be
//! thread-safe: calls arrive concurrently from every forwarding loop and
//! from the reconciliation pass.

pub mod round_robin;

use std::net::SocketAddr;

use thiserror::Error;

use crate::service::{ClientIpAffinity, EndpointSpec, ServicePortName, ServiceSpec};

pub use round_robin::RoundRobinBalancer;

/// Error types for endpoint selection
#[derive(Debug, Clone, Error)]
pub enum LoadBalancerError {
    /// The service was never registered (or already deleted)
    #[error("Service not registered: {0}")]
    ServiceNotFound(String),

    /// The service exists but currently has no backends
    #[error("No endpoints available for {0}")]
    NoEndpoints(String),
}

/// Backend selection policy, fed by the endpoint event stream.
pub trait LoadBalancer: Send + Sync {
    /// Register a service port, with its affinity configuration if any.
    fn new_service(
        &self,
        service: &ServicePortName,
        affinity: Option<&ClientIpAffinity>,
        sticky_max_age_seconds: u32,
    );

    /// Forget a service port and its affinity bookkeeping.
    fn delete_service(&self, service: &ServicePortName);

    /// Choose a backend `host:port` for a connection from `client`.
    ///
    /// `session_affinity_reset` drops the caller's sticky assignment first;
    /// the forwarding loop sets it after a failed dial so a dead backend is
    /// not re-selected for the same client.
    ///
    /// # Errors
    ///
    /// Returns `LoadBalancerError` when the service is unknown or has no
    /// backends.
    fn next_endpoint(
        &self,
        service: &ServicePortName,
        client: SocketAddr,
        session_affinity_reset: bool,
    ) -> Result<String, LoadBalancerError>;

    /// Endpoint arrival; replaces the backend set for the affected ports.
    fn on_endpoints_add(&self, endpoints: &EndpointSpec, service: &ServiceSpec);

    /// Endpoint removal; empties the backend set for the affected ports.
    fn on_endpoints_delete(&self, endpoints: &EndpointSpec, service: &ServiceSpec);

    /// The initial endpoint replay is complete.
    fn on_endpoints_synced(&self);

    /// Drop affinity entries that have outlived their max age.
    fn cleanup_stale_sticky_sessions(&self, service: &ServicePortName);
}
