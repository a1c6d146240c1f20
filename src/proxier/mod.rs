//! Service reconciler
//!
//! The authoritative map from service identity to installed state. A
//! reconciliation pass drains the change tracker and, per changed service,
//! merges the new spec (allocate a proxy port, bind a listener, install
//! redirect rules, register with the load balancer, spawn the forwarding
//! loop) and unmerges whatever the old spec had that the new one no longer
//! covers. The public event surface at the bottom of this module feeds the
//! tracker and paces the passes through the bounded-frequency runner.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ProxyConfig;
use crate::error::{Result, ServiceProxyError};
use crate::firewall::{
    self, rules, FilterDriver, RulePosition, Table, NODEPORT_CONTAINER_CHAIN, NODEPORT_HOST_CHAIN,
    NODEPORT_NON_LOCAL_CHAIN, PORTALS_CONTAINER_CHAIN, PORTALS_HOST_CHAIN,
};
use crate::lb::LoadBalancer;
use crate::netutil::{self, LocalAddrs};
use crate::ports::{PortAllocator, PortClaimRegistry, PortRange, RangePortAllocator};
use crate::service::{EndpointSpec, Portal, Protocol, ServicePort, ServicePortName, ServiceSpec};
use crate::socket::{default_factory, ClientCache, ProxySocket, ProxySocketFactory};
use crate::sync::{BoundedFrequencyRunner, ServiceChangeTracker};

/// Burst allowance of the sync runner: the first pair of requests after a
/// quiet period is served without waiting out `min_sync_period`.
const NUM_BURST_SYNCS: u32 = 2;

/// Soft file-descriptor floor requested at startup. Two fds per spliced
/// TCP connection plus one per UDP flow outgrow distribution defaults fast.
const NOFILE_FLOOR: u64 = 64 * 1000;

/// Installed state for one proxied service port.
///
/// Everything here is immutable after construction except the three
/// flags, which are atomics precisely so forwarding loops and tests can
/// observe them without the service-map lock.
pub struct ServiceInfo {
    timeout: Duration,
    active_clients: Arc<ClientCache>,
    portal: Portal,
    protocol: Protocol,
    proxy_port: u16,
    socket: Arc<dyn ProxySocket>,
    node_port: u16,
    external_ips: Vec<IpAddr>,
    load_balancer_ips: Vec<IpAddr>,
    sticky_max_age_seconds: u32,

    /// True from creation until the proxy is stopped; cleared exactly once
    alive: AtomicBool,
    /// Set once the forwarding loop begins accepting
    started: AtomicBool,
    /// Set once teardown has been requested
    finished: AtomicBool,
}

impl ServiceInfo {
    /// Whether the proxy for this service is still supposed to run
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Whether the forwarding loop has begun accepting
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Whether teardown has been requested
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    pub fn mark_finished(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    fn mark_stopped(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// UDP idle timeout for this service
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Active UDP client flows (empty for TCP services)
    #[must_use]
    pub fn active_clients(&self) -> &Arc<ClientCache> {
        &self.active_clients
    }

    /// The cluster-IP portal
    #[must_use]
    pub fn portal(&self) -> Portal {
        self.portal
    }

    #[must_use]
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// The allocator-assigned local port the listener runs on
    #[must_use]
    pub fn proxy_port(&self) -> u16 {
        self.proxy_port
    }

    #[must_use]
    pub fn node_port(&self) -> u16 {
        self.node_port
    }

    #[must_use]
    pub fn external_ips(&self) -> &[IpAddr] {
        &self.external_ips
    }

    #[must_use]
    pub fn load_balancer_ips(&self) -> &[IpAddr] {
        &self.load_balancer_ips
    }

    #[must_use]
    pub fn socket(&self) -> &Arc<dyn ProxySocket> {
        &self.socket
    }
}

/// Idempotence check for merges: an update that keeps protocol, cluster
/// port, node port, cluster IP, and external IPs (in order) is a no-op.
/// Session-affinity drift is deliberately ignored here.
fn same_config(info: &ServiceInfo, service: &ServiceSpec, port: &ServicePort) -> bool {
    info.protocol == port.protocol
        && info.portal.port == port.port
        && info.node_port == port.node_port
        && Some(info.portal.ip) == service.cluster_ip()
        && info.external_ips == service.external_ips
}

type ServiceMap = HashMap<ServicePortName, Arc<ServiceInfo>>;

/// Userspace service proxier.
///
/// Receives service and endpoint events, reconciles them into (listening
/// socket, packet-filter rules, port claims) per service port, and keeps
/// the installed state converged in the background. One instance per host.
pub struct Proxier {
    load_balancer: Arc<dyn LoadBalancer>,
    service_map: Mutex<ServiceMap>,
    sync_period: Duration,
    min_sync_period: Duration,
    udp_idle_timeout: Duration,
    port_claims: PortClaimRegistry,
    listen_ip: IpAddr,
    host_ip: IpAddr,
    firewall: Arc<dyn FilterDriver>,
    local_addrs: Mutex<LocalAddrs>,
    proxy_ports: Arc<dyn PortAllocator>,
    make_socket: ProxySocketFactory,

    services_synced: AtomicBool,
    endpoints_synced: AtomicBool,
    initialized: AtomicBool,

    service_changes: Mutex<ServiceChangeTracker>,
    sync_runner: BoundedFrequencyRunner,
    stop: CancellationToken,
}

impl Proxier {
    /// Create a proxier with the default port allocator and socket factory.
    ///
    /// Discovers the host IP, raises the fd limit (best effort), and sets
    /// up the packet-filter foundations. Stale redirect rules from a
    /// previous run are flushed here; their proxy ports died with that
    /// process.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration (most notably a loopback listen
    /// address) and on initial packet-filter setup errors: fail closed at
    /// construction, log-and-retry during sync.
    pub fn new(
        load_balancer: Arc<dyn LoadBalancer>,
        firewall: Arc<dyn FilterDriver>,
        config: &ProxyConfig,
    ) -> Result<Arc<Self>> {
        config.validate().map_err(ServiceProxyError::Config)?;

        let host_ip = match netutil::choose_host_ip() {
            Ok(ip) => ip,
            Err(e) => {
                warn!(error = %e, "Failed to discover host IP, falling back to listen IP");
                config.listen_ip
            }
        };
        if let Err(e) = netutil::raise_nofile_limit(NOFILE_FLOOR) {
            warn!(error = %e, limit = NOFILE_FLOOR, "Failed to raise open file limit");
        }

        info!(listen_ip = %config.listen_ip, host_ip = %host_ip, "Setting proxy IP and initializing iptables");
        let proxy_ports = Arc::new(RangePortAllocator::new(PortRange::new(
            config.port_range.base,
            config.port_range.size,
        )));

        Self::with_parts(
            load_balancer,
            firewall,
            config.listen_ip,
            host_ip,
            proxy_ports,
            default_factory(),
            config.sync_period(),
            config.min_sync_period(),
            config.udp_idle_timeout(),
        )
    }

    /// Create a proxier from explicit parts. Used by tests to inject the
    /// allocator and socket factory; skips host-level setup and the config
    /// validation that [`Proxier::new`] performs.
    ///
    /// # Errors
    ///
    /// Fails when the initial packet-filter setup fails.
    #[allow(clippy::too_many_arguments)]
    pub fn with_parts(
        load_balancer: Arc<dyn LoadBalancer>,
        firewall: Arc<dyn FilterDriver>,
        listen_ip: IpAddr,
        host_ip: IpAddr,
        proxy_ports: Arc<dyn PortAllocator>,
        make_socket: ProxySocketFactory,
        sync_period: Duration,
        min_sync_period: Duration,
        udp_idle_timeout: Duration,
    ) -> Result<Arc<Self>> {
        firewall::init(firewall.as_ref()).map_err(ServiceProxyError::Firewall)?;
        firewall::flush_chains(firewall.as_ref())?;

        debug!(
            ?min_sync_period,
            ?sync_period,
            burst_syncs = NUM_BURST_SYNCS,
            "Record sync param"
        );

        Ok(Arc::new(Self {
            load_balancer,
            service_map: Mutex::new(HashMap::new()),
            sync_period,
            min_sync_period,
            udp_idle_timeout,
            port_claims: PortClaimRegistry::new(Arc::clone(&make_socket)),
            listen_ip,
            host_ip,
            firewall,
            local_addrs: Mutex::new(LocalAddrs::new()),
            proxy_ports,
            make_socket,
            services_synced: AtomicBool::new(false),
            endpoints_synced: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            service_changes: Mutex::new(ServiceChangeTracker::new()),
            sync_runner: BoundedFrequencyRunner::new(
                "proxy-sync-runner",
                min_sync_period,
                sync_period,
                NUM_BURST_SYNCS,
            ),
            stop: CancellationToken::new(),
        }))
    }

    /// Request a reconciliation as soon as the runner allows.
    pub fn sync(&self) {
        self.sync_runner.run();
    }

    /// Drive reconciliations until [`Proxier::shutdown`] is called.
    pub async fn sync_loop(self: Arc<Self>) {
        let stop = self.stop.clone();
        let this = Arc::clone(&self);
        self.sync_runner
            .process_loop(stop, move || this.sync_proxy_rules())
            .await;
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// One reconciliation pass.
    ///
    /// Suppressed until both the service and endpoint streams have synced,
    /// so a restart never programs the filter from partial data.
    pub fn sync_proxy_rules(&self) {
        let start = Instant::now();

        if !self.is_initialized() {
            info!("Not syncing userspace proxy until services and endpoints have been received");
            return;
        }

        if let Err(e) = firewall::init(self.firewall.as_ref()) {
            error!(error = %e, "Failed to ensure iptables chains");
        }

        let changes = self.service_changes.lock().drain();

        let mut map = self.service_map.lock();
        debug!(count = changes.len(), "Processing service change events");
        for (_, change) in changes {
            let existing_ports = self.merge_service(&mut map, change.current.as_ref());
            self.unmerge_service(&mut map, change.previous.as_ref(), &existing_ports);
        }

        *self.local_addrs.lock() = LocalAddrs::new();

        self.ensure_portals(&map);
        self.cleanup_stale_sticky_sessions(&map);
        debug!(elapsed = ?start.elapsed(), "syncProxyRules complete");
    }

    /// Ensure portals exist for every installed service. Idempotent; heals
    /// external rule drift. Does not remove rules that should be absent.
    fn ensure_portals(&self, map: &ServiceMap) {
        for (name, info) in map {
            if let Err(e) = self.open_portal(name, info) {
                error!(service = %name, error = %e, "Failed to ensure portal");
            }
        }
    }

    fn cleanup_stale_sticky_sessions(&self, map: &ServiceMap) {
        for name in map.keys() {
            self.load_balancer.cleanup_stale_sticky_sessions(name);
        }
    }

    /// Install everything `service` needs; returns the port names the new
    /// spec covers so the caller can unmerge the rest.
    fn merge_service(&self, map: &mut ServiceMap, service: Option<&ServiceSpec>) -> HashSet<String> {
        let mut existing_ports = HashSet::new();
        let Some(service) = service else {
            return existing_ports;
        };
        if service.should_skip() {
            return existing_ports;
        }

        for port in &service.ports {
            let name = ServicePortName::new(
                service.namespace.clone(),
                service.name.clone(),
                port.name.clone(),
            );
            existing_ports.insert(port.name.clone());

            if let Some(installed) = map.get(&name).cloned() {
                if same_config(&installed, service, port) {
                    continue;
                }
                debug!(service = %name, "Something changed for service: stopping it");
                if let Err(e) = self.cleanup_portal_and_proxy(map, &name, &installed) {
                    error!(service = %name, error = %e, "Failed to cleanup portal and proxy");
                }
                installed.mark_finished();
            }

            let proxy_port = match self.proxy_ports.allocate_next() {
                Ok(port) => port,
                Err(e) => {
                    error!(service = %name, error = %e, "Failed to allocate proxy port");
                    continue;
                }
            };
            let Some(cluster_ip) = service.cluster_ip() else {
                self.proxy_ports.release(proxy_port);
                continue;
            };

            info!(
                service = %name,
                cluster_ip = %cluster_ip,
                port = port.port,
                protocol = %port.protocol,
                "Adding new service"
            );

            let socket = match (self.make_socket)(port.protocol, self.listen_ip, proxy_port) {
                Ok(socket) => socket,
                Err(e) => {
                    error!(service = %name, error = %e, "Failed to start proxy");
                    self.proxy_ports.release(proxy_port);
                    continue;
                }
            };

            let sticky_max_age_seconds = match &service.session_affinity {
                Some(affinity) if affinity.timeout_seconds > 0 => affinity.timeout_seconds,
                Some(_) => crate::lb::round_robin::DEFAULT_STICKY_MAX_AGE_SECS,
                None => 0,
            };
            let info = Arc::new(ServiceInfo {
                timeout: self.udp_idle_timeout,
                active_clients: ClientCache::new(),
                portal: Portal {
                    ip: cluster_ip,
                    port: port.port,
                    is_external: false,
                },
                protocol: port.protocol,
                proxy_port: socket.listen_port(),
                socket: Arc::clone(&socket),
                node_port: port.node_port,
                external_ips: service.external_ips.clone(),
                load_balancer_ips: service.load_balancer_ips.clone(),
                sticky_max_age_seconds,
                alive: AtomicBool::new(true),
                started: AtomicBool::new(false),
                finished: AtomicBool::new(false),
            });
            map.insert(name.clone(), Arc::clone(&info));

            if let Err(e) = self.open_portal(&name, &info) {
                // No partial state: retract whatever was installed and skip
                // the service until the next sync.
                error!(service = %name, error = %e, "Failed to open portal");
                if let Err(e) = self.close_portal(&name, &info) {
                    error!(service = %name, error = %e, "Failed to retract partial portal");
                }
                self.stop_proxy(map, &name, &info);
                info.mark_finished();
                continue;
            }

            self.load_balancer.new_service(
                &name,
                service.session_affinity.as_ref(),
                info.sticky_max_age_seconds,
            );

            let loop_name = name.clone();
            let loop_info = Arc::clone(&info);
            let loop_balancer = Arc::clone(&self.load_balancer);
            tokio::spawn(async move {
                socket.proxy_loop(&loop_name, &loop_info, &loop_balancer).await;
            });
            info.mark_started();
        }

        existing_ports
    }

    /// Remove everything the old spec had that `existing_ports` no longer
    /// covers.
    fn unmerge_service(
        &self,
        map: &mut ServiceMap,
        service: Option<&ServiceSpec>,
        existing_ports: &HashSet<String>,
    ) {
        let Some(service) = service else { return };
        if service.should_skip() {
            return;
        }

        let mut stale_udp_ips: HashSet<IpAddr> = HashSet::new();
        for port in &service.ports {
            if existing_ports.contains(&port.name) {
                continue;
            }
            let name = ServicePortName::new(
                service.namespace.clone(),
                service.name.clone(),
                port.name.clone(),
            );

            let Some(info) = map.get(&name).cloned() else {
                error!(service = %name, "Service is being removed but doesn't exist");
                continue;
            };
            info!(service = %name, "Stopping service");

            if info.protocol == Protocol::Udp {
                stale_udp_ips.insert(info.portal.ip);
            }

            if let Err(e) = self.cleanup_portal_and_proxy(map, &name, &info) {
                error!(service = %name, error = %e, "Failed to clean up portal and proxy");
            }
            self.load_balancer.delete_service(&name);
            info.mark_finished();
        }

        // Established UDP "connections" would otherwise pin traffic for a
        // reused virtual IP to the old backend.
        for ip in stale_udp_ips {
            netutil::clear_udp_conntrack(ip);
        }
    }

    fn cleanup_portal_and_proxy(
        &self,
        map: &mut ServiceMap,
        name: &ServicePortName,
        info: &Arc<ServiceInfo>,
    ) -> Result<()> {
        self.close_portal(name, info)?;
        self.stop_proxy(map, name, info);
        Ok(())
    }

    fn stop_proxy(&self, map: &mut ServiceMap, name: &ServicePortName, info: &Arc<ServiceInfo>) {
        map.remove(name);
        info.mark_stopped();
        info.socket.close();
        self.proxy_ports.release(info.proxy_port);
    }

    /// Install the redirect rules (and claims) for every portal of one
    /// service: cluster IP, external IPs, load-balancer ingress IPs, and
    /// the node port.
    fn open_portal(&self, name: &ServicePortName, info: &Arc<ServiceInfo>) -> Result<()> {
        self.open_one_portal(info.portal, info.protocol, info.proxy_port, name)?;
        for external_ip in &info.external_ips {
            self.open_one_portal(
                Portal {
                    ip: *external_ip,
                    port: info.portal.port,
                    is_external: true,
                },
                info.protocol,
                info.proxy_port,
                name,
            )?;
        }
        for ingress_ip in &info.load_balancer_ips {
            self.open_one_portal(
                Portal {
                    ip: *ingress_ip,
                    port: info.portal.port,
                    is_external: true,
                },
                info.protocol,
                info.proxy_port,
                name,
            )?;
        }
        if info.node_port != 0 {
            self.open_node_port(info.node_port, info.protocol, info.proxy_port, name)?;
        }
        Ok(())
    }

    fn open_one_portal(
        &self,
        portal: Portal,
        protocol: Protocol,
        proxy_port: u16,
        name: &ServicePortName,
    ) -> Result<()> {
        if self.local_addrs.lock().has(portal.ip) {
            self.port_claims
                .claim(Some(portal.ip), portal.port, protocol, name)
                .map_err(ServiceProxyError::Port)?;
        }

        // Traffic from containers.
        let args = rules::container_portal_args(
            Some(portal.ip),
            portal.is_external,
            false,
            portal.port,
            protocol,
            self.listen_ip,
            proxy_port,
            name,
        );
        let existed = self
            .firewall
            .ensure_rule(RulePosition::Append, Table::Nat, PORTALS_CONTAINER_CHAIN, &args)
            .map_err(|e| {
                error!(service = %name, chain = %PORTALS_CONTAINER_CHAIN, error = %e, "Failed to install iptables rule for service");
                ServiceProxyError::Firewall(e)
            })?;
        if !existed {
            debug!(service = %name, protocol = %protocol, portal = %portal.ip, port = portal.port, "Opened iptables from-containers portal");
        }

        if portal.is_external {
            let args = rules::container_portal_args(
                Some(portal.ip),
                false,
                true,
                portal.port,
                protocol,
                self.listen_ip,
                proxy_port,
                name,
            );
            self.firewall
                .ensure_rule(RulePosition::Append, Table::Nat, PORTALS_CONTAINER_CHAIN, &args)
                .map_err(|e| {
                    error!(service = %name, chain = %PORTALS_CONTAINER_CHAIN, error = %e, "Failed to install iptables rule that opens service for local traffic");
                    ServiceProxyError::Firewall(e)
                })?;

            let args = rules::host_portal_args(
                Some(portal.ip),
                true,
                portal.port,
                protocol,
                self.listen_ip,
                proxy_port,
                self.host_ip,
                name,
            );
            self.firewall
                .ensure_rule(RulePosition::Append, Table::Nat, PORTALS_HOST_CHAIN, &args)
                .map_err(|e| {
                    error!(service = %name, chain = %PORTALS_HOST_CHAIN, error = %e, "Failed to install iptables rule for dst-local traffic");
                    ServiceProxyError::Firewall(e)
                })?;
            return Ok(());
        }

        // Traffic from the host.
        let args = rules::host_portal_args(
            Some(portal.ip),
            false,
            portal.port,
            protocol,
            self.listen_ip,
            proxy_port,
            self.host_ip,
            name,
        );
        self.firewall
            .ensure_rule(RulePosition::Append, Table::Nat, PORTALS_HOST_CHAIN, &args)
            .map_err(|e| {
                error!(service = %name, chain = %PORTALS_HOST_CHAIN, error = %e, "Failed to install iptables rule for service");
                ServiceProxyError::Firewall(e)
            })?;
        Ok(())
    }

    fn open_node_port(
        &self,
        node_port: u16,
        protocol: Protocol,
        proxy_port: u16,
        name: &ServicePortName,
    ) -> Result<()> {
        // Node ports bind on all local addresses.
        self.port_claims
            .claim(None, node_port, protocol, name)
            .map_err(ServiceProxyError::Port)?;

        let args = rules::container_portal_args(
            None,
            false,
            false,
            node_port,
            protocol,
            self.listen_ip,
            proxy_port,
            name,
        );
        self.firewall
            .ensure_rule(RulePosition::Append, Table::Nat, NODEPORT_CONTAINER_CHAIN, &args)
            .map_err(ServiceProxyError::Firewall)?;

        let args = rules::host_node_port_args(
            node_port,
            protocol,
            self.listen_ip,
            proxy_port,
            self.host_ip,
            name,
        );
        self.firewall
            .ensure_rule(RulePosition::Append, Table::Nat, NODEPORT_HOST_CHAIN, &args)
            .map_err(ServiceProxyError::Firewall)?;

        let args = rules::non_local_node_port_args(proxy_port, protocol, name);
        self.firewall
            .ensure_rule(RulePosition::Append, Table::Filter, NODEPORT_NON_LOCAL_CHAIN, &args)
            .map_err(ServiceProxyError::Firewall)?;

        info!(service = %name, protocol = %protocol, node_port, "Opened iptables public port for service");
        Ok(())
    }

    /// Retract the rules and claims for every portal of one service.
    /// Best effort: every retraction is attempted, errors are aggregated.
    fn close_portal(&self, name: &ServicePortName, info: &Arc<ServiceInfo>) -> Result<()> {
        let mut errors = self.close_one_portal(info.portal, info.protocol, info.proxy_port, name);
        for external_ip in &info.external_ips {
            errors.extend(self.close_one_portal(
                Portal {
                    ip: *external_ip,
                    port: info.portal.port,
                    is_external: true,
                },
                info.protocol,
                info.proxy_port,
                name,
            ));
        }
        for ingress_ip in &info.load_balancer_ips {
            errors.extend(self.close_one_portal(
                Portal {
                    ip: *ingress_ip,
                    port: info.portal.port,
                    is_external: true,
                },
                info.protocol,
                info.proxy_port,
                name,
            ));
        }
        if info.node_port != 0 {
            errors.extend(self.close_node_port(info.node_port, info.protocol, info.proxy_port, name));
        }

        if errors.is_empty() {
            debug!(service = %name, "Closed iptables portals for service");
        } else {
            error!(service = %name, count = errors.len(), "Some errors closing iptables portals for service");
        }
        ServiceProxyError::aggregate(errors)
    }

    fn close_one_portal(
        &self,
        portal: Portal,
        protocol: Protocol,
        proxy_port: u16,
        name: &ServicePortName,
    ) -> Vec<ServiceProxyError> {
        let mut errors = Vec::new();

        if self.local_addrs.lock().has(portal.ip) {
            if let Err(e) = self
                .port_claims
                .release(Some(portal.ip), portal.port, protocol, name)
            {
                errors.push(ServiceProxyError::Port(e));
            }
        }

        let args = rules::container_portal_args(
            Some(portal.ip),
            portal.is_external,
            false,
            portal.port,
            protocol,
            self.listen_ip,
            proxy_port,
            name,
        );
        if let Err(e) = self
            .firewall
            .delete_rule(Table::Nat, PORTALS_CONTAINER_CHAIN, &args)
        {
            if !e.is_not_found() {
                errors.push(ServiceProxyError::Firewall(e));
            }
        }

        if portal.is_external {
            let args = rules::container_portal_args(
                Some(portal.ip),
                false,
                true,
                portal.port,
                protocol,
                self.listen_ip,
                proxy_port,
                name,
            );
            if let Err(e) = self
                .firewall
                .delete_rule(Table::Nat, PORTALS_CONTAINER_CHAIN, &args)
            {
                if !e.is_not_found() {
                    errors.push(ServiceProxyError::Firewall(e));
                }
            }

            let args = rules::host_portal_args(
                Some(portal.ip),
                true,
                portal.port,
                protocol,
                self.listen_ip,
                proxy_port,
                self.host_ip,
                name,
            );
            if let Err(e) = self
                .firewall
                .delete_rule(Table::Nat, PORTALS_HOST_CHAIN, &args)
            {
                if !e.is_not_found() {
                    errors.push(ServiceProxyError::Firewall(e));
                }
            }
            return errors;
        }

        let args = rules::host_portal_args(
            Some(portal.ip),
            false,
            portal.port,
            protocol,
            self.listen_ip,
            proxy_port,
            self.host_ip,
            name,
        );
        if let Err(e) = self
            .firewall
            .delete_rule(Table::Nat, PORTALS_HOST_CHAIN, &args)
        {
            if !e.is_not_found() {
                errors.push(ServiceProxyError::Firewall(e));
            }
        }
        errors
    }

    fn close_node_port(
        &self,
        node_port: u16,
        protocol: Protocol,
        proxy_port: u16,
        name: &ServicePortName,
    ) -> Vec<ServiceProxyError> {
        let mut errors = Vec::new();

        let args = rules::container_portal_args(
            None,
            false,
            false,
            node_port,
            protocol,
            self.listen_ip,
            proxy_port,
            name,
        );
        if let Err(e) = self
            .firewall
            .delete_rule(Table::Nat, NODEPORT_CONTAINER_CHAIN, &args)
        {
            if !e.is_not_found() {
                errors.push(ServiceProxyError::Firewall(e));
            }
        }

        let args = rules::host_node_port_args(
            node_port,
            protocol,
            self.listen_ip,
            proxy_port,
            self.host_ip,
            name,
        );
        if let Err(e) = self
            .firewall
            .delete_rule(Table::Nat, NODEPORT_HOST_CHAIN, &args)
        {
            if !e.is_not_found() {
                errors.push(ServiceProxyError::Firewall(e));
            }
        }

        let args = rules::non_local_node_port_args(proxy_port, protocol, name);
        if let Err(e) = self
            .firewall
            .delete_rule(Table::Filter, NODEPORT_NON_LOCAL_CHAIN, &args)
        {
            if !e.is_not_found() {
                errors.push(ServiceProxyError::Firewall(e));
            }
        }

        if let Err(e) = self.port_claims.release(None, node_port, protocol, name) {
            errors.push(ServiceProxyError::Port(e));
        }
        errors
    }

    /// Stop every service proxy and end the sync loop.
    ///
    /// Installed filter rules are left in place; retracting them is the
    /// job of [`firewall::cleanup_leftovers`].
    pub fn shutdown(&self) {
        info!("Shutting down service proxier");
        {
            let mut map = self.service_map.lock();
            let names: Vec<ServicePortName> = map.keys().cloned().collect();
            for name in names {
                if let Some(info) = map.get(&name).cloned() {
                    self.stop_proxy(&mut map, &name, &info);
                    info.mark_finished();
                }
            }
        }
        self.stop.cancel();
    }

    /// Maximum interval between reconciliations
    #[must_use]
    pub fn sync_period(&self) -> Duration {
        self.sync_period
    }

    /// Minimum interval between reconciliations
    #[must_use]
    pub fn min_sync_period(&self) -> Duration {
        self.min_sync_period
    }

    /// Installed state for one service port (observability/tests)
    #[must_use]
    pub fn service_info(&self, name: &ServicePortName) -> Option<Arc<ServiceInfo>> {
        self.service_map.lock().get(name).cloned()
    }

    /// Number of installed service ports
    #[must_use]
    pub fn service_count(&self) -> usize {
        self.service_map.lock().len()
    }

    // --- public event surface -------------------------------------------

    fn record_service_change(
        &self,
        previous: Option<&ServiceSpec>,
        current: Option<&ServiceSpec>,
        action: &'static str,
    ) {
        if let Some(spec) = current.or(previous) {
            debug!(action, service = %spec.namespaced_name(), "Record service change");
        }
        let has_effect = self.service_changes.lock().update(previous, current);
        if has_effect && self.is_initialized() {
            self.sync_runner.run();
        }
    }

    fn maybe_mark_initialized(&self) {
        if self.services_synced.load(Ordering::SeqCst)
            && self.endpoints_synced.load(Ordering::SeqCst)
        {
            self.initialized.store(true, Ordering::SeqCst);
        }
    }

    /// A new service appeared.
    pub fn on_service_add(&self, service: &ServiceSpec) {
        self.record_service_change(None, Some(service), "OnServiceAdd");
    }

    /// An existing service changed.
    pub fn on_service_update(&self, old_service: &ServiceSpec, service: &ServiceSpec) {
        self.record_service_change(Some(old_service), Some(service), "OnServiceUpdate");
    }

    /// A service disappeared.
    pub fn on_service_delete(&self, service: &ServiceSpec) {
        self.record_service_change(Some(service), None, "OnServiceDelete");
    }

    /// The initial service replay is complete.
    ///
    /// Kicks the first reconciliation from a detached task: the event
    /// source may deliver thousands of services before yielding, and this
    /// callback must not block it.
    pub fn on_service_synced(self: &Arc<Self>) {
        debug!("OnServiceSynced");
        self.services_synced.store(true, Ordering::SeqCst);
        self.maybe_mark_initialized();

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.sync_proxy_rules();
        });
    }

    /// Endpoints appeared; forwarded to the load balancer.
    pub fn on_endpoints_add(&self, endpoints: &EndpointSpec, service: &ServiceSpec) {
        self.load_balancer.on_endpoints_add(endpoints, service);
        self.endpoints_synced.store(true, Ordering::SeqCst);
        self.maybe_mark_initialized();
    }

    /// Endpoints disappeared; forwarded to the load balancer.
    pub fn on_endpoints_delete(&self, endpoints: &EndpointSpec, service: &ServiceSpec) {
        self.load_balancer.on_endpoints_delete(endpoints, service);
        self.endpoints_synced.store(true, Ordering::SeqCst);
        self.maybe_mark_initialized();
    }

    /// The initial endpoint replay is complete. Same detached-kick rule as
    /// [`Proxier::on_service_synced`].
    pub fn on_endpoints_synced(self: &Arc<Self>) {
        debug!("OnEndpointsSynced");
        self.load_balancer.on_endpoints_synced();
        self.endpoints_synced.store(true, Ordering::SeqCst);
        self.maybe_mark_initialized();

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.sync_proxy_rules();
        });
    }
}
