//! Per-portal rule argument builders
//!
//! Every builder emits the full argument list exactly as `iptables-save`
//! would print it back, because some iptables generations lack `-C` and
//! rules are then matched by parsing save output. Argument order, the
//! `/32` destination masks, and the service comment are all part of that
//! contract; none of them may be normalized away.

use std::net::IpAddr;

use crate::service::{Protocol, ServicePortName};

/// Render an address as the host-mask CIDR `iptables-save` prints.
#[must_use]
pub fn to_cidr(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => format!("{v4}/32"),
        IpAddr::V6(v6) => format!("{v6}/128"),
    }
}

/// Arguments common to container-side and host-side portal rules.
fn common_portal_args(
    dest_ip: Option<IpAddr>,
    physdev_match: bool,
    dst_local_match: bool,
    dest_port: u16,
    protocol: Protocol,
    service: &ServicePortName,
) -> Vec<String> {
    let mut args = vec![
        "-m".into(),
        "comment".into(),
        "--comment".into(),
        service.to_string(),
        "-p".into(),
        protocol.as_str().into(),
        "-m".into(),
        protocol.as_str().into(),
        "--dport".into(),
        dest_port.to_string(),
    ];

    if let Some(ip) = dest_ip {
        args.push("-d".into());
        args.push(to_cidr(ip));
    }

    // Keeps a container-facing rule for an external IP from matching
    // traffic that entered through the physical interface.
    if physdev_match {
        args.extend(["-m", "physdev", "!", "--physdev-is-in"].map(String::from));
    }

    if dst_local_match {
        args.extend(["-m", "addrtype", "--dst-type", "LOCAL"].map(String::from));
    }

    args
}

/// Arguments for a from-container portal rule.
///
/// An unspecified listen address calls for REDIRECT: the kernel rewrites
/// the destination to the primary address of the incoming interface, so
/// replies naturally traverse the same interface and the NAT state holds.
/// DNAT to a bridge or loopback address empirically does not. With a
/// specific listen address, DNAT to it is the only correct target.
#[must_use]
pub fn container_portal_args(
    dest_ip: Option<IpAddr>,
    physdev_match: bool,
    dst_local_match: bool,
    dest_port: u16,
    protocol: Protocol,
    proxy_ip: IpAddr,
    proxy_port: u16,
    service: &ServicePortName,
) -> Vec<String> {
    let mut args = common_portal_args(
        dest_ip,
        physdev_match,
        dst_local_match,
        dest_port,
        protocol,
        service,
    );
    if proxy_ip.is_unspecified() {
        args.extend(["-j".into(), "REDIRECT".into(), "--to-ports".into(), proxy_port.to_string()]);
    } else {
        args.extend([
            "-j".into(),
            "DNAT".into(),
            "--to-destination".into(),
            join_host_port(proxy_ip, proxy_port),
        ]);
    }
    args
}

/// Arguments for a from-host portal rule.
///
/// REDIRECT on locally generated packets sends them to localhost but the
/// replies leave with the primary interface address, which breaks the NAT
/// match. Host-side rules therefore always DNAT; when the proxy listens on
/// the unspecified address the discovered host IP stands in.
#[must_use]
pub fn host_portal_args(
    dest_ip: Option<IpAddr>,
    dst_local_match: bool,
    dest_port: u16,
    protocol: Protocol,
    proxy_ip: IpAddr,
    proxy_port: u16,
    host_ip: IpAddr,
    service: &ServicePortName,
) -> Vec<String> {
    let mut args = common_portal_args(dest_ip, false, dst_local_match, dest_port, protocol, service);
    let target_ip = if proxy_ip.is_unspecified() {
        host_ip
    } else {
        proxy_ip
    };
    args.extend([
        "-j".into(),
        "DNAT".into(),
        "--to-destination".into(),
        join_host_port(target_ip, proxy_port),
    ]);
    args
}

/// Arguments for a from-host node-port rule (no destination IP; the
/// addrtype match on the jump into the chain already narrowed to LOCAL).
#[must_use]
pub fn host_node_port_args(
    node_port: u16,
    protocol: Protocol,
    proxy_ip: IpAddr,
    proxy_port: u16,
    host_ip: IpAddr,
    service: &ServicePortName,
) -> Vec<String> {
    host_portal_args(
        None,
        false,
        node_port,
        protocol,
        proxy_ip,
        proxy_port,
        host_ip,
        service,
    )
}

/// Arguments for the filter-table rule that lets redirected non-local
/// node-port traffic through default-deny INPUT policies. Matches on the
/// proxy port, because by the time the packet reaches filter/INPUT the NAT
/// rewrite has already happened.
#[must_use]
pub fn non_local_node_port_args(
    proxy_port: u16,
    protocol: Protocol,
    service: &ServicePortName,
) -> Vec<String> {
    let mut args = common_portal_args(None, false, false, proxy_port, protocol, service);
    args.extend(["-m", "state", "--state", "NEW", "-j", "ACCEPT"].map(String::from));
    args
}

fn join_host_port(ip: IpAddr, port: u16) -> String {
    match ip {
        IpAddr::V4(v4) => format!("{v4}:{port}"),
        IpAddr::V6(v6) => format!("[{v6}]:{port}"),
    }
}
