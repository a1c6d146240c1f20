//! Host networking glue
//!
//! Helpers for discovering the host's primary address, testing whether an
//! address is locally assigned, raising the file-descriptor limit, and
//! evicting stale conntrack flows. All best-effort; the reconciler treats
//! failures here as log-and-continue.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::process::Command;

use tracing::{debug, warn};

/// Discover the host's primary (default-route) IPv4 address.
///
/// Connects a UDP socket toward a public address and reads back the local
/// address the kernel picked for the route. No packet is ever sent; UDP
/// connect only sets the peer.
///
/// # Errors
///
/// Returns the underlying I/O error if no route is available.
pub fn choose_host_ip() -> io::Result<IpAddr> {
    let probe = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    probe.connect(("8.8.8.8", 53))?;
    Ok(probe.local_addr()?.ip())
}

/// Test whether an address is assigned to a local interface.
///
/// Binding to a specific address succeeds only when the kernel owns it, so
/// a throwaway bind is a current-truth answer without enumerating
/// interfaces. The unspecified address binds trivially and counts as local.
#[must_use]
pub fn is_local_ip(ip: IpAddr) -> bool {
    UdpSocket::bind(SocketAddr::new(ip, 0)).is_ok()
}

/// Per-reconciliation view of which addresses are locally assigned.
///
/// Probe results are memoized for the duration of one pass; the reconciler
/// swaps in a fresh instance at the start of each pass so interface changes
/// are picked up on the next sync.
#[derive(Debug, Default)]
pub struct LocalAddrs {
    probed: HashMap<IpAddr, bool>,
}

impl LocalAddrs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `ip` is assigned to this host
    pub fn has(&mut self, ip: IpAddr) -> bool {
        *self.probed.entry(ip).or_insert_with(|| is_local_ip(ip))
    }
}

/// Raise `RLIMIT_NOFILE` to at least `limit`.
///
/// The proxy holds two sockets per TCP connection and one per UDP client
/// flow, so the distribution default of 1024 runs out quickly. Best effort;
/// the caller logs and continues on failure.
///
/// # Errors
///
/// Returns the `setrlimit` error, typically `EPERM` in unprivileged
/// namespaces.
pub fn raise_nofile_limit(limit: u64) -> io::Result<()> {
    // SAFETY: plain struct-in/struct-out libc calls with a valid pointer.
    unsafe {
        let mut rlim = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) != 0 {
            return Err(io::Error::last_os_error());
        }
        if rlim.rlim_cur >= limit {
            return Ok(());
        }
        rlim.rlim_cur = limit.min(rlim.rlim_max);
        if libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Evict conntrack flow entries destined for a stale UDP virtual IP.
///
/// Without this, an established UDP "connection" keeps pinning traffic to
/// the old backend after the service's IP is reused. Best effort: a missing
/// `conntrack` binary or an empty flow table are both fine.
pub fn clear_udp_conntrack(ip: IpAddr) {
    let ip_str = ip.to_string();
    let output = Command::new("conntrack")
        .args(["-D", "--orig-dst", &ip_str, "-p", "udp"])
        .output();

    match output {
        Ok(out) if out.status.success() => {
            debug!(ip = %ip_str, "Cleared stale UDP conntrack entries");
        }
        Ok(out) => {
            // Exit code 1 with no matching flows is the common, harmless case.
            let stderr = String::from_utf8_lossy(&out.stderr);
            debug!(ip = %ip_str, stderr = %stderr.trim(), "conntrack delete returned non-zero");
        }
        Err(e) => {
            warn!(ip = %ip_str, error = %e, "Failed to run conntrack");
        }
    }
}
