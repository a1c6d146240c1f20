//! Configuration types for svc-proxy
//!
//! Configuration is loaded from a JSON file and validated at startup.
//! Only the data-plane knobs live here; service and endpoint state arrives
//! over the event surface at runtime.

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default sync period: a reconciliation happens at least this often even
/// without change events, keeping filter state drift-resistant.
pub const DEFAULT_SYNC_PERIOD_SECS: u64 = 30;

/// Default minimum gap between reconciliations.
pub const DEFAULT_MIN_SYNC_PERIOD_SECS: u64 = 2;

/// Default UDP idle timeout in milliseconds.
pub const DEFAULT_UDP_IDLE_TIMEOUT_MS: u64 = 250;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Address the proxy sockets bind to. The unspecified address means
    /// "all interfaces" and switches the container-side redirect rules
    /// from DNAT to REDIRECT.
    #[serde(default = "default_listen_ip")]
    pub listen_ip: IpAddr,

    /// Local port range proxy listeners are allocated from
    #[serde(default)]
    pub port_range: PortRangeConfig,

    /// Maximum seconds between reconciliations
    #[serde(default = "default_sync_period")]
    pub sync_period_secs: u64,

    /// Minimum seconds between reconciliations
    #[serde(default = "default_min_sync_period")]
    pub min_sync_period_secs: u64,

    /// UDP flow idle timeout in milliseconds
    #[serde(default = "default_udp_idle_timeout")]
    pub udp_idle_timeout_ms: u64,
}

/// A proxy-port range. A zero `size` means "use the built-in default range".
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct PortRangeConfig {
    #[serde(default)]
    pub base: u16,
    #[serde(default)]
    pub size: u16,
}

fn default_listen_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

const fn default_sync_period() -> u64 {
    DEFAULT_SYNC_PERIOD_SECS
}

const fn default_min_sync_period() -> u64 {
    DEFAULT_MIN_SYNC_PERIOD_SECS
}

const fn default_udp_idle_timeout() -> u64 {
    DEFAULT_UDP_IDLE_TIMEOUT_MS
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_ip: default_listen_ip(),
            port_range: PortRangeConfig::default(),
            sync_period_secs: DEFAULT_SYNC_PERIOD_SECS,
            min_sync_period_secs: DEFAULT_MIN_SYNC_PERIOD_SECS,
            udp_idle_timeout_ms: DEFAULT_UDP_IDLE_TIMEOUT_MS,
        }
    }
}

impl ProxyConfig {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a value cannot be proxied with, most notably
    /// a loopback listen address: the redirect rules cannot deliver portal
    /// traffic to localhost.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_ip.is_loopback() {
            return Err(ConfigError::LoopbackListenIp { ip: self.listen_ip });
        }
        if self.sync_period_secs == 0 {
            return Err(ConfigError::ValidationError(
                "sync_period_secs must be greater than zero".into(),
            ));
        }
        if self.min_sync_period_secs > self.sync_period_secs {
            return Err(ConfigError::ValidationError(format!(
                "min_sync_period_secs ({}) must not exceed sync_period_secs ({})",
                self.min_sync_period_secs, self.sync_period_secs
            )));
        }
        if self.port_range.size > 0 && u32::from(self.port_range.base) + u32::from(self.port_range.size) > 65536 {
            return Err(ConfigError::ValidationError(format!(
                "port range {}+{} overflows the port space",
                self.port_range.base, self.port_range.size
            )));
        }
        Ok(())
    }

    /// Maximum interval between reconciliations
    #[must_use]
    pub const fn sync_period(&self) -> Duration {
        Duration::from_secs(self.sync_period_secs)
    }

    /// Minimum interval between reconciliations
    #[must_use]
    pub const fn min_sync_period(&self) -> Duration {
        Duration::from_secs(self.min_sync_period_secs)
    }

    /// UDP flow idle timeout
    #[must_use]
    pub const fn udp_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.udp_idle_timeout_ms)
    }
}

/// Load and validate a configuration file.
///
/// # Errors
///
/// Returns `ConfigError` if the file is missing, unparseable, or invalid.
pub fn load_config(path: impl AsRef<Path>) -> Result<ProxyConfig, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;
    let config: ProxyConfig =
        serde_json::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    config.validate()?;
    Ok(config)
}
