//! Error types for svc-proxy
//!
//! This module defines the error hierarchy for the userspace service proxy.
//! Errors are categorized by subsystem and include recovery hints.

use std::io;
use std::net::IpAddr;

use thiserror::Error;

/// Top-level error type for svc-proxy
#[derive(Debug, Error)]
pub enum ServiceProxyError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Packet-filter programming errors
    #[error("Firewall error: {0}")]
    Firewall(#[from] FirewallError),

    /// Proxy-port allocation and port claim errors
    #[error("Port error: {0}")]
    Port(#[from] PortError),

    /// Proxy socket errors (bind, dial, forwarding)
    #[error("Proxy socket error: {0}")]
    Socket(#[from] ProxySocketError),

    /// Several errors collected from one retraction pass
    #[error("{0}")]
    Multiple(AggregateError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ServiceProxyError {
    /// Check if this error is recoverable (the next sync may succeed)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Firewall(e) => e.is_recoverable(),
            Self::Port(e) => e.is_recoverable(),
            Self::Socket(e) => e.is_recoverable(),
            Self::Multiple(agg) => agg.0.iter().all(ServiceProxyError::is_recoverable),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }

    /// Collapse a list of errors into a single error, if any.
    ///
    /// Returns `Ok(())` for an empty list and the sole error unwrapped for a
    /// single-element list.
    pub fn aggregate(errors: Vec<ServiceProxyError>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.into_iter().next().unwrap()),
            _ => Err(ServiceProxyError::Multiple(AggregateError(errors))),
        }
    }
}

/// A bundle of errors produced by a best-effort pass that keeps going after
/// individual failures (portal retraction, chain cleanup).
#[derive(Debug)]
pub struct AggregateError(pub Vec<ServiceProxyError>);

impl std::fmt::Display for AggregateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} errors: [", self.0.len())?;
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{err}")?;
        }
        write!(f, "]")
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// The proxy cannot listen on a loopback address; the packet-filter
    /// redirect rules are unable to deliver traffic there.
    #[error("Cannot proxy on localhost ({ip})")]
    LoopbackListenIp { ip: IpAddr },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors require user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Packet-filter programming errors
#[derive(Debug, Error)]
pub enum FirewallError {
    /// The filter utility exited non-zero
    #[error("{program} {args} failed: {stderr}")]
    CommandFailed {
        program: String,
        args: String,
        stderr: String,
    },

    /// The filter utility could not be spawned at all
    #[error("Failed to run {program}: {reason}")]
    Spawn { program: String, reason: String },

    /// The referenced rule or chain does not exist
    #[error("No such rule or chain: {0}")]
    NotFound(String),
}

impl FirewallError {
    /// Recognizer for the not-found class, tolerated during cleanup
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this error is recoverable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::CommandFailed { .. } | Self::NotFound(_) => true,
            Self::Spawn { .. } => false,
        }
    }

    /// Create a command failure from an invocation and its stderr
    pub fn command_failed(
        program: impl Into<String>,
        args: &[String],
        stderr: impl Into<String>,
    ) -> Self {
        Self::CommandFailed {
            program: program.into(),
            args: args.join(" "),
            stderr: stderr.into(),
        }
    }
}

/// Proxy-port allocation and port claim errors
#[derive(Debug, Error)]
pub enum PortError {
    /// The configured proxy-port range has no free ports left
    #[error("No available ports in range {base} (size {size})")]
    Exhausted { base: u16, size: u16 },

    /// A claim exists for the same (ip, port, protocol) under another service
    #[error("Port conflict detected on port {key}: {owner} vs {holder}")]
    Conflict {
        key: String,
        owner: String,
        holder: String,
    },

    /// A release named an owner that does not hold the claim
    #[error("Port conflict detected on port {key} (unowned unlock): {owner} vs {holder}")]
    WrongOwner {
        key: String,
        owner: String,
        holder: String,
    },

    /// The placeholder socket for a claim could not be opened
    #[error("Can't open port {key}: {reason}")]
    ClaimSocket { key: String, reason: String },
}

impl PortError {
    /// Check if this error is recoverable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::Exhausted { .. } | Self::ClaimSocket { .. } => true,
            Self::Conflict { .. } | Self::WrongOwner { .. } => false,
        }
    }
}

/// Proxy socket errors
#[derive(Debug, Error)]
pub enum ProxySocketError {
    /// Failed to bind the listening socket
    #[error("Failed to bind to {addr}: {reason}")]
    Bind { addr: String, reason: String },

    /// No backend endpoint could be selected for a connection
    #[error("Couldn't find an endpoint for {service}: {reason}")]
    NoEndpoint { service: String, reason: String },

    /// All dial attempts against the selected backends failed
    #[error("Failed to connect to an endpoint for {service}: {reason}")]
    Dial { service: String, reason: String },

    /// I/O error
    #[error("Proxy socket I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl ProxySocketError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Bind { .. } => false,
            Self::NoEndpoint { .. } | Self::Dial { .. } => true,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }

    /// Create a bind error
    pub fn bind(addr: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Bind {
            addr: addr.into(),
            reason: reason.into(),
        }
    }
}

/// Recognizer for file-descriptor exhaustion on accept/dial.
///
/// Matched by substring because the kind surfaces as `Uncategorized` on
/// stable and the message is the only portable signal.
#[must_use]
pub fn is_too_many_fds_error(err: &io::Error) -> bool {
    err.to_string().contains("too many open files")
}

/// Recognizer for reads/accepts against a socket that was closed underneath
/// the forwarding loop. Expected during shutdown.
#[must_use]
pub fn is_closed_error(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotConnected
        || err.to_string().ends_with("use of closed network connection")
}

/// Type alias for Result with `ServiceProxyError`
pub type Result<T> = std::result::Result<T, ServiceProxyError>;
