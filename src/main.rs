//! svc-proxy: userspace service proxy for a cluster networking data plane
//!
//! This is the main entry point for the proxy daemon.
//!
//! # Usage
//!
//! ```bash
//! # Run with default configuration
//! sudo ./svc-proxy
//!
//! # Run with custom configuration
//! sudo ./svc-proxy -c /path/to/config.json
//!
//! # Retract all packet-filter state and exit
//! sudo ./svc-proxy --cleanup
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use svc_proxy::config::{load_config, ProxyConfig};
use svc_proxy::error::ConfigError;
use svc_proxy::firewall::{self, IptablesCmd};
use svc_proxy::lb::RoundRobinBalancer;
use svc_proxy::proxier::Proxier;

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Retract packet-filter state and exit
    cleanup: bool,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/svc-proxy/config.json");
        let mut cleanup = false;
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "--cleanup" => {
                    cleanup = true;
                }
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("svc-proxy v{}", svc_proxy::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            cleanup,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r#"svc-proxy v{}

Userspace service proxy for a cluster networking data plane.

USAGE:
    svc-proxy [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/svc-proxy/config.json]
    --cleanup               Remove all installed packet-filter chains and rules, then exit
    --check                 Check configuration and exit
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    RUST_LOG                Log filter (trace, debug, info, warn, error)

REQUIREMENTS:
    - Linux with iptables
    - CAP_NET_ADMIN capability (or root)
"#,
        svc_proxy::VERSION
    );
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// A missing config file is fine; the defaults describe a working proxy.
fn load_or_default(path: &PathBuf) -> Result<ProxyConfig> {
    match load_config(path) {
        Ok(config) => {
            info!(path = %path.display(), "Loaded configuration");
            Ok(config)
        }
        Err(ConfigError::FileNotFound { .. }) => {
            info!(path = %path.display(), "No configuration file, using defaults");
            let config = ProxyConfig::default();
            config.validate()?;
            Ok(config)
        }
        Err(e) => Err(e.into()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();

    if args.cleanup {
        let driver = IptablesCmd::new();
        if firewall::cleanup_leftovers(&driver) {
            error!("Encountered errors while cleaning up packet-filter state");
            std::process::exit(1);
        }
        info!("Removed all installed packet-filter chains and rules");
        return Ok(());
    }

    let config = load_or_default(&args.config_path)?;
    if args.check_config {
        println!("Configuration OK");
        return Ok(());
    }

    info!(version = svc_proxy::VERSION, "Starting svc-proxy");
    let load_balancer = Arc::new(RoundRobinBalancer::new());
    let firewall_driver = Arc::new(IptablesCmd::new());
    let proxier = Proxier::new(load_balancer, firewall_driver, &config)?;

    let sync_handle = tokio::spawn(Arc::clone(&proxier).sync_loop());
    info!("Sync loop running; waiting for service and endpoint events");

    signal::ctrl_c().await?;
    warn!("Received interrupt, shutting down");
    proxier.shutdown();
    if let Err(e) = sync_handle.await {
        error!(error = %e, "Sync loop ended abnormally");
    }
    info!("Shutdown complete. Installed rules remain; run --cleanup to retract them");
    Ok(())
}
