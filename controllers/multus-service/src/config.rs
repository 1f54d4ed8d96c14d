//! Controller configuration from environment variables.

use crate::error::ControllerError;
use std::net::SocketAddr;
use tracing::info;

/// Default number of reconcile workers
pub const DEFAULT_WORKER_THREADS: usize = 1;
/// Default listen address of the probe server
pub const DEFAULT_PROBE_ADDR: &str = "0.0.0.0:8080";

/// Runtime configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Namespace to watch; all namespaces when `None`
    pub namespace: Option<String>,
    /// Number of concurrent reconcile workers
    pub worker_threads: usize,
    /// Listen address for `/healthz`, `/readyz` and `/metrics`
    pub probe_addr: SocketAddr,
}

impl Config {
    /// Loads configuration from the process environment.
    ///
    /// - `WATCH_NAMESPACE`: namespace to watch (optional)
    /// - `WORKER_THREADS`: number of workers, at least 1 (default 1)
    /// - `PROBE_ADDR`: probe server address (default `0.0.0.0:8080`)
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let namespace = lookup("WATCH_NAMESPACE").filter(|ns| !ns.trim().is_empty());

        let worker_threads = match lookup("WORKER_THREADS") {
            None => DEFAULT_WORKER_THREADS,
            Some(raw) => {
                let threads: usize = raw.trim().parse().map_err(|_| {
                    ControllerError::InvalidConfig(format!("WORKER_THREADS must be a positive integer, got {raw:?}"))
                })?;
                if threads == 0 {
                    return Err(ControllerError::InvalidConfig(
                        "WORKER_THREADS must be at least 1".to_string(),
                    ));
                }
                threads
            }
        };

        let raw_addr = lookup("PROBE_ADDR").unwrap_or_else(|| DEFAULT_PROBE_ADDR.to_string());
        let probe_addr = raw_addr.trim().parse().map_err(|_| {
            ControllerError::InvalidConfig(format!("PROBE_ADDR must be a socket address, got {raw_addr:?}"))
        })?;

        Ok(Self {
            namespace,
            worker_threads,
            probe_addr,
        })
    }

    pub fn log(&self) {
        info!("Configuration:");
        info!("  Namespace: {}", self.namespace.as_deref().unwrap_or("all namespaces"));
        info!("  Worker threads: {}", self.worker_threads);
        info!("  Probe address: {}", self.probe_addr);
    }
}
