//! Multus Service Controller
//!
//! Maintains one derived Service per Multus secondary-network device:
//! - Watches Services annotated with `k8s.v1.cni.cncf.io/multus-service-enable`
//! - Reads device suffixes from the `k8s.v1.cni.cncf.io/networks` annotation
//!   of the pods each Service selects
//! - Creates, updates and removes `multus-service-<service>-<device>` Services
//!
//! Derived Services are owned by their source, so deleting the source lets the
//! garbage collector remove them.

mod backoff;
mod config;
mod controller;
mod desired;
mod devices;
mod error;
mod key;
mod metrics;
mod probes;
mod queue;
mod reconciler;
mod watcher;

#[cfg(test)]
mod test_utils;

use crate::config::Config;
use crate::controller::Controller;
use crate::error::ControllerError;
use crate::probes::ProbeState;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    // kube's rustls transport needs a process-wide crypto provider
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        return Err(ControllerError::InvalidConfig(
            "failed to install the rustls ring crypto provider".to_string(),
        ));
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Multus Service Controller");

    let config = Config::from_env()?;
    config.log();

    let mut controller = Controller::new(&config).await?;
    controller.register_handlers()?;

    let probe_state = ProbeState::new(controller.readiness(), controller.metrics());
    let probe_server = tokio::spawn(probes::serve(config.probe_addr, probe_state, shutdown_signal()));

    tokio::select! {
        result = controller.wait_for_cache_sync() => result?,
        () = shutdown_signal() => {
            info!("Shutdown requested before caches synced");
            return Ok(());
        }
    }

    controller.run(config.worker_threads, shutdown_signal()).await?;

    match probe_server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Probe server failed: {}", e),
        Err(e) => error!("Probe server task failed: {}", e),
    }

    info!("Multus Service Controller stopped");
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
