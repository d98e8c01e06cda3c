//! Seed Proxy Controller
//!
//! Gives the master cluster access to the monitoring stack of every seed:
//! - Creates a service account with proxy access to Prometheus and
//!   Alertmanager in each seed
//! - Runs a `kubectl proxy` deployment and service per seed in the master
//! - Registers the proxied Prometheus of each seed as a Grafana datasource
//!
//! Objects it owns carry `app.kubernetes.io/managed-by=seed-proxy-controller`;
//! any change to them re-reconciles every seed.

mod config;
mod controller;
mod error;
mod probes;
mod reconciler;
mod resources;
#[cfg(test)]
mod test_utils;

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use kube::Client;
use prometheus::Registry;
use seed_provider::{FileSeedsGetter, SecretKubeconfigGetter, SeedsGetter};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    info!("Starting Seed Proxy Controller");

    let config = ControllerConfig::from_env()?;
    info!("Configuration:");
    info!("  Workers: {}", config.worker_count);
    info!("  Seeds file: {}", config.seeds_file.display());
    info!("  Proxy image: {}", config.proxy_image);
    info!("  Metrics address: {}", config.metrics_bind_address);

    let client = Client::try_default().await?;
    let seeds: Arc<dyn SeedsGetter> = Arc::new(FileSeedsGetter::new(&config.seeds_file));
    let kubeconfigs = Arc::new(SecretKubeconfigGetter::new(client.clone()));
    let registry = Registry::new();

    let mut controller = controller::add(client, &config, seeds, kubeconfigs, &registry)?;

    let (stop, shutdown) = watch::channel(false);
    let app = probes::router(registry, controller.readiness());
    let probes = tokio::spawn({
        let shutdown = shutdown.clone();
        let addr = config.metrics_bind_address;
        async move {
            if let Err(e) = probes::serve(addr, app, shutdown).await {
                error!("Probes server failed: {}", e);
            }
        }
    });
    tokio::spawn(async move {
        shutdown_signal().await;
        stop.send_replace(true);
    });

    controller.wait_for_cache_sync().await?;
    controller.run(shutdown).await;

    if let Err(e) = probes.await {
        error!("Probes server task failed: {}", e);
    }
    info!("Seed Proxy Controller stopped");
    Ok(())
}

/// Resolves on SIGTERM or Ctrl-C. Never resolves if no handler can be installed.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C"),
                }
                return;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl-C"),
        Err(e) => {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
