//! Seed-proxy controller wiring.
//!
//! Watches every kind the controller writes in the master, admits only events
//! of objects carrying its management marker and fans each of them out to one
//! reconcile request per seed.

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::reconciler::{KubeconfigConnector, MasterCaches, SeedProxyReconciler};
use crate::resources::{management_marker, CONTROLLER_NAME};
use control_loop::{Controller, ControllerMetrics, EventFilter, FanOutRouter, ManagedByFilter};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use kube::{Api, Client};
use prometheus::Registry;
use reconciling::{KubeWriter, ManagedObject};
use seed_provider::{SeedKubeconfigGetter, SeedTargets, SeedsGetter};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Reconciler run against a live master and live seeds
pub type SeedProxy = SeedProxyReconciler<KubeconfigConnector, MasterCaches, KubeWriter>;

/// The seed-proxy controller: watches, work queue and reconciler.
#[derive(Debug)]
pub struct SeedProxyController {
    controller: Controller,
    reconciler: Arc<SeedProxy>,
}

/// Creates the seed-proxy controller and starts its watches.
///
/// Deployments, Services, Secrets and ConfigMaps are watched in all
/// namespaces of the master. The watches feed the caches the reconciler
/// reads master objects from.
pub fn add(
    client: Client,
    config: &ControllerConfig,
    seeds: Arc<dyn SeedsGetter>,
    kubeconfigs: Arc<dyn SeedKubeconfigGetter>,
    registry: &Registry,
) -> Result<SeedProxyController, ControllerError> {
    let marker = management_marker();
    let metrics = ControllerMetrics::new(registry, CONTROLLER_NAME)?;
    let mut controller = Controller::new(CONTROLLER_NAME, config.controller_options(), metrics)?;

    let filter = ManagedByFilter::new(marker.clone());
    let router = FanOutRouter::new(Arc::new(SeedTargets::new(Arc::clone(&seeds))));

    let caches = MasterCaches {
        deployments: watch_all::<Deployment>(&mut controller, &client, &filter, &router),
        services: watch_all::<Service>(&mut controller, &client, &filter, &router),
        secrets: watch_all::<Secret>(&mut controller, &client, &filter, &router),
        config_maps: watch_all::<ConfigMap>(&mut controller, &client, &filter, &router),
    };

    let reconciler = SeedProxyReconciler::new(
        seeds,
        KubeconfigConnector::new(kubeconfigs),
        caches,
        KubeWriter::new(client, CONTROLLER_NAME),
        config.proxy_image.clone(),
        marker,
    );

    Ok(SeedProxyController {
        controller,
        reconciler: Arc::new(reconciler),
    })
}

fn watch_all<K: ManagedObject>(
    controller: &mut Controller,
    client: &Client,
    filter: &ManagedByFilter,
    router: &FanOutRouter,
) -> kube_runtime::reflector::Store<K> {
    let filter: Arc<dyn EventFilter<K>> = Arc::new(filter.clone());
    controller.watch(Api::all(client.clone()), filter, router.clone())
}

impl SeedProxyController {
    /// Flag the readiness probe reports
    pub fn readiness(&self) -> Arc<AtomicBool> {
        self.controller.readiness()
    }

    /// Waits until the master caches have completed their initial list.
    pub async fn wait_for_cache_sync(&mut self) -> Result<(), ControllerError> {
        self.controller.wait_for_cache_sync().await?;
        Ok(())
    }

    /// Reconciles seeds until `shutdown` turns true.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        info!("Starting {}", CONTROLLER_NAME);
        self.controller.run(self.reconciler, shutdown).await;
    }
}
