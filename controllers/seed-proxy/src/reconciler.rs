//! Seed-proxy reconciliation.
//!
//! Each reconcile request names one seed. The reconciler sets up a service
//! account with proxy access to the seed's monitoring stack, then runs a
//! `kubectl proxy` deployment for that seed in the master and registers
//! the proxied Prometheus of every seed as a Grafana datasource.

use crate::error::ControllerError;
use crate::resources::{
    common_labels, grafana_config_map, grafana_datasources, master_deployment, master_secret,
    master_service, proxy_kubeconfig, seed_labels, seed_monitoring_role,
    seed_monitoring_role_binding, seed_service_account, seed_token_secret, CONTROLLER_NAME,
    MASTER_GRAFANA_NAMESPACE, MASTER_TARGET_NAMESPACE, SEED_MONITORING_NAMESPACE,
    SEED_SERVICE_ACCOUNT_NAMESPACE, SEED_TOKEN_SECRET_NAME,
};
use async_trait::async_trait;
use control_loop::{ReconcileRequest, Reconciler};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube_runtime::reflector::Store;
use reconciling::{
    add_labels, add_management_marker, reconcile_objects, ApiReader, CacheError, KubeWriter,
    ManagementMarker, ObjectCache, ObjectWriter, ReconcileError,
};
use seed_provider::{ProviderError, Seed, SeedKubeconfigGetter, SeedsGetter};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Read access to every kind the controller manages in a seed.
pub trait SeedCache:
    ObjectCache<ServiceAccount> + ObjectCache<Secret> + ObjectCache<Role> + ObjectCache<RoleBinding>
{
}

impl<T> SeedCache for T where
    T: ObjectCache<ServiceAccount>
        + ObjectCache<Secret>
        + ObjectCache<Role>
        + ObjectCache<RoleBinding>
{
}

/// Write access to every kind the controller manages in a seed.
pub trait SeedWriter:
    ObjectWriter<ServiceAccount>
    + ObjectWriter<Secret>
    + ObjectWriter<Role>
    + ObjectWriter<RoleBinding>
{
}

impl<T> SeedWriter for T where
    T: ObjectWriter<ServiceAccount>
        + ObjectWriter<Secret>
        + ObjectWriter<Role>
        + ObjectWriter<RoleBinding>
{
}

/// Read access to every kind the controller manages in the master.
pub trait MasterCache:
    ObjectCache<Secret> + ObjectCache<Deployment> + ObjectCache<Service> + ObjectCache<ConfigMap>
{
}

impl<T> MasterCache for T where
    T: ObjectCache<Secret>
        + ObjectCache<Deployment>
        + ObjectCache<Service>
        + ObjectCache<ConfigMap>
{
}

/// Write access to every kind the controller manages in the master.
pub trait MasterWriter:
    ObjectWriter<Secret> + ObjectWriter<Deployment> + ObjectWriter<Service> + ObjectWriter<ConfigMap>
{
}

impl<T> MasterWriter for T where
    T: ObjectWriter<Secret>
        + ObjectWriter<Deployment>
        + ObjectWriter<Service>
        + ObjectWriter<ConfigMap>
{
}

/// Master objects served from the controller's watch caches.
#[derive(Clone)]
pub struct MasterCaches {
    /// Secrets of all namespaces
    pub secrets: Store<Secret>,
    /// Deployments of all namespaces
    pub deployments: Store<Deployment>,
    /// Services of all namespaces
    pub services: Store<Service>,
    /// ConfigMaps of all namespaces
    pub config_maps: Store<ConfigMap>,
}

impl std::fmt::Debug for MasterCaches {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterCaches")
            .field("secrets", &self.secrets.state().len())
            .field("deployments", &self.deployments.state().len())
            .field("services", &self.services.state().len())
            .field("config_maps", &self.config_maps.state().len())
            .finish()
    }
}

#[async_trait]
impl ObjectCache<Secret> for MasterCaches {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>, CacheError> {
        ObjectCache::get(&self.secrets, namespace, name).await
    }
}

#[async_trait]
impl ObjectCache<Deployment> for MasterCaches {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Deployment>, CacheError> {
        ObjectCache::get(&self.deployments, namespace, name).await
    }
}

#[async_trait]
impl ObjectCache<Service> for MasterCaches {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Service>, CacheError> {
        ObjectCache::get(&self.services, namespace, name).await
    }
}

#[async_trait]
impl ObjectCache<ConfigMap> for MasterCaches {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>, CacheError> {
        ObjectCache::get(&self.config_maps, namespace, name).await
    }
}

/// Read and write access to one seed cluster.
#[derive(Debug, Clone)]
pub struct SeedCluster<C, W> {
    /// Reads current seed objects
    pub cache: C,
    /// Writes seed objects
    pub writer: W,
    /// API server URL of the seed as reachable from the master
    pub url: String,
}

/// Opens [`SeedCluster`]s.
#[async_trait]
pub trait SeedConnector: Send + Sync + 'static {
    /// Cache type of the opened clusters
    type Cache: SeedCache;
    /// Writer type of the opened clusters
    type Writer: SeedWriter;

    /// Connect to `seed`
    async fn connect(
        &self,
        seed: &Seed,
    ) -> Result<SeedCluster<Self::Cache, Self::Writer>, ProviderError>;
}

/// Connects to seeds with the kubeconfigs found by a [`SeedKubeconfigGetter`].
#[derive(Clone)]
pub struct KubeconfigConnector {
    kubeconfigs: Arc<dyn SeedKubeconfigGetter>,
}

impl std::fmt::Debug for KubeconfigConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeconfigConnector").finish_non_exhaustive()
    }
}

impl KubeconfigConnector {
    /// Creates a connector using `kubeconfigs`
    pub fn new(kubeconfigs: Arc<dyn SeedKubeconfigGetter>) -> Self {
        Self { kubeconfigs }
    }
}

#[async_trait]
impl SeedConnector for KubeconfigConnector {
    type Cache = ApiReader;
    type Writer = KubeWriter;

    async fn connect(&self, seed: &Seed) -> Result<SeedCluster<ApiReader, KubeWriter>, ProviderError> {
        let connection = self.kubeconfigs.connect(seed).await?;
        Ok(SeedCluster {
            cache: ApiReader::new(connection.client.clone()),
            writer: KubeWriter::new(connection.client, CONTROLLER_NAME),
            url: connection.cluster_url,
        })
    }
}

/// Service account credentials read from the seed's token secret.
#[derive(Clone, PartialEq, Eq)]
pub struct SeedToken {
    /// Bearer token of the service account
    pub token: String,
    /// CA bundle of the seed API server
    pub ca_certificate: Vec<u8>,
}

impl std::fmt::Debug for SeedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeedToken")
            .field("token", &"<redacted>")
            .field("ca_certificate", &self.ca_certificate.len())
            .finish()
    }
}

/// Reconciles the proxy setup of one seed per request.
pub struct SeedProxyReconciler<S, C, W> {
    seeds: Arc<dyn SeedsGetter>,
    connector: S,
    master_cache: C,
    master_writer: W,
    proxy_image: String,
    marker: ManagementMarker,
}

impl<S, C, W> std::fmt::Debug for SeedProxyReconciler<S, C, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeedProxyReconciler")
            .field("proxy_image", &self.proxy_image)
            .field("marker", &self.marker)
            .finish_non_exhaustive()
    }
}

impl<S, C, W> SeedProxyReconciler<S, C, W>
where
    S: SeedConnector,
    C: MasterCache + 'static,
    W: MasterWriter + 'static,
{
    /// Creates a reconciler writing the master objects through
    /// `master_cache` and `master_writer`.
    pub fn new(
        seeds: Arc<dyn SeedsGetter>,
        connector: S,
        master_cache: C,
        master_writer: W,
        proxy_image: impl Into<String>,
        marker: ManagementMarker,
    ) -> Self {
        Self {
            seeds,
            connector,
            master_cache,
            master_writer,
            proxy_image: proxy_image.into(),
            marker,
        }
    }

    async fn reconcile_seed(&self, seed: &Seed, seeds: &BTreeMap<String, Seed>) -> Result<(), ControllerError> {
        let cluster = self.connector.connect(seed).await?;

        ensure_seed_access(&cluster.cache, &cluster.writer, &self.marker).await?;
        let token = read_seed_token(&seed.name, &cluster.cache).await?;
        let kubeconfig = proxy_kubeconfig(&seed.name, &cluster.url, &token.ca_certificate, &token.token)?;

        ensure_master_proxy(
            &seed.name,
            &kubeconfig,
            &self.proxy_image,
            &self.master_cache,
            &self.master_writer,
            &self.marker,
        )
        .await?;
        ensure_grafana_datasources(seeds, &self.master_cache, &self.master_writer, &self.marker).await
    }
}

#[async_trait]
impl<S, C, W> Reconciler for SeedProxyReconciler<S, C, W>
where
    S: SeedConnector,
    C: MasterCache + 'static,
    W: MasterWriter + 'static,
{
    type Error = ControllerError;

    async fn reconcile(&self, request: &ReconcileRequest) -> Result<(), ControllerError> {
        let seeds = self.seeds.seeds().await?;
        let Some(seed) = seeds.get(&request.target) else {
            info!(seed = %request.target, "Seed no longer exists, skipping");
            return Ok(());
        };

        debug!(seed = %seed.name, "Reconciling seed proxy");
        self.reconcile_seed(seed, &seeds).await?;
        info!(seed = %seed.name, "✅ Seed proxy reconciled");
        Ok(())
    }
}

/// Ensures the service account, its token secret and its monitoring role
/// binding exist in the seed.
pub async fn ensure_seed_access<C, W>(
    cache: &C,
    writer: &W,
    marker: &ManagementMarker,
) -> Result<(), ReconcileError>
where
    C: SeedCache + ?Sized,
    W: SeedWriter + ?Sized,
{
    let labels = common_labels();

    // Every kind is attempted; the first error is returned at the end
    let results = [
        reconcile_objects(
            &[seed_service_account()],
            SEED_SERVICE_ACCOUNT_NAMESPACE,
            cache,
            writer,
            marker,
            &[add_management_marker(marker.clone()), add_labels(labels.clone())],
        )
        .await,
        reconcile_objects(
            &[seed_token_secret()],
            SEED_SERVICE_ACCOUNT_NAMESPACE,
            cache,
            writer,
            marker,
            &[add_management_marker(marker.clone()), add_labels(labels.clone())],
        )
        .await,
        reconcile_objects(
            &[seed_monitoring_role()],
            SEED_MONITORING_NAMESPACE,
            cache,
            writer,
            marker,
            &[add_management_marker(marker.clone()), add_labels(labels.clone())],
        )
        .await,
        reconcile_objects(
            &[seed_monitoring_role_binding()],
            SEED_MONITORING_NAMESPACE,
            cache,
            writer,
            marker,
            &[add_management_marker(marker.clone()), add_labels(labels.clone())],
        )
        .await,
    ];
    results.into_iter().collect()
}

/// Reads the service account credentials of `seed`.
///
/// The token controller fills the secret in asynchronously after it is
/// created, so an empty secret is a retryable [`ControllerError::TokenNotReady`].
pub async fn read_seed_token<C>(seed: &str, cache: &C) -> Result<SeedToken, ControllerError>
where
    C: ObjectCache<Secret> + ?Sized,
{
    let not_ready = || ControllerError::TokenNotReady {
        seed: seed.to_string(),
        secret: format!("{SEED_SERVICE_ACCOUNT_NAMESPACE}/{SEED_TOKEN_SECRET_NAME}"),
    };

    let secret = cache
        .get(SEED_SERVICE_ACCOUNT_NAMESPACE, SEED_TOKEN_SECRET_NAME)
        .await
        .map_err(|source| {
            ControllerError::Reconcile(ReconcileError::Cache {
                object: reconciling::ManagedObjectRef::new(
                    "Secret",
                    SEED_SERVICE_ACCOUNT_NAMESPACE,
                    SEED_TOKEN_SECRET_NAME,
                ),
                source,
            })
        })?
        .ok_or_else(not_ready)?;
    let data = secret.data.unwrap_or_default();

    let token = data
        .get("token")
        .and_then(|token| String::from_utf8(token.0.clone()).ok())
        .filter(|token| !token.is_empty())
        .ok_or_else(not_ready)?;
    let ca_certificate = data
        .get("ca.crt")
        .map(|ca| ca.0.clone())
        .filter(|ca| !ca.is_empty())
        .ok_or_else(not_ready)?;

    Ok(SeedToken {
        token,
        ca_certificate,
    })
}

/// Ensures the kubeconfig secret, proxy deployment and service of `seed`
/// exist in the master.
pub async fn ensure_master_proxy<C, W>(
    seed: &str,
    kubeconfig: &str,
    proxy_image: &str,
    cache: &C,
    writer: &W,
    marker: &ManagementMarker,
) -> Result<(), ReconcileError>
where
    C: MasterCache + ?Sized,
    W: MasterWriter + ?Sized,
{
    let labels = seed_labels(seed);

    let results = [
        reconcile_objects(
            &[master_secret(seed, kubeconfig)],
            MASTER_TARGET_NAMESPACE,
            cache,
            writer,
            marker,
            &[add_management_marker(marker.clone()), add_labels(labels.clone())],
        )
        .await,
        reconcile_objects(
            &[master_deployment(seed, proxy_image)],
            MASTER_TARGET_NAMESPACE,
            cache,
            writer,
            marker,
            &[add_management_marker(marker.clone()), add_labels(labels.clone())],
        )
        .await,
        reconcile_objects(
            &[master_service(seed)],
            MASTER_TARGET_NAMESPACE,
            cache,
            writer,
            marker,
            &[add_management_marker(marker.clone()), add_labels(labels.clone())],
        )
        .await,
    ];
    results.into_iter().collect()
}

/// Ensures the Grafana ConfigMap lists exactly the Prometheus of each of `seeds`.
pub async fn ensure_grafana_datasources<C, W>(
    seeds: &BTreeMap<String, Seed>,
    cache: &C,
    writer: &W,
    marker: &ManagementMarker,
) -> Result<(), ControllerError>
where
    C: MasterCache + ?Sized,
    W: MasterWriter + ?Sized,
{
    let datasources = grafana_datasources(seeds)?;

    reconcile_objects(
        &[grafana_config_map(datasources)],
        MASTER_GRAFANA_NAMESPACE,
        cache,
        writer,
        marker,
        &[add_management_marker(marker.clone()), add_labels(common_labels())],
    )
    .await?;
    Ok(())
}
