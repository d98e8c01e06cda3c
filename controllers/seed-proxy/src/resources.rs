//! Desired state of every object the controller manages.
//!
//! Each function returns an [`ObjectCreator`] that edits the existing object
//! in place, so fields the API server or other controllers fill in survive
//! and only the fields set here are converged.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, ContainerPort, PodSpec, Secret, SecretVolumeSource,
    Service, ServiceAccount, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use reconciling::{creator, ManagementMarker, ObjectCreator};
use seed_provider::Seed;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;

use crate::error::ControllerError;

/// Name of this controller, also the value of its management marker
pub const CONTROLLER_NAME: &str = "seed-proxy-controller";

/// Master namespace holding the per-seed proxies
pub const MASTER_TARGET_NAMESPACE: &str = "kubermatic";

/// `NameLabel` value of everything the controller creates
pub const APP_NAME: &str = "seed-proxy";

/// Master namespace Grafana runs in
pub const MASTER_GRAFANA_NAMESPACE: &str = "monitoring-master";

/// ConfigMap holding the Grafana datasources of all seeds
pub const MASTER_GRAFANA_CONFIGMAP_NAME: &str = "grafana-seed-proxies";

/// Key of the datasource file inside the Grafana ConfigMap
pub const MASTER_GRAFANA_DATASOURCES_KEY: &str = "seed-proxies.yaml";

/// Service account the proxies authenticate as in each seed
pub const SEED_SERVICE_ACCOUNT_NAME: &str = "seed-proxy";

/// Seed namespace of the service account
pub const SEED_SERVICE_ACCOUNT_NAMESPACE: &str = "kube-system";

/// Token secret of the service account
pub const SEED_TOKEN_SECRET_NAME: &str = "seed-proxy-token";

/// Seed namespace Prometheus and Alertmanager run in
pub const SEED_MONITORING_NAMESPACE: &str = "monitoring";

/// Role granting proxy access to the monitoring services
pub const SEED_MONITORING_ROLE_NAME: &str = "seed-proxy";

/// Binding of [`SEED_MONITORING_ROLE_NAME`] to the service account
pub const SEED_MONITORING_ROLE_BINDING_NAME: &str = "seed-proxy";

/// Prometheus service and port inside the seed
pub const SEED_PROMETHEUS_SERVICE: &str = "prometheus:web";

/// Alertmanager service and port inside the seed
pub const SEED_ALERTMANAGER_SERVICE: &str = "alertmanager:web";

/// Port `kubectl proxy` listens on. Not the port of Prometheus itself.
pub const KUBECTL_PROXY_PORT: i32 = 8001;

/// Recommended label naming the application
pub const NAME_LABEL: &str = "app.kubernetes.io/name";

/// Recommended label distinguishing instances; holds the seed name
pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";

const PROXY_CONTAINER_NAME: &str = "proxy";
const KUBECONFIG_VOLUME_NAME: &str = "kubeconfig";
const KUBECONFIG_MOUNT_PATH: &str = "/etc/seed-proxy";
const KUBECONFIG_SECRET_KEY: &str = "kubeconfig";
const PORT_NAME: &str = "http";
const SECRET_DEFAULT_MODE: i32 = 0o644;

/// Marker carried by every object this controller owns
pub fn management_marker() -> ManagementMarker {
    ManagementMarker::managed_by(CONTROLLER_NAME)
}

/// Name of the master Secret, Deployment and Service of `seed`
pub fn seed_proxy_name(seed: &str) -> String {
    format!("seed-proxy-{seed}")
}

/// Labels of objects not tied to a single seed
pub fn common_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(NAME_LABEL.to_string(), APP_NAME.to_string())])
}

/// Labels of the per-seed master objects; also the proxy pod selector
pub fn seed_labels(seed: &str) -> BTreeMap<String, String> {
    let mut labels = common_labels();
    labels.insert(INSTANCE_LABEL.to_string(), seed.to_string());
    labels
}

/// In-cluster URL of the Prometheus of `seed`, reached through its proxy.
pub fn seed_prometheus_url(seed: &str) -> String {
    format!(
        "http://{}.{}.svc.cluster.local:{}/api/v1/namespaces/{}/services/{}/proxy/",
        seed_proxy_name(seed),
        MASTER_TARGET_NAMESPACE,
        KUBECTL_PROXY_PORT,
        SEED_MONITORING_NAMESPACE,
        SEED_PROMETHEUS_SERVICE,
    )
}

// Seed cluster

/// Service account the proxy of a seed runs as
pub fn seed_service_account() -> ObjectCreator<ServiceAccount> {
    creator(|mut sa: ServiceAccount| {
        sa.metadata.name = Some(SEED_SERVICE_ACCOUNT_NAME.to_string());
        Ok(sa)
    })
}

/// Long-lived token secret of the service account, filled in by the token controller
pub fn seed_token_secret() -> ObjectCreator<Secret> {
    creator(|mut secret: Secret| {
        secret.metadata.name = Some(SEED_TOKEN_SECRET_NAME.to_string());
        secret
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(
                "kubernetes.io/service-account.name".to_string(),
                SEED_SERVICE_ACCOUNT_NAME.to_string(),
            );
        secret.type_ = Some("kubernetes.io/service-account-token".to_string());
        Ok(secret)
    })
}

/// Role allowing reads through the service proxy of Prometheus and Alertmanager
pub fn seed_monitoring_role() -> ObjectCreator<Role> {
    creator(|mut role: Role| {
        role.metadata.name = Some(SEED_MONITORING_ROLE_NAME.to_string());
        role.rules = Some(vec![PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec!["services/proxy".to_string()]),
            resource_names: Some(vec![
                SEED_PROMETHEUS_SERVICE.to_string(),
                SEED_ALERTMANAGER_SERVICE.to_string(),
            ]),
            verbs: vec!["get".to_string()],
            ..Default::default()
        }]);
        Ok(role)
    })
}

/// Binds the monitoring role to the proxy service account
pub fn seed_monitoring_role_binding() -> ObjectCreator<RoleBinding> {
    creator(|mut binding: RoleBinding| {
        binding.metadata.name = Some(SEED_MONITORING_ROLE_BINDING_NAME.to_string());
        binding.role_ref = RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: SEED_MONITORING_ROLE_NAME.to_string(),
        };
        binding.subjects = Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: SEED_SERVICE_ACCOUNT_NAME.to_string(),
            namespace: Some(SEED_SERVICE_ACCOUNT_NAMESPACE.to_string()),
            ..Default::default()
        }]);
        Ok(binding)
    })
}

// Master cluster

/// Kubeconfig letting `kubectl proxy` reach `server` with the seed service
/// account `token`.
pub fn proxy_kubeconfig(
    seed: &str,
    server: &str,
    ca_certificate: &[u8],
    token: &str,
) -> Result<String, ControllerError> {
    let kubeconfig = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": seed,
            "cluster": {
                "server": server,
                "certificate-authority-data": STANDARD.encode(ca_certificate),
            },
        }],
        "users": [{
            "name": SEED_SERVICE_ACCOUNT_NAME,
            "user": { "token": token },
        }],
        "contexts": [{
            "name": seed,
            "context": { "cluster": seed, "user": SEED_SERVICE_ACCOUNT_NAME },
        }],
        "current-context": seed,
    });

    serde_yaml::to_string(&kubeconfig).map_err(|source| ControllerError::Render {
        what: "proxy kubeconfig",
        source,
    })
}

/// Secret holding the proxy kubeconfig of `seed`
pub fn master_secret(seed: &str, kubeconfig: &str) -> ObjectCreator<Secret> {
    let name = seed_proxy_name(seed);
    let kubeconfig = ByteString(kubeconfig.as_bytes().to_vec());
    creator(move |mut secret: Secret| {
        secret.metadata.name = Some(name.clone());
        secret.type_ = Some("Opaque".to_string());
        secret.data = Some(BTreeMap::from([(
            KUBECONFIG_SECRET_KEY.to_string(),
            kubeconfig.clone(),
        )]));
        Ok(secret)
    })
}

/// Deployment running `kubectl proxy` against `seed`
pub fn master_deployment(seed: &str, image: &str) -> ObjectCreator<Deployment> {
    let name = seed_proxy_name(seed);
    let labels = seed_labels(seed);
    let image = image.to_string();

    creator(move |mut deployment: Deployment| {
        deployment.metadata.name = Some(name.clone());

        let spec = deployment.spec.get_or_insert_with(DeploymentSpec::default);
        spec.replicas = Some(1);
        spec.selector = LabelSelector {
            match_labels: Some(labels.clone()),
            ..Default::default()
        };

        let template = &mut spec.template;
        let template_labels = template
            .metadata
            .get_or_insert_with(Default::default)
            .labels
            .get_or_insert_with(BTreeMap::new);
        template_labels.extend(labels.clone());

        let pod = template.spec.get_or_insert_with(PodSpec::default);
        let container = upsert_named(&mut pod.containers, PROXY_CONTAINER_NAME, |name| Container {
            name: name.to_string(),
            ..Default::default()
        });
        container.image = Some(image.clone());
        container.command = Some(vec![
            "kubectl".to_string(),
            "proxy".to_string(),
            format!("--kubeconfig={KUBECONFIG_MOUNT_PATH}/{KUBECONFIG_SECRET_KEY}"),
            "--address=0.0.0.0".to_string(),
            format!("--port={KUBECTL_PROXY_PORT}"),
            "--accept-hosts=.*".to_string(),
        ]);

        let port = upsert_named(
            container.ports.get_or_insert_with(Vec::new),
            PORT_NAME,
            |name| ContainerPort {
                name: Some(name.to_string()),
                ..Default::default()
            },
        );
        port.container_port = KUBECTL_PROXY_PORT;
        port.protocol = Some("TCP".to_string());

        let mount = upsert_named(
            container.volume_mounts.get_or_insert_with(Vec::new),
            KUBECONFIG_VOLUME_NAME,
            |name| VolumeMount {
                name: name.to_string(),
                ..Default::default()
            },
        );
        mount.mount_path = KUBECONFIG_MOUNT_PATH.to_string();
        mount.read_only = Some(true);

        let volume = upsert_named(
            pod.volumes.get_or_insert_with(Vec::new),
            KUBECONFIG_VOLUME_NAME,
            |name| Volume {
                name: name.to_string(),
                ..Default::default()
            },
        );
        volume.secret = Some(SecretVolumeSource {
            secret_name: Some(name.clone()),
            default_mode: Some(SECRET_DEFAULT_MODE),
            ..Default::default()
        });

        Ok(deployment)
    })
}

/// Service exposing the proxy of `seed` inside the master
pub fn master_service(seed: &str) -> ObjectCreator<Service> {
    let name = seed_proxy_name(seed);
    let labels = seed_labels(seed);

    creator(move |mut service: Service| {
        service.metadata.name = Some(name.clone());

        let spec = service.spec.get_or_insert_with(ServiceSpec::default);
        spec.type_ = Some("ClusterIP".to_string());
        spec.selector = Some(labels.clone());

        let port = upsert_named(spec.ports.get_or_insert_with(Vec::new), PORT_NAME, |name| {
            ServicePort {
                name: Some(name.to_string()),
                ..Default::default()
            }
        });
        port.port = KUBECTL_PROXY_PORT;
        port.target_port = Some(IntOrString::Int(KUBECTL_PROXY_PORT));
        port.protocol = Some("TCP".to_string());

        Ok(service)
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GrafanaProvisioning {
    api_version: u32,
    datasources: Vec<GrafanaDatasource>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GrafanaDatasource {
    name: String,
    #[serde(rename = "type")]
    kind: &'static str,
    access: &'static str,
    org_id: u32,
    url: String,
    editable: bool,
}

/// Grafana provisioning file with one Prometheus datasource per seed.
pub fn grafana_datasources(seeds: &BTreeMap<String, Seed>) -> Result<String, ControllerError> {
    let provisioning = GrafanaProvisioning {
        api_version: 1,
        datasources: seeds
            .keys()
            .map(|seed| GrafanaDatasource {
                name: format!("Seed {seed}"),
                kind: "prometheus",
                access: "proxy",
                org_id: 1,
                url: seed_prometheus_url(seed),
                editable: false,
            })
            .collect(),
    };

    serde_yaml::to_string(&provisioning).map_err(|source| ControllerError::Render {
        what: "Grafana datasources",
        source,
    })
}

/// ConfigMap provisioning the rendered `datasources` into Grafana
pub fn grafana_config_map(datasources: String) -> ObjectCreator<ConfigMap> {
    creator(move |mut config_map: ConfigMap| {
        config_map.metadata.name = Some(MASTER_GRAFANA_CONFIGMAP_NAME.to_string());
        config_map.data = Some(BTreeMap::from([(
            MASTER_GRAFANA_DATASOURCES_KEY.to_string(),
            datasources.clone(),
        )]));
        Ok(config_map)
    })
}

/// Returns the element of `items` named `name`, appending a fresh one first
/// if there is none.
fn upsert_named<'a, T, F>(items: &'a mut Vec<T>, name: &str, fresh: F) -> &'a mut T
where
    T: Named,
    F: FnOnce(&str) -> T,
{
    let index = match items.iter().position(|item| item.name() == Some(name)) {
        Some(index) => index,
        None => {
            items.push(fresh(name));
            items.len() - 1
        }
    };
    &mut items[index]
}

trait Named {
    fn name(&self) -> Option<&str>;
}

impl Named for Container {
    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }
}

impl Named for ContainerPort {
    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl Named for VolumeMount {
    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }
}

impl Named for Volume {
    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }
}

impl Named for ServicePort {
    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}
