//! Create-or-update-if-different.
//!
//! [`ensure_object`] converges one object toward the state its creator
//! describes, writing at most once. [`reconcile_objects`] runs it for a
//! batch of creators sharing the same modifiers.

use crate::cache::ObjectCache;
use crate::client::ObjectWriter;
use crate::creator::{apply_modifiers, ObjectCreator, ObjectModifier};
use crate::error::ReconcileError;
use crate::object::{ManagedObject, ManagedObjectRef, ManagementMarker};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What [`ensure_object`] did to the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// The object did not exist and was created
    Created,
    /// The object differed from its desired state and was replaced
    Updated,
    /// The object already matched; nothing was written
    Unchanged,
}

/// Ensures the object described by `create` exists in `namespace` as desired.
///
/// The creator first runs on the kind's zero value to learn the object name.
/// A missing object is created from that result. An existing object must
/// carry `marker`; the creator then runs on it, and the result replaces the
/// object only if it differs semantically.
pub async fn ensure_object<K, C, W>(
    namespace: &str,
    create: &ObjectCreator<K>,
    cache: &C,
    writer: &W,
    marker: &ManagementMarker,
) -> Result<EnsureOutcome, ReconcileError>
where
    K: ManagedObject,
    C: ObjectCache<K> + ?Sized,
    W: ObjectWriter<K> + ?Sized,
{
    let initial = desired_state(create, K::default(), namespace, None)?;
    let object = ManagedObjectRef::from_object(&initial);

    let existing = cache
        .get(namespace, &object.name)
        .await
        .map_err(|source| ReconcileError::Cache {
            object: object.clone(),
            source,
        })?;

    let Some(existing) = existing else {
        require_marker(&initial, &object, marker)?;
        writer
            .create(&initial)
            .await
            .map_err(|source| ReconcileError::Create {
                object: object.clone(),
                source,
            })?;
        info!(%object, "Created object");
        return Ok(EnsureOutcome::Created);
    };

    if !marker.is_carried_by(&existing) {
        return Err(ReconcileError::NotManaged {
            object,
            marker: marker.to_string(),
        });
    }

    let mut desired = desired_state(create, existing.clone(), namespace, Some(&object))?;
    require_marker(&desired, &object, marker)?;

    if existing.semantically_equal(&desired) {
        debug!(%object, "Object is up to date");
        return Ok(EnsureOutcome::Unchanged);
    }

    desired.meta_mut().resource_version = existing.meta().resource_version.clone();
    writer
        .update(&desired)
        .await
        .map_err(|source| ReconcileError::Update {
            object: object.clone(),
            source,
        })?;
    info!(%object, "Updated object");
    Ok(EnsureOutcome::Updated)
}

/// Ensures every object described by `creators`, each wrapped in `modifiers`.
///
/// All creators are attempted even when some fail; the first error is
/// returned once the batch is done.
pub async fn reconcile_objects<K, C, W>(
    creators: &[ObjectCreator<K>],
    namespace: &str,
    cache: &C,
    writer: &W,
    marker: &ManagementMarker,
    modifiers: &[ObjectModifier<K>],
) -> Result<(), ReconcileError>
where
    K: ManagedObject,
    C: ObjectCache<K> + ?Sized,
    W: ObjectWriter<K> + ?Sized,
{
    let mut first_error = None;

    for create in creators {
        let create = apply_modifiers(Arc::clone(create), modifiers);
        if let Err(e) = ensure_object(namespace, &create, cache, writer, marker).await {
            warn!(kind = %K::kind_name(), namespace, error = %e, "Failed to ensure object");
            first_error.get_or_insert(e);
        }
    }

    first_error.map_or(Ok(()), Err)
}

fn desired_state<K: ManagedObject>(
    create: &ObjectCreator<K>,
    input: K,
    namespace: &str,
    existing: Option<&ManagedObjectRef>,
) -> Result<K, ReconcileError> {
    let mut obj = create(input).map_err(|source| ReconcileError::Creator {
        kind: K::kind_name(),
        object: existing.cloned(),
        source,
    })?;
    obj.meta_mut().namespace = Some(namespace.to_string());

    if obj.object_name().is_none() {
        return Err(ReconcileError::MissingName {
            kind: K::kind_name(),
            object: existing.cloned(),
        });
    }
    Ok(obj)
}

fn require_marker<K: ManagedObject>(
    desired: &K,
    object: &ManagedObjectRef,
    marker: &ManagementMarker,
) -> Result<(), ReconcileError> {
    if marker.is_carried_by(desired) {
        Ok(())
    } else {
        Err(ReconcileError::MissingMarker {
            object: object.clone(),
            marker: marker.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::creator::{add_management_marker, creator};
    use crate::error::WriteError;
    use crate::mock::FakeCluster;
    use k8s_openapi::api::core::v1::{ConfigMap, Service, ServicePort, ServiceSpec, ServiceStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    const NAMESPACE: &str = "kubermatic";

    fn marker() -> ManagementMarker {
        ManagementMarker::managed_by("seed-proxy-controller")
    }

    fn proxy_service() -> ObjectCreator<Service> {
        creator(|mut svc: Service| {
            svc.metadata.name = Some("proxy".to_string());
            let spec = svc.spec.get_or_insert_with(ServiceSpec::default);
            spec.ports = Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: 8001,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]);
            Ok(svc)
        })
    }

    fn marked(create: ObjectCreator<Service>) -> ObjectCreator<Service> {
        apply_modifiers(create, &[add_management_marker(marker())])
    }

    fn existing_service(labels: &[(&str, &str)], port: i32) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("proxy".to_string()),
                namespace: Some(NAMESPACE.to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: Some("10.96.0.17".to_string()),
                ports: Some(vec![ServicePort {
                    name: Some("http".to_string()),
                    port,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            status: None,
        }
    }

    #[tokio::test]
    async fn test_second_ensure_writes_nothing() {
        let cluster = FakeCluster::new();
        let create = marked(proxy_service());

        let first = ensure_object(NAMESPACE, &create, &cluster, &cluster, &marker()).await.unwrap();
        assert_eq!(first, EnsureOutcome::Created);
        assert_eq!(cluster.creates(), 1);

        let second = ensure_object(NAMESPACE, &create, &cluster, &cluster, &marker()).await.unwrap();
        assert_eq!(second, EnsureOutcome::Unchanged);
        assert_eq!(cluster.writes(), 1);

        let svc: Service = cluster.object(NAMESPACE, "proxy").unwrap();
        assert_eq!(svc.spec.unwrap().ports.unwrap()[0].port, 8001);
    }

    #[tokio::test]
    async fn test_drifted_object_is_updated_and_keeps_untouched_fields() {
        let cluster = FakeCluster::new();
        cluster.insert(existing_service(&[("app.kubernetes.io/managed-by", "seed-proxy-controller")], 9000));

        let outcome = ensure_object(NAMESPACE, &marked(proxy_service()), &cluster, &cluster, &marker())
            .await
            .unwrap();

        assert_eq!(outcome, EnsureOutcome::Updated);
        assert_eq!(cluster.updates(), 1);
        let svc: Service = cluster.object(NAMESPACE, "proxy").unwrap();
        let spec = svc.spec.unwrap();
        assert_eq!(spec.ports.unwrap()[0].port, 8001);
        assert_eq!(spec.cluster_ip.as_deref(), Some("10.96.0.17"));
        assert_eq!(svc.metadata.resource_version.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_unmanaged_object_is_never_touched() {
        let cluster = FakeCluster::new();
        let foreign = existing_service(&[("app.kubernetes.io/managed-by", "helm")], 9000);
        cluster.insert(foreign.clone());

        let err = ensure_object(NAMESPACE, &marked(proxy_service()), &cluster, &cluster, &marker())
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::NotManaged { ref object, .. } if object.name == "proxy"));
        assert!(err.is_contract_violation());
        assert_eq!(cluster.writes(), 0);
        let svc: Service = cluster.object(NAMESPACE, "proxy").unwrap();
        assert_eq!(svc.spec, foreign.spec);
    }

    #[tokio::test]
    async fn test_status_differences_do_not_cause_writes() {
        let cluster = FakeCluster::new();
        let mut current = existing_service(&[("app.kubernetes.io/managed-by", "seed-proxy-controller")], 8001);
        current.status = Some(ServiceStatus::default());
        cluster.insert(current);

        let outcome = ensure_object(NAMESPACE, &marked(proxy_service()), &cluster, &cluster, &marker())
            .await
            .unwrap();

        assert_eq!(outcome, EnsureOutcome::Unchanged);
        assert_eq!(cluster.writes(), 0);
    }

    #[tokio::test]
    async fn test_create_race_surfaces_as_create_error() {
        let cluster = FakeCluster::new();
        cluster.insert(existing_service(&[("app.kubernetes.io/managed-by", "seed-proxy-controller")], 8001));
        cluster.hide_from_cache::<Service>(NAMESPACE, "proxy");

        let err = ensure_object(NAMESPACE, &marked(proxy_service()), &cluster, &cluster, &marker())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ReconcileError::Create {
                source: WriteError::AlreadyExists(_),
                ..
            }
        ));
        assert!(!err.is_contract_violation());
    }

    #[tokio::test]
    async fn test_nameless_object_is_rejected() {
        let cluster = FakeCluster::new();
        let create = apply_modifiers(creator(|cm: ConfigMap| Ok(cm)), &[add_management_marker(marker())]);

        let err = ensure_object(NAMESPACE, &create, &cluster, &cluster, &marker())
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::MissingName { ref kind, object: None } if kind == "ConfigMap"));
        assert_eq!(cluster.writes(), 0);
    }

    #[tokio::test]
    async fn test_unmarked_desired_object_is_rejected() {
        let cluster = FakeCluster::new();

        let err = ensure_object(NAMESPACE, &proxy_service(), &cluster, &cluster, &marker())
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::MissingMarker { .. }));
        assert_eq!(cluster.writes(), 0);
    }

    #[tokio::test]
    async fn test_namespace_is_forced() {
        let cluster = FakeCluster::new();
        let create = marked(creator(|mut svc: Service| {
            svc.metadata.name = Some("proxy".to_string());
            svc.metadata.namespace = Some("default".to_string());
            Ok(svc)
        }));

        ensure_object(NAMESPACE, &create, &cluster, &cluster, &marker()).await.unwrap();

        assert!(cluster.object::<Service>(NAMESPACE, "proxy").is_some());
        assert!(cluster.object::<Service>("default", "proxy").is_none());
    }

    #[tokio::test]
    async fn test_creator_failure_on_existing_object_names_it() {
        let cluster = FakeCluster::new();
        cluster.insert(existing_service(&[("app.kubernetes.io/managed-by", "seed-proxy-controller")], 8001));
        let create = marked(creator(|mut svc: Service| {
            if svc.metadata.resource_version.is_some() {
                anyhow::bail!("cannot rebuild proxy");
            }
            svc.metadata.name = Some("proxy".to_string());
            Ok(svc)
        }));

        let err = ensure_object(NAMESPACE, &create, &cluster, &cluster, &marker())
            .await
            .unwrap_err();

        match &err {
            ReconcileError::Creator { object: Some(object), .. } => {
                assert_eq!(object.to_string(), "Service kubermatic/proxy");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(
            err.to_string(),
            "creator for Service kubermatic/proxy failed: cannot rebuild proxy"
        );
        assert_eq!(cluster.writes(), 0);
    }

    fn named_config_map(name: &'static str) -> ObjectCreator<ConfigMap> {
        creator(move |mut cm: ConfigMap| {
            cm.metadata.name = Some(name.to_string());
            cm.data = Some(BTreeMap::from([("seed".to_string(), name.to_string())]));
            Ok(cm)
        })
    }

    fn failing(message: &'static str) -> ObjectCreator<ConfigMap> {
        creator(move |_| Err(anyhow::anyhow!(message)))
    }

    #[tokio::test]
    async fn test_batch_attempts_every_creator_and_returns_first_error() {
        let cluster = FakeCluster::new();
        let creators = vec![
            named_config_map("europe"),
            failing("first failure"),
            named_config_map("asia"),
            failing("second failure"),
        ];

        let err = reconcile_objects(
            &creators,
            "monitoring-master",
            &cluster,
            &cluster,
            &marker(),
            &[add_management_marker(marker())],
        )
        .await
        .unwrap_err();

        assert_eq!(cluster.creates(), 2);
        match err {
            ReconcileError::Creator { kind, object, source } => {
                assert_eq!(kind, "ConfigMap");
                assert!(object.is_none());
                assert_eq!(source.to_string(), "first failure");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_batch_is_idempotent() {
        let cluster = FakeCluster::new();
        let creators = vec![named_config_map("europe"), named_config_map("asia")];
        let modifiers = [add_management_marker(marker())];

        reconcile_objects(&creators, "monitoring-master", &cluster, &cluster, &marker(), &modifiers)
            .await
            .unwrap();
        reconcile_objects(&creators, "monitoring-master", &cluster, &cluster, &marker(), &modifiers)
            .await
            .unwrap();

        assert_eq!(cluster.creates(), 2);
        assert_eq!(cluster.updates(), 0);
    }
}
