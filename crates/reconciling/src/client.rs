//! Write capability
//!
//! [`ObjectWriter`] is the only path through which the engine mutates a
//! cluster. [`KubeWriter`] implements it with plain `create` and `replace`
//! calls, so a stale `resourceVersion` is rejected by the API server.
//! Rejections the engine cares about come back as the matching
//! [`WriteError`] variant rather than a raw API error.

use crate::error::WriteError;
use crate::object::{ManagedObject, ManagedObjectRef};
use async_trait::async_trait;
use kube::api::{Api, PostParams};
use kube::{Client, ResourceExt};

/// Create and update access for objects of kind `K`.
#[async_trait]
pub trait ObjectWriter<K>: Send + Sync {
    /// Creates `obj`, failing if an object with the same name exists.
    async fn create(&self, obj: &K) -> Result<K, WriteError>;

    /// Replaces the object named by `obj`, guarded by its `resourceVersion`.
    async fn update(&self, obj: &K) -> Result<K, WriteError>;
}

/// Writes through the Kubernetes API.
#[derive(Clone)]
pub struct KubeWriter {
    client: Client,
    field_manager: String,
}

impl KubeWriter {
    /// Creates a writer for the cluster behind `client`.
    ///
    /// `field_manager` is recorded in `managedFields` for every write.
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn api<K: ManagedObject>(&self, obj: &K) -> Api<K> {
        match obj.namespace() {
            Some(namespace) => Api::namespaced(self.client.clone(), &namespace),
            None => Api::default_namespaced(self.client.clone()),
        }
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        }
    }
}

impl std::fmt::Debug for KubeWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeWriter")
            .field("field_manager", &self.field_manager)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<K> ObjectWriter<K> for KubeWriter
where
    K: ManagedObject,
{
    async fn create(&self, obj: &K) -> Result<K, WriteError> {
        self.api(obj)
            .create(&self.post_params(), obj)
            .await
            .map_err(|e| write_error(obj, e))
    }

    async fn update(&self, obj: &K) -> Result<K, WriteError> {
        let name = obj.name_any();
        self.api(obj)
            .replace(&name, &self.post_params(), obj)
            .await
            .map_err(|e| write_error(obj, e))
    }
}

fn write_error<K: ManagedObject>(obj: &K, err: kube::Error) -> WriteError {
    let object = || ManagedObjectRef::from_object(obj).to_string();
    match err {
        kube::Error::Api(ref response) if response.code == 409 && response.reason == "AlreadyExists" => {
            WriteError::AlreadyExists(object())
        }
        kube::Error::Api(ref response) if response.code == 409 => WriteError::Conflict(object()),
        kube::Error::Api(ref response) if response.code == 404 => WriteError::NotFound(object()),
        other => WriteError::Kube(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("rejected: {reason}"),
            reason: reason.to_string(),
            code,
        })
    }

    fn config_map() -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("grafana-seed-proxies".to_string()),
                namespace: Some("monitoring-master".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_api_rejections_map_to_write_errors() {
        let obj = config_map();

        assert!(matches!(
            write_error(&obj, api_error(409, "AlreadyExists")),
            WriteError::AlreadyExists(ref o) if o == "ConfigMap monitoring-master/grafana-seed-proxies"
        ));
        assert!(matches!(write_error(&obj, api_error(409, "Conflict")), WriteError::Conflict(_)));
        assert!(matches!(write_error(&obj, api_error(404, "NotFound")), WriteError::NotFound(_)));
        assert!(matches!(write_error(&obj, api_error(422, "Invalid")), WriteError::Kube(_)));
    }
}
