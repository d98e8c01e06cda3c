//! Object identity and the management marker.
//!
//! Every kind the engine handles goes through the same [`ManagedObject`]
//! capability: a name, labels carrying the management marker, and a
//! comparison restricted to the fields this controller owns.

use k8s_openapi::NamespaceResourceScope;
use kube::{Resource, ResourceExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::fmt;

/// Label key recording which controller manages an object.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Metadata written by the API server, never part of a desired state.
const SERVER_MANAGED_METADATA: &[&str] = &[
    "resourceVersion",
    "uid",
    "creationTimestamp",
    "generation",
    "managedFields",
    "selfLink",
];

/// Identity of a cluster object: kind, namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ManagedObjectRef {
    /// Object kind (e.g. "Deployment")
    pub kind: String,
    /// Namespace the object lives in
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl ManagedObjectRef {
    /// Creates a reference from its parts.
    pub fn new(kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Builds the reference of an existing object.
    pub fn from_object<K: ManagedObject>(obj: &K) -> Self {
        Self::new(
            K::kind_name(),
            obj.namespace().unwrap_or_default(),
            obj.name_any(),
        )
    }
}

impl fmt::Display for ManagedObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// Label key/value identifying the objects owned by one controller.
///
/// Objects without a matching marker are never written by the engine, and
/// the event filter ignores them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagementMarker {
    key: String,
    value: String,
}

impl ManagementMarker {
    /// Creates a marker with an arbitrary label key.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Marker using the well-known `app.kubernetes.io/managed-by` label.
    pub fn managed_by(controller: impl Into<String>) -> Self {
        Self::new(MANAGED_BY_LABEL, controller)
    }

    /// Label key of the marker.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Label value of the marker (the controller identity).
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Returns true if `obj` carries this exact marker.
    pub fn is_carried_by<K: Resource>(&self, obj: &K) -> bool {
        obj.labels().get(&self.key).is_some_and(|v| *v == self.value)
    }

    /// Stamps the marker onto `obj`, replacing any other value for the key.
    pub fn apply_to<K: Resource>(&self, obj: &mut K) {
        obj.labels_mut().insert(self.key.clone(), self.value.clone());
    }
}

impl fmt::Display for ManagementMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Capability required from every kind the engine reconciles.
///
/// Blanket-implemented for all namespaced `kube` resources with a static
/// type, so new kinds need no code of their own.
pub trait ManagedObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Default
    + fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Kind name used in object references, logs and errors.
    fn kind_name() -> String {
        Self::kind(&()).into_owned()
    }

    /// Object name, `None` when unset or empty.
    fn object_name(&self) -> Option<&str> {
        self.meta().name.as_deref().filter(|name| !name.is_empty())
    }

    /// The object as JSON, minus `status` and server-managed metadata.
    ///
    /// Status is owned by other writers, so it never takes part in the
    /// desired/actual comparison.
    fn owned_fields(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Some(fields) = value.as_object_mut() {
            fields.remove("status");
            if let Some(meta) = fields.get_mut("metadata").and_then(Value::as_object_mut) {
                for field in SERVER_MANAGED_METADATA {
                    meta.remove(*field);
                }
            }
        }
        value
    }

    /// Semantic equality over [`ManagedObject::owned_fields`].
    fn semantically_equal(&self, other: &Self) -> bool {
        self.owned_fields() == other.owned_fields()
    }
}

impl<K> ManagedObject for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Default
        + fmt::Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}
