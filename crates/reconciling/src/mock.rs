//! In-memory cluster for unit testing
//!
//! [`FakeCluster`] implements both [`ObjectCache`] and [`ObjectWriter`] for
//! every managed kind, so engine and business logic can be exercised without
//! an API server. Writes are counted and bump a `resourceVersion` the way the
//! API server does, and stale updates are rejected with a conflict.

use crate::cache::ObjectCache;
use crate::client::ObjectWriter;
use crate::error::{CacheError, WriteError};
use crate::object::{ManagedObject, ManagedObjectRef};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// In-memory store of cluster objects, keyed by [`ManagedObjectRef`].
///
/// Clones share the same state.
#[derive(Clone, Debug, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<FakeState>>,
}

#[derive(Debug, Default)]
struct FakeState {
    objects: BTreeMap<ManagedObjectRef, Value>,
    // Objects present in the cluster but not yet seen by the cache
    hidden: BTreeSet<ManagedObjectRef>,
    failing_reads: bool,
    creates: usize,
    updates: usize,
    resource_version: u64,
}

impl FakeState {
    fn next_resource_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }
}

impl FakeCluster {
    /// Create an empty cluster
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Store `obj` as if someone else had created it. Does not count as a write.
    pub fn insert<K: ManagedObject>(&self, mut obj: K) {
        let mut state = self.lock();
        obj.meta_mut().resource_version = Some(state.next_resource_version());
        let key = ManagedObjectRef::from_object(&obj);
        if let Ok(value) = serde_json::to_value(&obj) {
            state.objects.insert(key, value);
        }
    }

    /// Read an object directly, bypassing the cache view.
    pub fn object<K: ManagedObject>(&self, namespace: &str, name: &str) -> Option<K> {
        let key = ManagedObjectRef::new(K::kind_name(), namespace, name);
        self.lock()
            .objects
            .get(&key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// All objects of kind `K`, ordered by namespace and name.
    pub fn objects<K: ManagedObject>(&self) -> Vec<K> {
        let kind = K::kind_name();
        self.lock()
            .objects
            .iter()
            .filter(|(key, _)| key.kind == kind)
            .filter_map(|(_, value)| serde_json::from_value(value.clone()).ok())
            .collect()
    }

    /// Make the cache report `namespace/name` as absent while it still exists.
    pub fn hide_from_cache<K: ManagedObject>(&self, namespace: &str, name: &str) {
        let key = ManagedObjectRef::new(K::kind_name(), namespace, name);
        self.lock().hidden.insert(key);
    }

    /// Make every cache read fail until reset.
    pub fn set_cache_unavailable(&self, unavailable: bool) {
        self.lock().failing_reads = unavailable;
    }

    /// Number of successful creates
    pub fn creates(&self) -> usize {
        self.lock().creates
    }

    /// Number of successful updates
    pub fn updates(&self) -> usize {
        self.lock().updates
    }

    /// Number of successful writes of any kind
    pub fn writes(&self) -> usize {
        let state = self.lock();
        state.creates + state.updates
    }
}

fn resource_version(value: &Value) -> Option<&str> {
    value
        .get("metadata")
        .and_then(|meta| meta.get("resourceVersion"))
        .and_then(Value::as_str)
}

#[async_trait]
impl<K: ManagedObject> ObjectCache<K> for FakeCluster {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, CacheError> {
        let state = self.lock();
        if state.failing_reads {
            return Err(CacheError::Unavailable("fake cache is unavailable".to_string()));
        }
        let key = ManagedObjectRef::new(K::kind_name(), namespace, name);
        if state.hidden.contains(&key) {
            return Ok(None);
        }
        state
            .objects
            .get(&key)
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
            .map_err(|e| CacheError::Unavailable(format!("stored {key} does not decode: {e}")))
    }
}

#[async_trait]
impl<K: ManagedObject> ObjectWriter<K> for FakeCluster {
    async fn create(&self, obj: &K) -> Result<K, WriteError> {
        let mut state = self.lock();
        let key = ManagedObjectRef::from_object(obj);
        if state.objects.contains_key(&key) {
            return Err(WriteError::AlreadyExists(key.to_string()));
        }

        let mut created = obj.clone();
        created.meta_mut().resource_version = Some(state.next_resource_version());
        let value = serde_json::to_value(&created).map_err(|e| WriteError::Kube(kube::Error::SerdeError(e)))?;
        state.objects.insert(key, value);
        state.creates += 1;
        Ok(created)
    }

    async fn update(&self, obj: &K) -> Result<K, WriteError> {
        let mut state = self.lock();
        let key = ManagedObjectRef::from_object(obj);
        let Some(current) = state.objects.get(&key) else {
            return Err(WriteError::NotFound(key.to_string()));
        };
        if resource_version(current) != obj.meta().resource_version.as_deref() {
            return Err(WriteError::Conflict(key.to_string()));
        }

        let mut updated = obj.clone();
        updated.meta_mut().resource_version = Some(state.next_resource_version());
        let value = serde_json::to_value(&updated).map_err(|e| WriteError::Kube(kube::Error::SerdeError(e)))?;
        state.objects.insert(key, value);
        state.updates += 1;
        Ok(updated)
    }
}
