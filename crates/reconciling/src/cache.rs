//! Read-through cache capability.
//!
//! The engine only ever reads existing state through [`ObjectCache`]. The
//! master cluster is served from a `kube-runtime` reflector store kept warm
//! by the controller's watches; remote clusters fall back to [`ApiReader`],
//! which reads straight from the API server.

use crate::error::CacheError;
use crate::object::ManagedObject;
use async_trait::async_trait;
use kube::api::Api;
use kube::Client;
use kube_runtime::reflector::{ObjectRef, Store};

/// Read access to the current state of objects of kind `K`.
#[async_trait]
pub trait ObjectCache<K>: Send + Sync {
    /// Returns the object `namespace/name`, or `None` if it does not exist.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, CacheError>;
}

#[async_trait]
impl<K> ObjectCache<K> for Store<K>
where
    K: ManagedObject,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, CacheError> {
        let key = ObjectRef::new(name).within(namespace);
        Ok(Store::get(self, &key).map(|obj| (*obj).clone()))
    }
}

/// Uncached reads against the API server.
#[derive(Clone)]
pub struct ApiReader {
    client: Client,
}

impl ApiReader {
    /// Creates a reader for the cluster behind `client`.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl std::fmt::Debug for ApiReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiReader").finish_non_exhaustive()
    }
}

#[async_trait]
impl<K> ObjectCache<K> for ApiReader
where
    K: ManagedObject,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, CacheError> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}
