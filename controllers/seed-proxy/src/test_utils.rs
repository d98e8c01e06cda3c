//! Test utilities for unit testing the reconciler
//!
//! In-memory seed clusters and a stand-in for the token controller.

use crate::reconciler::{SeedCluster, SeedConnector};
use crate::resources::{SEED_SERVICE_ACCOUNT_NAMESPACE, SEED_TOKEN_SECRET_NAME};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use reconciling::mock::FakeCluster;
use seed_provider::{ProviderError, Seed};
use std::collections::BTreeMap;

/// Seed clusters keyed by seed name. Clones share the same clusters.
#[derive(Debug, Clone, Default)]
pub struct FakeSeedClusters {
    clusters: BTreeMap<String, FakeCluster>,
}

impl FakeSeedClusters {
    /// One empty cluster per name in `seeds`
    pub fn new<'a>(seeds: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            clusters: seeds
                .into_iter()
                .map(|seed| (seed.to_string(), FakeCluster::new()))
                .collect(),
        }
    }

    /// The cluster of `seed`
    pub fn cluster(&self, seed: &str) -> Option<FakeCluster> {
        self.clusters.get(seed).cloned()
    }
}

#[async_trait]
impl SeedConnector for FakeSeedClusters {
    type Cache = FakeCluster;
    type Writer = FakeCluster;

    async fn connect(
        &self,
        seed: &Seed,
    ) -> Result<SeedCluster<FakeCluster, FakeCluster>, ProviderError> {
        let cluster = self
            .cluster(&seed.name)
            .ok_or_else(|| ProviderError::SecretNotFound {
                seed: seed.name.clone(),
                secret: format!("{}/{}", seed.kubeconfig.namespace, seed.kubeconfig.name),
            })?;

        Ok(SeedCluster {
            cache: cluster.clone(),
            writer: cluster,
            url: format!("https://{}.seeds.example.com:6443", seed.name),
        })
    }
}

/// Fills the service account token secret in `cluster` the way the
/// token controller does.
pub fn populate_token(cluster: &FakeCluster, token: &str) {
    let mut secret = cluster
        .object::<Secret>(SEED_SERVICE_ACCOUNT_NAMESPACE, SEED_TOKEN_SECRET_NAME)
        .unwrap_or_else(|| Secret {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                name: Some(SEED_TOKEN_SECRET_NAME.to_string()),
                namespace: Some(SEED_SERVICE_ACCOUNT_NAMESPACE.to_string()),
                ..Default::default()
            },
            ..Default::default()
        });
    secret.data = Some(BTreeMap::from([
        ("token".to_string(), ByteString(token.as_bytes().to_vec())),
        (
            "ca.crt".to_string(),
            ByteString(b"-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n".to_vec()),
        ),
        (
            "namespace".to_string(),
            ByteString(SEED_SERVICE_ACCOUNT_NAMESPACE.as_bytes().to_vec()),
        ),
    ]));
    cluster.insert(secret);
}
