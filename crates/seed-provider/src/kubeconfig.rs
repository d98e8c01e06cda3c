//! Clients for seed clusters.
//!
//! Each seed names a secret in the master cluster holding its kubeconfig.
//! [`SecretKubeconfigGetter`] reads that secret and builds a client for the
//! seed from it.

use crate::error::ProviderError;
use crate::seeds::Seed;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use tracing::debug;

/// A connected seed cluster.
#[derive(Clone)]
pub struct SeedConnection {
    /// Client for the seed's API server
    pub client: Client,
    /// URL of the seed's API server as reachable from the master
    pub cluster_url: String,
}

impl std::fmt::Debug for SeedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeedConnection")
            .field("cluster_url", &self.cluster_url)
            .finish_non_exhaustive()
    }
}

/// Builds clients for seeds.
#[async_trait]
pub trait SeedKubeconfigGetter: Send + Sync {
    /// Connect to `seed`
    async fn connect(&self, seed: &Seed) -> Result<SeedConnection, ProviderError>;
}

/// Reads seed kubeconfigs from secrets in the master cluster.
#[derive(Clone)]
pub struct SecretKubeconfigGetter {
    client: Client,
}

impl std::fmt::Debug for SecretKubeconfigGetter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretKubeconfigGetter").finish_non_exhaustive()
    }
}

impl SecretKubeconfigGetter {
    /// Create a getter reading secrets through the master `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SeedKubeconfigGetter for SecretKubeconfigGetter {
    async fn connect(&self, seed: &Seed) -> Result<SeedConnection, ProviderError> {
        let reference = &seed.kubeconfig;
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &reference.namespace);
        let secret = secrets
            .get_opt(&reference.name)
            .await?
            .ok_or_else(|| ProviderError::SecretNotFound {
                seed: seed.name.clone(),
                secret: format!("{}/{}", reference.namespace, reference.name),
            })?;

        let kubeconfig = kubeconfig_from_secret(seed, &secret)?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|source| ProviderError::Kubeconfig {
                seed: seed.name.clone(),
                source,
            })?;
        let cluster_url = config.cluster_url.to_string().trim_end_matches('/').to_string();
        let client = Client::try_from(config)?;

        debug!("Connected to seed {} at {}", seed.name, cluster_url);
        Ok(SeedConnection {
            client,
            cluster_url,
        })
    }
}

/// Extracts and parses the kubeconfig `seed` points at from `secret`.
pub fn kubeconfig_from_secret(seed: &Seed, secret: &Secret) -> Result<Kubeconfig, ProviderError> {
    let reference = &seed.kubeconfig;
    let missing_key = || ProviderError::MissingKey {
        seed: seed.name.clone(),
        secret: format!("{}/{}", reference.namespace, reference.name),
        key: reference.key.clone(),
    };

    let raw = secret
        .data
        .as_ref()
        .and_then(|data| data.get(&reference.key))
        .ok_or_else(missing_key)?;
    let yaml = std::str::from_utf8(&raw.0).map_err(|_not_utf8| missing_key())?;

    Kubeconfig::from_yaml(yaml).map_err(|source| ProviderError::Kubeconfig {
        seed: seed.name.clone(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: europe
clusters:
  - name: europe
    cluster:
      server: https://europe.seeds.example.com:6443
contexts:
  - name: europe
    context:
      cluster: europe
      user: admin
users:
  - name: admin
    user:
      token: abc
"#;

    fn secret(key: &str, value: &str) -> Secret {
        Secret {
            data: Some(BTreeMap::from([(
                key.to_string(),
                ByteString(value.as_bytes().to_vec()),
            )])),
            ..Default::default()
        }
    }

    #[test]
    fn test_kubeconfig_is_parsed_from_configured_key() {
        let seed = Seed::new("europe");

        let kubeconfig = kubeconfig_from_secret(&seed, &secret("kubeconfig", KUBECONFIG)).unwrap();

        assert_eq!(kubeconfig.current_context.as_deref(), Some("europe"));
        assert_eq!(kubeconfig.clusters.len(), 1);
    }

    #[test]
    fn test_missing_key_names_seed_and_secret() {
        let seed = Seed::new("europe");

        let err = kubeconfig_from_secret(&seed, &secret("config", KUBECONFIG)).unwrap_err();

        assert_eq!(
            err.to_string(),
            r#"Kubeconfig secret kubermatic/europe-kubeconfig of seed europe has no key "kubeconfig""#
        );
    }

    #[test]
    fn test_garbage_kubeconfig_is_rejected() {
        let seed = Seed::new("europe");

        let err = kubeconfig_from_secret(&seed, &secret("kubeconfig", "clusters: 42")).unwrap_err();

        assert!(matches!(err, ProviderError::Kubeconfig { ref seed, .. } if seed == "europe"));
    }

    #[tokio::test]
    async fn test_parsed_kubeconfig_yields_cluster_url() {
        let seed = Seed::new("europe");
        let kubeconfig = kubeconfig_from_secret(&seed, &secret("kubeconfig", KUBECONFIG)).unwrap();

        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .unwrap();

        assert!(config
            .cluster_url
            .to_string()
            .starts_with("https://europe.seeds.example.com:6443"));
    }
}
