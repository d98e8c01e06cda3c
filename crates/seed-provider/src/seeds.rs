//! Seed registry.
//!
//! A seed is a remote cluster hosting user cluster control planes. The
//! registry is read on demand: callers get the current set of seeds on
//! every call and must not keep it around.

use crate::error::ProviderError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Namespace of kubeconfig secrets when the seed entry does not name one
pub const DEFAULT_KUBECONFIG_NAMESPACE: &str = "kubermatic";

/// Key of the kubeconfig inside its secret when the seed entry does not name one
pub const DEFAULT_KUBECONFIG_KEY: &str = "kubeconfig";

/// A seed cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Seed {
    /// Seed name, taken from its key in the registry
    #[serde(default)]
    pub name: String,
    /// Secret holding the kubeconfig of the seed cluster
    pub kubeconfig: SecretKeyRef,
    /// Free-form location, e.g. "Frankfurt"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// Reference to one key of a secret in the master cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    /// Secret name
    pub name: String,
    /// Secret namespace
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Key inside the secret data
    #[serde(default = "default_key")]
    pub key: String,
}

fn default_namespace() -> String {
    DEFAULT_KUBECONFIG_NAMESPACE.to_string()
}

fn default_key() -> String {
    DEFAULT_KUBECONFIG_KEY.to_string()
}

/// Source of the current seeds, keyed by name.
#[async_trait]
pub trait SeedsGetter: Send + Sync {
    /// All seeds known right now
    async fn seeds(&self) -> Result<BTreeMap<String, Seed>, ProviderError>;
}

/// Seeds listed in a YAML file, re-read on every call.
///
/// ```yaml
/// seeds:
///   europe-west:
///     location: Frankfurt
///     kubeconfig:
///       name: europe-west-kubeconfig
/// ```
#[derive(Debug, Clone)]
pub struct FileSeedsGetter {
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct SeedsFile {
    #[serde(default)]
    seeds: BTreeMap<String, Seed>,
}

impl FileSeedsGetter {
    /// Create a getter reading `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the seeds file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SeedsGetter for FileSeedsGetter {
    async fn seeds(&self) -> Result<BTreeMap<String, Seed>, ProviderError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| ProviderError::Io {
                path: self.path.clone(),
                source,
            })?;
        let seeds = parse_seeds(&content).map_err(|source| ProviderError::Parse {
            path: self.path.clone(),
            source,
        })?;
        let seeds = named_seeds(seeds)?;
        debug!("Read {} seeds from {}", seeds.len(), self.path.display());
        Ok(seeds)
    }
}

fn parse_seeds(content: &str) -> Result<BTreeMap<String, Seed>, serde_yaml::Error> {
    // An empty file is an empty registry
    if content.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    serde_yaml::from_str::<SeedsFile>(content).map(|file| file.seeds)
}

/// Fills each seed's name from its key and validates it.
fn named_seeds(seeds: BTreeMap<String, Seed>) -> Result<BTreeMap<String, Seed>, ProviderError> {
    seeds
        .into_iter()
        .map(|(name, mut seed)| {
            validate_seed_name(&name)?;
            seed.name.clone_from(&name);
            Ok((name, seed))
        })
        .collect()
}

/// Seed names end up in object names and label values, so they must be
/// valid DNS-1123 labels.
fn validate_seed_name(name: &str) -> Result<(), ProviderError> {
    let invalid = |reason: &str| ProviderError::InvalidSeed {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.len() > 63 {
        return Err(invalid("name is longer than 63 characters"));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return Err(invalid("name may only contain lowercase letters, digits and '-'"));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(invalid("name must start and end with a letter or digit"));
    }
    Ok(())
}

/// Seeds held in memory. Clones share the same seeds.
#[derive(Debug, Clone, Default)]
pub struct StaticSeedsGetter {
    seeds: Arc<RwLock<BTreeMap<String, Seed>>>,
}

impl StaticSeedsGetter {
    /// Create a getter serving `seeds`
    pub fn new(seeds: impl IntoIterator<Item = Seed>) -> Self {
        let getter = Self::default();
        for seed in seeds {
            getter.insert(seed);
        }
        getter
    }

    /// Add or replace a seed
    pub fn insert(&self, seed: Seed) {
        self.seeds
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(seed.name.clone(), seed);
    }

    /// Remove a seed
    pub fn remove(&self, name: &str) -> Option<Seed> {
        self.seeds
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }
}

#[async_trait]
impl SeedsGetter for StaticSeedsGetter {
    async fn seeds(&self) -> Result<BTreeMap<String, Seed>, ProviderError> {
        Ok(self
            .seeds
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

impl Seed {
    /// Seed whose kubeconfig lives in secret `<name>-kubeconfig` in the default namespace
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            kubeconfig: SecretKeyRef {
                name: format!("{name}-kubeconfig"),
                namespace: default_namespace(),
                key: default_key(),
            },
            name,
            location: None,
        }
    }
}
