//! Seed provider error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while listing seeds or connecting to them.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The seeds file could not be read
    #[error("Failed to read seeds file {path}: {source}")]
    Io {
        /// Seeds file that was read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The seeds file is not valid YAML of the expected shape
    #[error("Failed to parse seeds file {path}: {source}")]
    Parse {
        /// Seeds file that was parsed
        path: PathBuf,
        /// Underlying YAML error
        #[source]
        source: serde_yaml::Error,
    },

    /// A seed entry cannot be used
    #[error("Invalid seed {name:?}: {reason}")]
    InvalidSeed {
        /// Seed name as written in the seeds file
        name: String,
        /// Why the seed was rejected
        reason: String,
    },

    /// The secret holding the seed kubeconfig does not exist
    #[error("Kubeconfig secret {secret} of seed {seed} not found")]
    SecretNotFound {
        /// Seed whose kubeconfig was requested
        seed: String,
        /// Secret reference as `namespace/name`
        secret: String,
    },

    /// The kubeconfig secret lacks the configured key
    #[error("Kubeconfig secret {secret} of seed {seed} has no key {key:?}")]
    MissingKey {
        /// Seed whose kubeconfig was requested
        seed: String,
        /// Secret reference as `namespace/name`
        secret: String,
        /// Data key expected to hold the kubeconfig
        key: String,
    },

    /// The kubeconfig could not be turned into a client configuration
    #[error("Invalid kubeconfig for seed {seed}: {source}")]
    Kubeconfig {
        /// Seed whose kubeconfig was rejected
        seed: String,
        /// Underlying kubeconfig error
        #[source]
        source: kube::config::KubeconfigError,
    },

    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),
}
