//! Controller-specific error types.
//!
//! Errors of the seed-proxy controller that are not covered by the library
//! crates it is built on.

use control_loop::ControlLoopError;
use kube::Error as KubeError;
use reconciling::ReconcileError;
use seed_provider::ProviderError;
use thiserror::Error;

/// Errors that can occur in the seed-proxy controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// An object could not be brought to its desired state
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    /// Seed registry or seed connection error
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Watch, queue or worker setup error
    #[error(transparent)]
    ControlLoop(#[from] ControlLoopError),

    /// Metric registration error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Serving the probes endpoint failed
    #[error("Probes server error: {0}")]
    Io(#[from] std::io::Error),

    /// The token controller has not filled in the service account token yet
    #[error("Token secret {secret} in seed {seed} is not populated yet")]
    TokenNotReady {
        /// Seed the token belongs to
        seed: String,
        /// Token secret as `namespace/name`
        secret: String,
    },

    /// A generated configuration document could not be serialized
    #[error("Failed to render {what}: {source}")]
    Render {
        /// Document being rendered
        what: &'static str,
        /// Underlying YAML error
        #[source]
        source: serde_yaml::Error,
    },
}
