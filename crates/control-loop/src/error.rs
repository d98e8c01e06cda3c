//! Control loop error types.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while starting or running a controller.
#[derive(Debug, Error)]
pub enum ControlLoopError {
    /// A reflector store can never become ready
    #[error("Cache for {kind} cannot sync: its watch was dropped")]
    CacheSync {
        /// Kind whose store was abandoned
        kind: String,
    },

    /// Caches did not sync in time
    #[error("Caches did not sync within {timeout:?}")]
    CacheSyncTimeout {
        /// Configured sync timeout
        timeout: Duration,
    },

    /// Invalid controller options
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
