//! Reconciliation errors

use crate::object::ManagedObjectRef;
use thiserror::Error;

/// Errors returned by the write path of a cluster.
#[derive(Debug, Error)]
pub enum WriteError {
    /// Create raced with another writer that created the same name
    #[error("object already exists: {0}")]
    AlreadyExists(String),

    /// Update carried a stale resource version
    #[error("optimistic concurrency conflict: {0}")]
    Conflict(String),

    /// Update target vanished between cache read and write
    #[error("object not found: {0}")]
    NotFound(String),

    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),
}

/// Errors returned when reading the object cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Live read against the API server failed
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Cache cannot serve reads (e.g. not synced)
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

/// Errors that can occur while ensuring an object.
///
/// Every variant names the kind or the object it concerns.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The creator itself failed
    #[error("creator for {} failed: {source}", subject(.kind, .object))]
    Creator {
        /// Kind the creator builds
        kind: String,
        /// Object the creator ran on, unknown while discovering the name
        object: Option<ManagedObjectRef>,
        /// Error returned by the creator
        #[source]
        source: anyhow::Error,
    },

    /// The creator returned an object without a name
    #[error("creator for {} returned an object without a name", subject(.kind, .object))]
    MissingName {
        /// Kind the creator builds
        kind: String,
        /// Object the creator ran on, unknown while discovering the name
        object: Option<ManagedObjectRef>,
    },

    /// The desired object does not carry the management marker
    #[error("desired {object} does not carry the management marker {marker}")]
    MissingMarker {
        /// Object the creator produced
        object: ManagedObjectRef,
        /// Marker the object should carry
        marker: String,
    },

    /// The existing object belongs to someone else
    #[error("{object} exists but is not managed by {marker}, refusing to modify it")]
    NotManaged {
        /// Existing object lacking the marker
        object: ManagedObjectRef,
        /// Marker of this controller
        marker: String,
    },

    /// Reading the cache failed
    #[error("failed to read {object} from cache: {source}")]
    Cache {
        /// Object being looked up
        object: ManagedObjectRef,
        /// Underlying cache error
        #[source]
        source: CacheError,
    },

    /// Creating the object failed
    #[error("failed to create {object}: {source}")]
    Create {
        /// Object being created
        object: ManagedObjectRef,
        /// Underlying write error
        #[source]
        source: WriteError,
    },

    /// Updating the object failed
    #[error("failed to update {object}: {source}")]
    Update {
        /// Object being updated
        object: ManagedObjectRef,
        /// Underlying write error
        #[source]
        source: WriteError,
    },
}

fn subject(kind: &str, object: &Option<ManagedObjectRef>) -> String {
    match object {
        Some(object) => object.to_string(),
        None => kind.to_string(),
    }
}

impl ReconcileError {
    /// Returns true for defects in the desired state or ownership.
    ///
    /// These fail the same way on every retry until the caller is fixed.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::Creator { .. }
                | Self::MissingName { .. }
                | Self::MissingMarker { .. }
                | Self::NotManaged { .. }
        )
    }
}
