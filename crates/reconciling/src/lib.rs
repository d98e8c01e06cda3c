//! Generic desired-state reconciliation of Kubernetes objects
//!
//! A caller describes each object it owns with a pure creator function. The
//! engine reads the current object through an [`ObjectCache`], runs the
//! creator on it and writes through an [`ObjectWriter`] only when the result
//! differs. Objects that do not carry the caller's [`ManagementMarker`] are
//! never modified.
//!
//! # Example
//!
//! ```no_run
//! use k8s_openapi::api::core::v1::Service;
//! use kube::Client;
//! use reconciling::{
//!     add_management_marker, creator, reconcile_objects, ApiReader, KubeWriter, ManagementMarker,
//! };
//!
//! # async fn example(client: Client) -> Result<(), Box<dyn std::error::Error>> {
//! let marker = ManagementMarker::managed_by("seed-proxy-controller");
//! let service = creator(|mut svc: Service| {
//!     svc.metadata.name = Some("proxy".to_string());
//!     Ok(svc)
//! });
//!
//! reconcile_objects(
//!     &[service],
//!     "kubermatic",
//!     &ApiReader::new(client.clone()),
//!     &KubeWriter::new(client, "seed-proxy-controller"),
//!     &marker,
//!     &[add_management_marker(marker.clone())],
//! )
//! .await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - `test-util`: exposes [`mock::FakeCluster`], an in-memory cluster

pub mod cache;
pub mod client;
pub mod creator;
pub mod ensure;
pub mod error;
pub mod object;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use cache::{ApiReader, ObjectCache};
pub use client::{KubeWriter, ObjectWriter};
pub use creator::{
    add_labels, add_management_marker, add_owner_reference, apply_modifiers, creator, mutating,
    ObjectCreator, ObjectModifier,
};
pub use ensure::{ensure_object, reconcile_objects, EnsureOutcome};
pub use error::{CacheError, ReconcileError, WriteError};
pub use object::{ManagedObject, ManagedObjectRef, ManagementMarker, MANAGED_BY_LABEL};
