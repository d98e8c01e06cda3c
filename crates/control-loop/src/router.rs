//! Fan-out routing of admitted events to reconcile targets.
//!
//! Routing is level-triggered: the event payload is ignored and every target
//! currently known to the registry gets a request. The registry is read again
//! for each event, so targets added or removed at runtime are picked up
//! without restarting the controller.

use crate::event::ObjectEvent;
use crate::request::ReconcileRequest;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error};

/// Source of the current set of reconcile targets.
#[async_trait]
pub trait TargetRegistry: Send + Sync {
    /// Names of all targets, in registry order
    async fn target_names(&self) -> anyhow::Result<Vec<String>>;
}

/// Maps one admitted event to one request per registered target.
#[derive(Clone)]
pub struct FanOutRouter {
    registry: Arc<dyn TargetRegistry>,
}

impl std::fmt::Debug for FanOutRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanOutRouter").finish_non_exhaustive()
    }
}

impl FanOutRouter {
    /// Create a router enumerating targets from `registry`
    pub fn new(registry: Arc<dyn TargetRegistry>) -> Self {
        Self { registry }
    }

    /// Requests to enqueue for `event`.
    ///
    /// Returns no requests if the registry cannot be read; the next admitted
    /// event triggers a fresh attempt.
    pub async fn requests_for<K: Send + Sync>(&self, event: &ObjectEvent<K>) -> Vec<ReconcileRequest> {
        match self.registry.target_names().await {
            Ok(names) => {
                debug!("Routing {} event to {} targets", event.type_name(), names.len());
                names.into_iter().map(ReconcileRequest::new).collect()
            }
            Err(e) => {
                error!("Failed to list reconcile targets: {:#}", e);
                Vec::new()
            }
        }
    }
}
