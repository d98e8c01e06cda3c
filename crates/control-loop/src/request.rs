//! Reconcile requests

use std::fmt;

/// Request to re-evaluate one reconcile target.
///
/// Carries only the target identity. Requests for the same target are
/// collapsed by the work queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReconcileRequest {
    /// Name of the target (e.g. a seed cluster)
    pub target: String,
}

impl ReconcileRequest {
    /// Create a request for `target`
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

impl fmt::Display for ReconcileRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.target)
    }
}
