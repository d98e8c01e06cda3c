//! Event filters.
//!
//! Watches see every object of a kind in the cluster. Filters cut that
//! stream down to the events concerning objects this controller manages.

use crate::event::ObjectEvent;
use kube::Resource;
use reconciling::ManagementMarker;

/// Predicate deciding whether an event is relevant.
pub trait EventFilter<K>: Send + Sync {
    /// Returns true if `event` should be routed to reconcile targets
    fn admit(&self, event: &ObjectEvent<K>) -> bool;
}

/// Admits events for objects carrying a management marker.
///
/// Updates are admitted when either version carries the marker, so removing
/// the marker from an object still triggers a reconcile that restores it.
#[derive(Debug, Clone)]
pub struct ManagedByFilter {
    marker: ManagementMarker,
}

impl ManagedByFilter {
    /// Create a filter for `marker`
    pub fn new(marker: ManagementMarker) -> Self {
        Self { marker }
    }
}

impl<K: Resource> EventFilter<K> for ManagedByFilter {
    fn admit(&self, event: &ObjectEvent<K>) -> bool {
        match event {
            ObjectEvent::Create(obj) | ObjectEvent::Delete(obj) | ObjectEvent::Generic(obj) => {
                self.marker.is_carried_by(obj.as_ref())
            }
            ObjectEvent::Update { old, new } => {
                self.marker.is_carried_by(old.as_ref()) || self.marker.is_carried_by(new.as_ref())
            }
        }
    }
}
