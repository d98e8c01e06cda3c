//! Object lifecycle events as seen by filters and routers.

use std::sync::Arc;

/// A change to a watched object.
#[derive(Debug)]
pub enum ObjectEvent<K> {
    /// The object appeared
    Create(Arc<K>),
    /// The object changed from `old` to `new`
    Update {
        /// Last version held in the cache
        old: Arc<K>,
        /// Version reported by the watch
        new: Arc<K>,
    },
    /// The object was deleted
    Delete(Arc<K>),
    /// A change that is neither of the above (e.g. an externally triggered resync)
    Generic(Arc<K>),
}

impl<K> Clone for ObjectEvent<K> {
    fn clone(&self) -> Self {
        match self {
            Self::Create(obj) => Self::Create(Arc::clone(obj)),
            Self::Update { old, new } => Self::Update {
                old: Arc::clone(old),
                new: Arc::clone(new),
            },
            Self::Delete(obj) => Self::Delete(Arc::clone(obj)),
            Self::Generic(obj) => Self::Generic(Arc::clone(obj)),
        }
    }
}

impl<K> ObjectEvent<K> {
    /// Short lowercase name of the event type, used as a metric label.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Create(_) => "create",
            Self::Update { .. } => "update",
            Self::Delete(_) => "delete",
            Self::Generic(_) => "generic",
        }
    }

    /// The most recent version of the object the event refers to.
    pub fn object(&self) -> &K {
        match self {
            Self::Create(obj) | Self::Delete(obj) | Self::Generic(obj) => obj,
            Self::Update { new, .. } => new,
        }
    }
}
