//! Desired-state creators and the modifier chain.
//!
//! A creator turns the existing object (or the kind's zero value when the
//! object does not exist yet) into the full desired object. Modifiers wrap
//! creators to layer cross-cutting fields on top without the base creator
//! knowing about them.

use crate::object::{ManagedObject, ManagementMarker};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Produces the desired state of one object from its existing state.
///
/// Must be pure and deterministic: the same input always yields the same
/// output, and no I/O happens inside.
pub type ObjectCreator<K> = Arc<dyn Fn(K) -> anyhow::Result<K> + Send + Sync>;

/// Wraps a creator into another creator.
pub type ObjectModifier<K> = Arc<dyn Fn(ObjectCreator<K>) -> ObjectCreator<K> + Send + Sync>;

/// Boxes a closure as an [`ObjectCreator`].
pub fn creator<K, F>(create: F) -> ObjectCreator<K>
where
    F: Fn(K) -> anyhow::Result<K> + Send + Sync + 'static,
{
    Arc::new(create)
}

/// Builds a modifier that runs `mutate` on the output of the wrapped creator.
pub fn mutating<K, F>(mutate: F) -> ObjectModifier<K>
where
    K: 'static,
    F: Fn(&mut K) + Send + Sync + 'static,
{
    let mutate = Arc::new(mutate);
    Arc::new(move |inner: ObjectCreator<K>| {
        let mutate = Arc::clone(&mutate);
        let wrapped: ObjectCreator<K> = Arc::new(move |existing: K| {
            let mut obj = inner(existing)?;
            mutate(&mut obj);
            Ok(obj)
        });
        wrapped
    })
}

/// Wraps `create` with `modifiers` in declaration order.
///
/// The first modifier ends up innermost, so its mutation runs first and
/// every later modifier sees the state the earlier ones produced.
pub fn apply_modifiers<K>(create: ObjectCreator<K>, modifiers: &[ObjectModifier<K>]) -> ObjectCreator<K> {
    modifiers
        .iter()
        .fold(create, |create, modify| modify(create))
}

/// Stamps the management marker onto every desired object.
pub fn add_management_marker<K: ManagedObject>(marker: ManagementMarker) -> ObjectModifier<K> {
    mutating(move |obj: &mut K| marker.apply_to(obj))
}

/// Sets the given labels, leaving other labels untouched.
pub fn add_labels<K: ManagedObject>(labels: BTreeMap<String, String>) -> ObjectModifier<K> {
    mutating(move |obj: &mut K| {
        obj.labels_mut()
            .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
    })
}

/// Adds `owner` to the owner references, replacing an entry with the same uid.
pub fn add_owner_reference<K: ManagedObject>(owner: OwnerReference) -> ObjectModifier<K> {
    mutating(move |obj: &mut K| {
        let refs = obj.owner_references_mut();
        match refs.iter_mut().find(|r| r.uid == owner.uid) {
            Some(existing) => *existing = owner.clone(),
            None => refs.push(owner.clone()),
        }
    })
}
