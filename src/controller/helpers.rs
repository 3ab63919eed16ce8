//! Shared helpers for controller modules.
//!
//! Object references, namespace metadata diffing and the small pieces of
//! bookkeeping every reconciler repeats. Pure quantity and label
//! vocabulary lives in `crate::helpers` instead.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Namespace, ObjectReference};
use kube::{Resource, ResourceExt};

/// Field manager name used for writes issued by the reconcilers.
pub const FIELD_MANAGER: &str = "ssvirt-reconciler";

/// Build an ObjectReference from any kube Resource.
pub fn kube_object_ref<K: Resource<DynamicType = ()>>(obj: &K) -> ObjectReference {
    ObjectReference {
        api_version: Some(K::api_version(&()).to_string()),
        kind: Some(K::kind(&()).to_string()),
        name: Some(obj.name_any()),
        namespace: obj.namespace(),
        uid: obj.meta().uid.clone(),
        resource_version: obj.meta().resource_version.clone(),
        ..Default::default()
    }
}

/// Keys in `desired` whose value on `current` differs or is missing,
/// as a merge-patch fragment.
pub fn missing_or_changed(
    current: Option<&BTreeMap<String, String>>,
    desired: &BTreeMap<String, String>,
) -> BTreeMap<String, Option<String>> {
    desired
        .iter()
        .filter(|(k, v)| current.and_then(|c| c.get(*k)) != Some(*v))
        .map(|(k, v)| (k.clone(), Some(v.clone())))
        .collect()
}

/// Merge-patch fragment removing whichever of `keys` are present.
pub fn present_keys_removed(
    current: Option<&BTreeMap<String, String>>,
    keys: &[&str],
) -> BTreeMap<String, Option<String>> {
    keys.iter()
        .filter(|k| current.is_some_and(|c| c.contains_key(**k)))
        .map(|k| (k.to_string(), None))
        .collect()
}

pub fn has_annotation(ns: &Namespace, key: &str) -> bool {
    ns.annotations().contains_key(key)
}
