//! Namespace lifecycle steps shared by the VDC and Organization reconcilers.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::{future, Stream, StreamExt};
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, ObjectMeta};
use kube::runtime::{watcher, WatchStreamExt};
use kube::ResourceExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::helpers::{
    managed_namespace_selector, DISABLED_ANNOTATION, KIND_LABEL, ORPHANED_AT_ANNOTATION,
};
use crate::metrics::Metrics;

use super::helpers::{has_annotation, missing_or_changed, present_keys_removed};
use super::Context;

/// Labels and annotations a managed namespace must carry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NamespaceMeta {
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

pub fn namespace_object(name: &str, meta: &NamespaceMeta) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(meta.labels.clone()),
            annotations: Some(meta.annotations.clone()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Delete the namespace if it exists. Returns whether a delete was issued.
pub async fn ensure_absent(ctx: &Context, name: &str) -> Result<bool> {
    if ctx.cluster.get_namespace(name).await?.is_none() {
        debug!(namespace = %name, "namespace already absent");
        return Ok(false);
    }
    ctx.cluster.delete_namespace(name).await?;
    info!(namespace = %name, "deleted namespace");
    Ok(true)
}

/// Annotate an existing namespace as disabled. A missing namespace is left
/// missing. Returns whether a patch was issued.
pub async fn mark_disabled(ctx: &Context, name: &str) -> Result<bool> {
    let Some(ns) = ctx.cluster.get_namespace(name).await? else {
        debug!(namespace = %name, "disabled owner has no namespace");
        return Ok(false);
    };
    if has_annotation(&ns, DISABLED_ANNOTATION) {
        return Ok(false);
    }
    let annotations = BTreeMap::from([(
        DISABLED_ANNOTATION.to_string(),
        Some("true".to_string()),
    )]);
    ctx.cluster
        .patch_namespace_metadata(name, &BTreeMap::new(), &annotations)
        .await?;
    info!(namespace = %name, "namespace annotated disabled");
    Ok(true)
}

/// Bring labels and annotations to `desired` and drop the disabled and
/// orphaned markers. Returns whether a patch was issued.
pub async fn converge_metadata(
    ctx: &Context,
    ns: &Namespace,
    desired: &NamespaceMeta,
) -> Result<bool> {
    let labels = missing_or_changed(ns.metadata.labels.as_ref(), &desired.labels);
    let mut annotations =
        missing_or_changed(ns.metadata.annotations.as_ref(), &desired.annotations);
    annotations.extend(present_keys_removed(
        ns.metadata.annotations.as_ref(),
        &[DISABLED_ANNOTATION, ORPHANED_AT_ANNOTATION],
    ));
    if labels.is_empty() && annotations.is_empty() {
        return Ok(false);
    }
    let name = ns.name_any();
    ctx.cluster
        .patch_namespace_metadata(&name, &labels, &annotations)
        .await?;
    info!(
        namespace = %name,
        labels = labels.len(),
        annotations = annotations.len(),
        "namespace metadata converged"
    );
    Ok(true)
}

/// Row identities of owners whose managed namespace of `kind` changed,
/// read from the `id_label` label. Namespaces with a missing or unparsable
/// identity are ignored; watch errors are counted and the watch resumes
/// with backoff.
pub fn owner_id_triggers(
    namespaces: Api<Namespace>,
    kind: &str,
    id_label: &'static str,
    controller: &'static str,
    metrics: Arc<dyn Metrics>,
) -> impl Stream<Item = Uuid> + Send {
    let selector = format!("{},{KIND_LABEL}={kind}", managed_namespace_selector());
    watcher(namespaces, watcher::Config::default().labels(&selector))
        .default_backoff()
        .touched_objects()
        .filter_map(move |res| {
            future::ready(match res {
                Ok(ns) => ns.labels().get(id_label).and_then(|v| Uuid::parse_str(v).ok()),
                Err(e) => {
                    warn!(controller, %e, "namespace watch error");
                    metrics.reconcile_error(controller, "kubernetes");
                    None
                }
            })
        })
}
