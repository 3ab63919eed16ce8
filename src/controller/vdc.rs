//! VDC namespace / quota / isolation reconciler.
//!
//! Each VDC row owns exactly one namespace. Depending on the row's
//! lifecycle the namespace is removed, annotated disabled, or created and
//! kept converged together with its ResourceQuota. The default-deny
//! NetworkPolicy is written when the namespace is first created; a
//! namespace keeps the isolation-pending marker until that write succeeds,
//! so an interrupted creation is finished on a later pass.
//! Managed namespaces no VDC row claims are annotated as orphaned.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::stream;
use k8s_openapi::api::core::v1::{ResourceQuota, ResourceQuotaSpec};
use k8s_openapi::api::networking::v1::{
    NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyPort, NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, ObjectMeta};
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::helpers::{
    quantity_maps_equal, utc_now_rfc3339, ISOLATION_PENDING_ANNOTATION, KIND_LABEL,
    KIND_ORGANIZATION, KIND_VDC, MANAGED_BY_LABEL, MANAGED_BY_VALUE, ORGANIZATION_ID_LABEL, ORPHANED_AT_ANNOTATION,
    VDC_ID_LABEL, VDC_NAME_ANNOTATION,
};
use crate::store::Vdc;

use super::helpers::has_annotation;
use super::namespace::{
    converge_metadata, ensure_absent, mark_disabled, namespace_object, owner_id_triggers,
    NamespaceMeta,
};
use super::runner::{self, RunnerConfig};
use super::Context;

pub const CONTROLLER: &str = "vdc";
pub const QUOTA_NAME: &str = "vdc-quota";
pub const NETWORK_POLICY_NAME: &str = "vdc-default-deny";

// ── Controller entry point ────────────────────────────────────────────────────

/// Run the VDC reconciler and the orphan scan until `cancel` fires.
pub async fn run(client: Client, ctx: Arc<Context>, cancel: CancellationToken) {
    let watched = owner_id_triggers(
        Api::all(client),
        KIND_VDC,
        VDC_ID_LABEL,
        CONTROLLER,
        ctx.metrics.clone(),
    );
    let list_ctx = ctx.clone();
    let scanned = runner::periodic(
        CONTROLLER,
        ctx.settings.vdc_poll_interval,
        ctx.metrics.clone(),
        move || {
            let ctx = list_ctx.clone();
            async move {
                let vdcs = ctx.repos.vdcs.list_vdcs().await?;
                Ok(vdcs.into_iter().map(|v| v.id).collect::<Vec<_>>())
            }
        },
    );

    let config = RunnerConfig {
        name: CONTROLLER,
        concurrency: ctx.settings.concurrency,
        retry_delay: ctx.settings.error_requeue_delay,
    };
    let reconcile_ctx = ctx.clone();
    let reconciler = runner::run(
        config,
        stream::select(watched, scanned),
        ctx.metrics.clone(),
        cancel.clone(),
        move |id| {
            let ctx = reconcile_ctx.clone();
            async move { reconcile_vdc(&ctx, id).await }
        },
    );
    tokio::join!(reconciler, run_orphan_scan(ctx, cancel));
}

async fn run_orphan_scan(ctx: Arc<Context>, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(ctx.settings.vdc_poll_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                match flag_orphaned_namespaces(&ctx).await {
                    Ok(0) => {}
                    Ok(n) => info!(flagged = n, "flagged orphaned namespaces"),
                    Err(e) => {
                        warn!(%e, "orphan scan failed");
                        ctx.metrics.reconcile_error(CONTROLLER, e.category());
                    }
                }
            }
        }
    }
    debug!("orphan scan stopped");
}

// ── Desired state ─────────────────────────────────────────────────────────────

pub fn desired_namespace_meta(vdc: &Vdc) -> NamespaceMeta {
    NamespaceMeta {
        labels: BTreeMap::from([
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
            (KIND_LABEL.to_string(), KIND_VDC.to_string()),
            (VDC_ID_LABEL.to_string(), vdc.id.to_string()),
            (
                ORGANIZATION_ID_LABEL.to_string(),
                vdc.organization_id.to_string(),
            ),
        ]),
        annotations: BTreeMap::from([(VDC_NAME_ANNOTATION.to_string(), vdc.name.clone())]),
    }
}

/// Quota hard limits for the VDC. Unlimited (nil or non-positive)
/// dimensions are left out.
pub fn desired_quota_hard(vdc: &Vdc) -> BTreeMap<String, String> {
    let limited = |v: Option<i64>| v.filter(|n| *n > 0);
    let mut hard = BTreeMap::new();
    if let Some(cpu) = limited(vdc.cpu_limit) {
        hard.insert("limits.cpu".to_string(), cpu.to_string());
    }
    if let Some(mem) = limited(vdc.memory_limit_mb) {
        hard.insert("limits.memory".to_string(), format!("{mem}Mi"));
    }
    if let Some(storage) = limited(vdc.storage_limit_gb) {
        hard.insert("requests.storage".to_string(), format!("{storage}Gi"));
    }
    hard
}

fn to_quantities(hard: &BTreeMap<String, String>) -> BTreeMap<String, Quantity> {
    hard.iter()
        .map(|(k, v)| (k.clone(), Quantity(v.clone())))
        .collect()
}

pub fn quota_object(hard: &BTreeMap<String, String>) -> ResourceQuota {
    ResourceQuota {
        metadata: ObjectMeta {
            name: Some(QUOTA_NAME.to_string()),
            labels: Some(BTreeMap::from([(
                MANAGED_BY_LABEL.to_string(),
                MANAGED_BY_VALUE.to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(ResourceQuotaSpec {
            hard: Some(to_quantities(hard)),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Deny all ingress and egress for every pod except DNS lookups.
pub fn default_deny_policy() -> NetworkPolicy {
    let dns = |protocol: &str| NetworkPolicyPort {
        port: Some(IntOrString::Int(53)),
        protocol: Some(protocol.to_string()),
        ..Default::default()
    };
    NetworkPolicy {
        metadata: ObjectMeta {
            name: Some(NETWORK_POLICY_NAME.to_string()),
            labels: Some(BTreeMap::from([(
                MANAGED_BY_LABEL.to_string(),
                MANAGED_BY_VALUE.to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(NetworkPolicySpec {
            policy_types: Some(vec!["Ingress".to_string(), "Egress".to_string()]),
            ingress: None,
            egress: Some(vec![NetworkPolicyEgressRule {
                ports: Some(vec![dns("UDP"), dns("TCP")]),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

// ── Reconcile ─────────────────────────────────────────────────────────────────

/// One convergence pass for the VDC with identity `id`.
pub async fn reconcile_vdc(ctx: &Context, id: Uuid) -> Result<()> {
    let Some(vdc) = ctx.repos.vdcs.get_vdc(id).await? else {
        debug!(vdc = %id, "VDC row not found");
        ctx.metrics.skipped_update(CONTROLLER, "not_found");
        return Ok(());
    };

    if vdc.is_deleted() {
        if let Some(ns) = vdc.namespace_name() {
            ensure_absent(ctx, ns).await?;
        }
        return Ok(());
    }

    if !vdc.enabled {
        if let Some(ns) = vdc.namespace_name() {
            mark_disabled(ctx, ns).await?;
        }
        return Ok(());
    }

    let Some(ns_name) = vdc.namespace_name() else {
        return Err(Error::malformed(format!(
            "VDC {} is enabled but has no namespace",
            vdc.id
        )));
    };

    let desired = desired_namespace_meta(&vdc);
    let hard = desired_quota_hard(&vdc);
    match ctx.cluster.get_namespace(ns_name).await? {
        None => create_namespace(ctx, &vdc, ns_name, &desired, &hard).await,
        Some(ns) => {
            converge_metadata(ctx, &ns, &desired).await?;
            converge_quota(ctx, ns_name, &hard).await?;
            if has_annotation(&ns, ISOLATION_PENDING_ANNOTATION) {
                complete_isolation(ctx, ns_name).await?;
            }
            Ok(())
        }
    }
}

async fn create_namespace(
    ctx: &Context,
    vdc: &Vdc,
    ns_name: &str,
    desired: &NamespaceMeta,
    hard: &BTreeMap<String, String>,
) -> Result<()> {
    let mut ns = namespace_object(ns_name, desired);
    ns.annotations_mut()
        .insert(ISOLATION_PENDING_ANNOTATION.to_string(), "true".to_string());
    ctx.cluster.create_namespace(&ns).await?;
    ctx.cluster
        .create_resource_quota(ns_name, &quota_object(hard))
        .await?;
    complete_isolation(ctx, ns_name).await?;
    info!(vdc = %vdc.id, namespace = %ns_name, "created VDC namespace");
    Ok(())
}

/// Write the default-deny policy, then drop the isolation-pending marker.
async fn complete_isolation(ctx: &Context, ns_name: &str) -> Result<()> {
    ctx.cluster
        .create_network_policy(ns_name, &default_deny_policy())
        .await?;
    let annotations = BTreeMap::from([(ISOLATION_PENDING_ANNOTATION.to_string(), None)]);
    ctx.cluster
        .patch_namespace_metadata(ns_name, &BTreeMap::new(), &annotations)
        .await?;
    debug!(namespace = %ns_name, "namespace isolated");
    Ok(())
}

/// Bring the quota's hard limits to `desired` with at most one write.
/// Returns whether anything was written.
pub async fn converge_quota(
    ctx: &Context,
    ns_name: &str,
    desired: &BTreeMap<String, String>,
) -> Result<bool> {
    let Some(quota) = ctx.cluster.get_resource_quota(ns_name, QUOTA_NAME).await? else {
        ctx.cluster
            .create_resource_quota(ns_name, &quota_object(desired))
            .await?;
        info!(namespace = %ns_name, "recreated missing quota");
        return Ok(true);
    };

    let current: BTreeMap<String, String> = quota
        .spec
        .and_then(|s| s.hard)
        .unwrap_or_default()
        .into_iter()
        .map(|(k, q)| (k, q.0))
        .collect();
    if quantity_maps_equal(&current, desired) {
        return Ok(false);
    }
    ctx.cluster
        .replace_resource_quota_hard(ns_name, QUOTA_NAME, &to_quantities(desired))
        .await?;
    info!(namespace = %ns_name, ?desired, "quota limits updated");
    Ok(true)
}

/// Annotate managed VDC namespaces that no VDC row names. Soft-deleted rows
/// still count as claims. Returns how many namespaces were newly flagged.
pub async fn flag_orphaned_namespaces(ctx: &Context) -> Result<usize> {
    let claimed: Vec<String> = ctx
        .repos
        .vdcs
        .list_vdcs()
        .await?
        .iter()
        .filter_map(|v| v.namespace_name().map(str::to_string))
        .collect();

    let mut flagged = 0;
    for ns in ctx.cluster.list_managed_namespaces().await? {
        let name = ns.name_any();
        if ns.labels().get(KIND_LABEL).map(String::as_str) == Some(KIND_ORGANIZATION)
            || claimed.contains(&name)
            || ns.annotations().contains_key(ORPHANED_AT_ANNOTATION)
        {
            continue;
        }
        let annotations =
            BTreeMap::from([(ORPHANED_AT_ANNOTATION.to_string(), Some(utc_now_rfc3339()))]);
        ctx.cluster
            .patch_namespace_metadata(&name, &BTreeMap::new(), &annotations)
            .await?;
        warn!(namespace = %name, "managed namespace has no VDC, flagged orphaned");
        flagged += 1;
    }
    Ok(flagged)
}
