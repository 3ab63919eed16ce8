//! Organization namespace reconciler.
//!
//! Same lifecycle as the VDC reconciler, minus quota and network policy:
//! organizations only carry a (legacy) namespace binding. Organizations
//! without one have nothing to converge.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::stream;
use kube::api::Api;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::Result;
use crate::helpers::{
    KIND_LABEL, KIND_ORGANIZATION, MANAGED_BY_LABEL, MANAGED_BY_VALUE, ORGANIZATION_ID_LABEL,
    ORGANIZATION_NAME_ANNOTATION,
};
use crate::store::Organization;

use super::namespace::{
    converge_metadata, ensure_absent, mark_disabled, namespace_object, owner_id_triggers,
    NamespaceMeta,
};
use super::runner::{self, RunnerConfig};
use super::Context;

pub const CONTROLLER: &str = "organization";

pub async fn run(client: Client, ctx: Arc<Context>, cancel: CancellationToken) {
    let watched = owner_id_triggers(
        Api::all(client),
        KIND_ORGANIZATION,
        ORGANIZATION_ID_LABEL,
        CONTROLLER,
        ctx.metrics.clone(),
    );
    let list_ctx = ctx.clone();
    let scanned = runner::periodic(
        CONTROLLER,
        ctx.settings.organization_poll_interval,
        ctx.metrics.clone(),
        move || {
            let ctx = list_ctx.clone();
            async move {
                let orgs = ctx.repos.organizations.list_organizations().await?;
                Ok(orgs.into_iter().map(|o| o.id).collect::<Vec<_>>())
            }
        },
    );

    let config = RunnerConfig {
        name: CONTROLLER,
        concurrency: ctx.settings.concurrency,
        retry_delay: ctx.settings.error_requeue_delay,
    };
    let metrics = ctx.metrics.clone();
    runner::run(
        config,
        stream::select(watched, scanned),
        metrics,
        cancel,
        move |id| {
            let ctx = ctx.clone();
            async move { reconcile_organization(&ctx, id).await }
        },
    )
    .await;
}

pub fn desired_namespace_meta(org: &Organization) -> NamespaceMeta {
    NamespaceMeta {
        labels: BTreeMap::from([
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
            (KIND_LABEL.to_string(), KIND_ORGANIZATION.to_string()),
            (ORGANIZATION_ID_LABEL.to_string(), org.id.to_string()),
        ]),
        annotations: BTreeMap::from([(
            ORGANIZATION_NAME_ANNOTATION.to_string(),
            org.name.clone(),
        )]),
    }
}

pub async fn reconcile_organization(ctx: &Context, id: Uuid) -> Result<()> {
    let Some(org) = ctx.repos.organizations.get_organization(id).await? else {
        debug!(organization = %id, "organization row not found");
        ctx.metrics.skipped_update(CONTROLLER, "not_found");
        return Ok(());
    };
    let Some(ns_name) = org.namespace.as_deref().filter(|ns| !ns.is_empty()) else {
        debug!(organization = %id, "organization has no namespace binding");
        ctx.metrics.skipped_update(CONTROLLER, "no_namespace");
        return Ok(());
    };

    if org.is_deleted() {
        ensure_absent(ctx, ns_name).await?;
        return Ok(());
    }
    if !org.enabled {
        mark_disabled(ctx, ns_name).await?;
        return Ok(());
    }

    let desired = desired_namespace_meta(&org);
    match ctx.cluster.get_namespace(ns_name).await? {
        Some(ns) => {
            converge_metadata(ctx, &ns, &desired).await?;
        }
        None => {
            ctx.cluster
                .create_namespace(&namespace_object(ns_name, &desired))
                .await?;
            info!(organization = %org.id, namespace = %ns_name, "created organization namespace");
        }
    }
    Ok(())
}
