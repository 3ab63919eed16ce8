//! vApp status controller.
//!
//! Driven by TemplateInstance changes, and by changes to any VM carrying a
//! vapp-name label (mapped to the TemplateInstance of that name in the same
//! namespace). Each pass re-evaluates the vApp from the instance conditions
//! and the stored statuses of its VMs and persists the result when it is a
//! permitted transition. A vanished TemplateInstance moves the vApp to
//! DELETED.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use kube::{
    api::Api,
    runtime::{
        controller::{self, Action, Controller},
        reflector::ObjectRef,
        watcher::Config as WatcherConfig,
    },
    Client, ResourceExt,
};
use tracing::{debug, info, warn};

use crate::cluster::ClusterEvent;
use crate::crd::template_instance::TemplateInstance;
use crate::crd::virtual_machine::VirtualMachine;
use crate::error::{Error, Result};
use crate::helpers::VAPP_NAME_LABEL;
use crate::metrics::Outcome;
use crate::store::{VApp, VAppStatus};

use super::helpers::kube_object_ref;
use super::vapp_evaluator::{evaluate_vapp_status, is_allowed, VAppSignals};
use super::Context;

pub const CONTROLLER: &str = "vapp_status";

pub async fn run(client: Client, ctx: Arc<Context>) {
    let instances: Api<TemplateInstance> = Api::all(client.clone());
    let vms: Api<VirtualMachine> = Api::all(client);
    let config = controller::Config::default().concurrency(ctx.settings.kube_concurrency());

    info!("starting vApp status controller");
    ctx.metrics.controller_health(CONTROLLER, true);
    let deletion_ctx = ctx.clone();
    Controller::new(instances, WatcherConfig::default())
        .watches(vms, WatcherConfig::default(), map_vm_to_template_instance)
        .with_config(config)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx.clone())
        .for_each(move |res| {
            let ctx = deletion_ctx.clone();
            async move {
                match res {
                    Ok((obj, _action)) => debug!(%obj, "vApp reconciled"),
                    Err(controller::Error::ObjectNotFound(obj)) => {
                        let ns = obj.namespace.clone().unwrap_or_default();
                        if let Err(e) = handle_template_instance_deleted(&ctx, &ns, &obj.name).await
                        {
                            warn!(%ns, name = %obj.name, %e, "failed to record vApp deletion");
                            ctx.metrics.reconcile_error(CONTROLLER, e.category());
                        }
                    }
                    Err(e) => warn!("vApp reconcile failed: {e:?}"),
                }
            }
        })
        .await;
    ctx.metrics.controller_health(CONTROLLER, false);
}

/// VM → TemplateInstance named by its vapp-name label.
fn map_vm_to_template_instance(vm: VirtualMachine) -> Option<ObjectRef<TemplateInstance>> {
    let ns = vm.namespace()?;
    vm.labels()
        .get(VAPP_NAME_LABEL)
        .filter(|v| !v.is_empty())
        .map(|name| ObjectRef::new(name).within(&ns))
}

async fn reconcile(ti: Arc<TemplateInstance>, ctx: Arc<Context>) -> Result<Action> {
    reconcile_vapp(&ctx, &ti).await?;
    Ok(Action::requeue(ctx.settings.vapp_resync_interval))
}

fn error_policy(ti: Arc<TemplateInstance>, error: &Error, ctx: Arc<Context>) -> Action {
    ctx.metrics.reconcile_error(CONTROLLER, error.category());
    warn!(
        ns = %ti.namespace().unwrap_or_default(),
        name = %ti.name_any(),
        %error,
        "vApp reconcile error, requeuing"
    );
    Action::requeue(ctx.settings.error_requeue_delay)
}

/// The vApp row for the TemplateInstance `namespace/name`, if both its VDC
/// and the row exist.
async fn find_vapp(ctx: &Context, namespace: &str, name: &str) -> Result<Option<VApp>> {
    let Some(vdc) = ctx.repos.vdcs.get_vdc_by_namespace(namespace).await? else {
        return Ok(None);
    };
    ctx.repos.vapps.get_vapp_by_name(vdc.id, name).await
}

pub async fn reconcile_vapp(ctx: &Context, ti: &TemplateInstance) -> Result<()> {
    let ns = ti.namespace().unwrap_or_default();
    let name = ti.name_any();
    let Some(vapp) = find_vapp(ctx, &ns, &name).await? else {
        debug!(%ns, %name, "no vApp row for template instance");
        ctx.metrics.skipped_update(CONTROLLER, "not_found");
        return Ok(());
    };

    let statuses: Vec<String> = ctx
        .repos
        .vms
        .list_vms_by_vapp(vapp.id)
        .await?
        .into_iter()
        .map(|vm| vm.status)
        .collect();
    let desired = evaluate_vapp_status(&VAppSignals {
        instantiation_failed: ti.has_failed(),
        instantiation_ready: ti.is_ready(),
        has_vms: !statuses.is_empty(),
        vm_statuses: &statuses,
    });

    if desired == vapp.status {
        ctx.metrics.skipped_update(CONTROLLER, "unchanged");
        return Ok(());
    }
    if !is_allowed(vapp.status, desired) {
        debug!(%ns, %name, from = %vapp.status, to = %desired, "transition not permitted");
        ctx.metrics.skipped_update(CONTROLLER, "illegal_transition");
        return Ok(());
    }

    let note = match (desired, ti.failure_message()) {
        (VAppStatus::Failed, Some(msg)) => {
            format!("vApp {name} failed to instantiate: {msg}")
        }
        _ => format!("vApp {name} status changed from {} to {desired}", vapp.status),
    };
    persist_status(ctx, &vapp, desired).await?;
    ctx.cluster
        .publish_event(
            &kube_object_ref(ti),
            &ClusterEvent::normal("VAppStatusChanged", "Reconcile", note),
        )
        .await;
    Ok(())
}

async fn persist_status(ctx: &Context, vapp: &VApp, status: VAppStatus) -> Result<()> {
    let started = Instant::now();
    match ctx.repos.vapps.update_vapp_status(vapp.id, status).await {
        Ok(updated) => {
            ctx.metrics
                .status_update(CONTROLLER, Outcome::Success, started.elapsed());
            if updated {
                info!(
                    vapp = %vapp.id,
                    name = %vapp.name,
                    from = %vapp.status,
                    to = %status,
                    "vApp status changed"
                );
            }
            Ok(())
        }
        Err(e) => {
            ctx.metrics
                .status_update(CONTROLLER, Outcome::Failure, started.elapsed());
            Err(e)
        }
    }
}

/// The TemplateInstance `namespace/name` is gone from the cluster.
pub async fn handle_template_instance_deleted(
    ctx: &Context,
    namespace: &str,
    name: &str,
) -> Result<()> {
    let Some(vapp) = find_vapp(ctx, namespace, name).await? else {
        ctx.metrics.skipped_update(CONTROLLER, "not_found");
        return Ok(());
    };
    if vapp.status == VAppStatus::Deleted {
        ctx.metrics.skipped_update(CONTROLLER, "unchanged");
        return Ok(());
    }
    persist_status(ctx, &vapp, VAppStatus::Deleted).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockClusterClient;
    use crate::controller::testing::{self, FailWrites, Fixture};
    use crate::crd::template_instance::{
        TemplateInstanceCondition, TemplateInstanceSpec, TemplateInstanceStatus,
    };
    use crate::crd::virtual_machine::VirtualMachineSpec;
    use crate::store::VAppRepository;

    fn instance(ns: &str, name: &str, conditions: &[(&str, &str)]) -> TemplateInstance {
        let mut ti = TemplateInstance::new(name, TemplateInstanceSpec::default());
        ti.metadata.namespace = Some(ns.to_string());
        ti.status = Some(TemplateInstanceStatus {
            conditions: conditions
                .iter()
                .map(|(t, s)| TemplateInstanceCondition {
                    type_: t.to_string(),
                    status: s.to_string(),
                    reason: None,
                    message: Some("quota exceeded".into()),
                })
                .collect(),
        });
        ti
    }

    fn events_allowed() -> MockClusterClient {
        let mut cluster = MockClusterClient::new();
        cluster.expect_publish_event().returning(|_, _| ());
        cluster
    }

    /// VDC "tenant-a" with vApp "web" in `status` and one VM per entry.
    fn seed(fx: &Fixture, status: VAppStatus, vm_statuses: &[&str]) -> VApp {
        let vdc = testing::vdc("tenant-a");
        let vapp = testing::vapp(vdc.id, "web", status);
        fx.store.insert_vdc(vdc);
        fx.store.insert_vapp(vapp.clone());
        for (i, s) in vm_statuses.iter().enumerate() {
            fx.store
                .insert_vm(testing::vm_row("tenant-a", &format!("web-{i}"), vapp.id, s));
        }
        vapp
    }

    async fn stored_status(fx: &Fixture, vapp: &VApp) -> VAppStatus {
        fx.store.get_vapp(vapp.id).await.unwrap().unwrap().status
    }

    #[test]
    fn labelled_vm_maps_to_its_template_instance() {
        let vm = testing::virtual_machine("tenant-a", "web-0", &[(VAPP_NAME_LABEL, "web")]);
        assert_eq!(
            map_vm_to_template_instance(vm),
            Some(ObjectRef::new("web").within("tenant-a"))
        );
        let mut bare = VirtualMachine::new("db-0", VirtualMachineSpec::default());
        bare.metadata.namespace = Some("tenant-a".into());
        assert_eq!(map_vm_to_template_instance(bare), None);
    }

    #[tokio::test]
    async fn ready_instance_with_stable_vms_deploys() {
        let fx = Fixture::new();
        let vapp = seed(&fx, VAppStatus::Instantiating, &["POWERED_ON", "POWERED_OFF"]);
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_publish_event()
            .withf(|_, e| e.reason == "VAppStatusChanged" && !e.warning)
            .times(1)
            .returning(|_, _| ());
        let ctx = fx.context(cluster);

        reconcile_vapp(&ctx, &instance("tenant-a", "web", &[("Ready", "True")]))
            .await
            .unwrap();

        assert_eq!(stored_status(&fx, &vapp).await, VAppStatus::Deployed);
        assert_eq!(fx.metrics.count("status_update:vapp_status:success"), 1);
    }

    #[tokio::test]
    async fn failed_status_write_is_counted_and_returned() {
        let fx = Fixture::new();
        let vapp = seed(&fx, VAppStatus::Instantiating, &["POWERED_ON"]);
        let mut cluster = MockClusterClient::new();
        cluster.expect_publish_event().never();
        let fail = FailWrites {
            vapp_status: true,
            ..Default::default()
        };
        let ctx = fx.failing_context(cluster, fail);

        let ti = instance("tenant-a", "web", &[("Ready", "True")]);
        assert!(reconcile_vapp(&ctx, &ti).await.is_err());
        assert!(handle_template_instance_deleted(&ctx, "tenant-a", "web")
            .await
            .is_err());

        assert_eq!(fx.metrics.count("status_update:vapp_status:failure"), 2);
        assert_eq!(stored_status(&fx, &vapp).await, VAppStatus::Instantiating);
    }

    #[tokio::test]
    async fn failed_instantiation_reports_the_message() {
        let fx = Fixture::new();
        let vapp = seed(&fx, VAppStatus::Instantiating, &[]);
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_publish_event()
            .withf(|_, e| e.note.as_deref().is_some_and(|n| n.contains("quota exceeded")))
            .times(1)
            .returning(|_, _| ());
        let ctx = fx.context(cluster);

        let ti = instance("tenant-a", "web", &[("InstantiateFailure", "True")]);
        reconcile_vapp(&ctx, &ti).await.unwrap();

        assert_eq!(stored_status(&fx, &vapp).await, VAppStatus::Failed);
    }

    #[tokio::test]
    async fn unchanged_status_is_not_rewritten() {
        let fx = Fixture::new();
        let vapp = seed(&fx, VAppStatus::Deployed, &["POWERED_ON"]);
        let mut cluster = MockClusterClient::new();
        cluster.expect_publish_event().never();
        let ctx = fx.context(cluster);

        reconcile_vapp(&ctx, &instance("tenant-a", "web", &[("Ready", "True")]))
            .await
            .unwrap();

        let after = fx.store.get_vapp(vapp.id).await.unwrap().unwrap();
        assert_eq!(after.updated_at, vapp.updated_at);
        assert_eq!(fx.metrics.count("skipped:vapp_status:unchanged"), 1);
    }

    #[tokio::test]
    async fn off_table_transitions_are_skipped() {
        let fx = Fixture::new();
        // DEPLOYED → INSTANTIATING is not a permitted move.
        let vapp = seed(&fx, VAppStatus::Deployed, &["UNRESOLVED"]);
        let mut cluster = MockClusterClient::new();
        cluster.expect_publish_event().never();
        let ctx = fx.context(cluster);

        reconcile_vapp(&ctx, &instance("tenant-a", "web", &[("Ready", "True")]))
            .await
            .unwrap();

        assert_eq!(stored_status(&fx, &vapp).await, VAppStatus::Deployed);
        assert_eq!(fx.metrics.count("skipped:vapp_status:illegal_transition"), 1);
    }

    #[tokio::test]
    async fn deleting_vm_moves_deployed_vapp_to_deleting() {
        let fx = Fixture::new();
        let vapp = seed(&fx, VAppStatus::Deployed, &["POWERED_ON", "DELETING"]);
        let ctx = fx.context(events_allowed());

        reconcile_vapp(&ctx, &instance("tenant-a", "web", &[("Ready", "True")]))
            .await
            .unwrap();

        assert_eq!(stored_status(&fx, &vapp).await, VAppStatus::Deleting);
    }

    #[tokio::test]
    async fn instance_outside_any_vdc_is_skipped() {
        let fx = Fixture::new();
        let ctx = fx.context(MockClusterClient::new());

        reconcile_vapp(&ctx, &instance("default", "web", &[("Ready", "True")]))
            .await
            .unwrap();
        assert_eq!(fx.metrics.count("skipped:vapp_status:not_found"), 1);
    }

    #[tokio::test]
    async fn vanished_instance_marks_vapp_deleted_once() {
        let fx = Fixture::new();
        let vapp = seed(&fx, VAppStatus::Deployed, &["POWERED_ON"]);
        let ctx = fx.context(MockClusterClient::new());

        handle_template_instance_deleted(&ctx, "tenant-a", "web")
            .await
            .unwrap();
        assert_eq!(stored_status(&fx, &vapp).await, VAppStatus::Deleted);

        handle_template_instance_deleted(&ctx, "tenant-a", "web")
            .await
            .unwrap();
        assert_eq!(fx.metrics.count("status_update:vapp_status:success"), 1);
        assert_eq!(fx.metrics.count("skipped:vapp_status:unchanged"), 1);
    }
}
