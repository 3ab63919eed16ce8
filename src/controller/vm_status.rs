//! VM status controller.
//!
//! Per VirtualMachine (and per VirtualMachineInstance, mapped to its owning
//! VM): derive the vapp-name label, resolve the database row, reconcile the
//! status, then reconcile CPU/memory/guest-OS. Objects that disappear are
//! marked DELETED, both from the controller stream and from a periodic
//! sweep that catches deletions missed while the controller was down.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
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
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::ClusterEvent;
use crate::crd::virtual_machine::{VirtualMachine, VirtualMachineInstance};
use crate::error::{Error, Result};
use crate::helpers::VAPP_NAME_LABEL;
use crate::metrics::Outcome;
use crate::store::Vm;

use super::helpers::kube_object_ref;
use super::resolver::{resolve_vm_record, stamp_vapp_identity, Resolution};
use super::status_mapper::{map_vm_status, VmLifecycleSignal, VmStatus};
use super::{labels, vm_data, Context};

pub const CONTROLLER: &str = "vm_status";

// ── Controller entry point ────────────────────────────────────────────────────

/// Start the VM status controller. Returns when the controller shuts down.
pub async fn run(client: Client, ctx: Arc<Context>) {
    let vms: Api<VirtualMachine> = Api::all(client.clone());
    let vmis: Api<VirtualMachineInstance> = Api::all(client);
    let config = controller::Config::default().concurrency(ctx.settings.kube_concurrency());

    info!("starting VM status controller");
    ctx.metrics.controller_health(CONTROLLER, true);
    let deletion_ctx = ctx.clone();
    Controller::new(vms, WatcherConfig::default())
        .watches(vmis, WatcherConfig::default(), map_vmi_to_vm)
        .with_config(config)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx.clone())
        .for_each(move |res| {
            let ctx = deletion_ctx.clone();
            async move {
                match res {
                    Ok((obj, _action)) => debug!(%obj, "VM reconciled"),
                    Err(controller::Error::ObjectNotFound(obj)) => {
                        let ns = obj.namespace.clone().unwrap_or_default();
                        if let Err(e) = handle_vm_deleted(&ctx, &ns, &obj.name).await {
                            warn!(%ns, name = %obj.name, %e, "failed to record VM deletion");
                            ctx.metrics.reconcile_error(CONTROLLER, e.category());
                        }
                    }
                    Err(e) => warn!("VM reconcile failed: {e:?}"),
                }
            }
        })
        .await;
    ctx.metrics.controller_health(CONTROLLER, false);
}

/// Periodically mark rows whose VirtualMachine no longer exists.
pub async fn run_sweeper(ctx: Arc<Context>, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(ctx.settings.vm_resync_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                match sweep_vanished_vms(&ctx).await {
                    Ok(0) => {}
                    Ok(n) => info!(marked = n, "marked vanished VMs deleted"),
                    Err(e) => {
                        warn!(%e, "VM sweep failed");
                        ctx.metrics.reconcile_error(CONTROLLER, e.category());
                    }
                }
            }
        }
    }
    debug!("VM sweeper stopped");
}

/// VMI → owning VM, by owner reference.
fn map_vmi_to_vm(vmi: VirtualMachineInstance) -> Option<ObjectRef<VirtualMachine>> {
    let ns = vmi.namespace()?;
    vmi.owner_references()
        .iter()
        .find(|o| o.kind == "VirtualMachine" && o.api_version.starts_with("kubevirt.io/"))
        .map(|o| ObjectRef::new(&o.name).within(&ns))
}

// ── Reconcile ─────────────────────────────────────────────────────────────────

async fn reconcile(vm: Arc<VirtualMachine>, ctx: Arc<Context>) -> Result<Action> {
    reconcile_vm(&ctx, &vm).await?;
    Ok(Action::requeue(ctx.settings.vm_resync_interval))
}

fn error_policy(vm: Arc<VirtualMachine>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = vm.name_any();
    let ns = vm.namespace().unwrap_or_default();
    ctx.metrics.reconcile_error(CONTROLLER, error.category());
    warn!(
        %ns,
        %name,
        %error,
        delay = ?ctx.settings.error_requeue_delay,
        "VM reconcile error, requeuing"
    );
    Action::requeue(ctx.settings.error_requeue_delay)
}

/// One convergence pass for one VirtualMachine.
pub async fn reconcile_vm(ctx: &Context, vm: &VirtualMachine) -> Result<()> {
    let labelled;
    let vm = match labels::derive_vapp_name_label(ctx, vm).await? {
        Some(vapp_name) => {
            let mut copy = vm.clone();
            copy.labels_mut()
                .insert(VAPP_NAME_LABEL.to_string(), vapp_name);
            labelled = copy;
            &labelled
        }
        None => vm,
    };

    let row = match resolve_vm_record(ctx, vm).await? {
        Resolution::Resolved { vm: row, .. } => row,
        Resolution::NotManaged(reason) => {
            ctx.metrics.skipped_update(CONTROLLER, reason);
            return Ok(());
        }
    };
    stamp_vapp_identity(ctx, vm, &row).await;

    let status = reconcile_status(ctx, vm, &row).await;
    let data = vm_data::reconcile_vm_data(ctx, vm, &row).await;
    status.and(data)
}

async fn reconcile_status(ctx: &Context, vm: &VirtualMachine, row: &Vm) -> Result<()> {
    let ns = vm.namespace().unwrap_or_default();
    let name = vm.name_any();
    let desired = map_vm_status(&VmLifecycleSignal::from_vm(vm));

    let age = Utc::now()
        .signed_duration_since(row.updated_at)
        .to_std()
        .unwrap_or_default();
    if row.status == desired.as_str() && age < ctx.settings.status_staleness_window {
        debug!(%ns, %name, status = %desired, "status unchanged");
        ctx.metrics.skipped_update(CONTROLLER, "unchanged");
        return Ok(());
    }

    let started = Instant::now();
    match ctx.repos.vms.update_vm_status(row.id, desired.as_str()).await {
        Ok(true) => {
            ctx.metrics
                .status_update(CONTROLLER, Outcome::Success, started.elapsed());
            if row.status != desired.as_str() {
                info!(%ns, %name, from = %row.status, to = %desired, "VM status changed");
                ctx.cluster
                    .publish_event(
                        &kube_object_ref(vm),
                        &ClusterEvent::normal(
                            "StatusChanged",
                            "Reconcile",
                            format!("VM status changed from {} to {desired}", row.status),
                        ),
                    )
                    .await;
            }
            Ok(())
        }
        Ok(false) => {
            debug!(%ns, %name, "VM row vanished before status update");
            ctx.metrics.skipped_update(CONTROLLER, "row_gone");
            Ok(())
        }
        Err(e) => {
            ctx.metrics
                .status_update(CONTROLLER, Outcome::Failure, started.elapsed());
            ctx.cluster
                .publish_event(
                    &kube_object_ref(vm),
                    &ClusterEvent::warning(
                        "StatusUpdateFailed",
                        "Reconcile",
                        format!("Failed to persist status {desired}: {e}"),
                    ),
                )
                .await;
            Err(e)
        }
    }
}

// ── Deletion ──────────────────────────────────────────────────────────────────

/// The VirtualMachine `namespace/name` is gone from the cluster. Labels are
/// no longer readable, so only the namespace lookup applies.
pub async fn handle_vm_deleted(ctx: &Context, namespace: &str, name: &str) -> Result<()> {
    let Some(row) = ctx
        .repos
        .vms
        .get_vm_by_namespace_and_name(namespace, name)
        .await?
    else {
        debug!(%namespace, %name, "deleted VM has no row");
        ctx.metrics.skipped_update(CONTROLLER, "not_found");
        return Ok(());
    };
    if row.status == VmStatus::Deleted.as_str() {
        ctx.metrics.skipped_update(CONTROLLER, "unchanged");
        return Ok(());
    }

    let started = Instant::now();
    match ctx
        .repos
        .vms
        .update_vm_status(row.id, VmStatus::Deleted.as_str())
        .await
    {
        Ok(_) => {
            ctx.metrics
                .status_update(CONTROLLER, Outcome::Success, started.elapsed());
            info!(%namespace, %name, "VM marked deleted");
            Ok(())
        }
        Err(e) => {
            ctx.metrics
                .status_update(CONTROLLER, Outcome::Failure, started.elapsed());
            Err(e)
        }
    }
}

/// Mark every non-deleted row whose VirtualMachine is gone. Returns how
/// many rows were marked.
pub async fn sweep_vanished_vms(ctx: &Context) -> Result<usize> {
    let mut marked = 0;
    for row in ctx.repos.vms.list_vms().await? {
        if row.status == VmStatus::Deleted.as_str() {
            continue;
        }
        if ctx
            .cluster
            .get_virtual_machine(&row.namespace, &row.vm_name)
            .await?
            .is_none()
        {
            handle_vm_deleted(ctx, &row.namespace, &row.vm_name).await?;
            marked += 1;
        }
    }
    Ok(marked)
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use uuid::Uuid;

    use std::sync::Mutex;

    use super::*;
    use crate::cluster::MockClusterClient;
    use crate::controller::testing::{self, FailWrites, Fixture};
    use crate::crd::virtual_machine::{PrintableStatus, VirtualMachineInstanceSpec};
    use crate::helpers::GUEST_OS_ANNOTATION;
    use crate::store::VmRepository;

    type Published = Arc<Mutex<Vec<(bool, String)>>>;

    /// Accepts every call and keeps `(warning, reason)` of each event.
    fn recording_cluster(published: Published) -> MockClusterClient {
        let mut cluster = MockClusterClient::new();
        cluster.expect_publish_event().returning(move |_, ev| {
            published.lock().unwrap().push((ev.warning, ev.reason.clone()));
        });
        cluster
            .expect_set_virtual_machine_label()
            .returning(|_, _, _, _| Ok(()));
        cluster
            .expect_get_virtual_machine_instance()
            .returning(|_, _| Ok(None));
        cluster
    }

    /// A VM whose row needs both a status change (POWERED_ON → POWERED_OFF)
    /// and a guest OS write.
    fn stopped_vm_with_guest_os() -> VirtualMachine {
        let mut vm = testing::virtual_machine("tenant-a", "web-0", &[]);
        vm.status.as_mut().unwrap().printable_status = Some(PrintableStatus::Stopped);
        vm.annotations_mut()
            .insert(GUEST_OS_ANNOTATION.to_string(), "fedora".to_string());
        vm
    }

    fn permissive_cluster() -> MockClusterClient {
        let mut cluster = MockClusterClient::new();
        cluster.expect_publish_event().returning(|_, _| ());
        cluster
            .expect_set_virtual_machine_label()
            .returning(|_, _, _, _| Ok(()));
        cluster
            .expect_get_virtual_machine_instance()
            .returning(|_, _| Ok(None));
        cluster
    }

    #[test]
    fn vmi_maps_to_owning_vm() {
        let mut vmi = VirtualMachineInstance::new("web-0", VirtualMachineInstanceSpec::default());
        vmi.metadata.namespace = Some("tenant-a".into());
        vmi.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "kubevirt.io/v1".into(),
            kind: "VirtualMachine".into(),
            name: "web-0".into(),
            uid: "u".into(),
            ..Default::default()
        }]);
        assert_eq!(
            map_vmi_to_vm(vmi.clone()),
            Some(ObjectRef::new("web-0").within("tenant-a"))
        );

        vmi.metadata.owner_references = None;
        assert_eq!(map_vmi_to_vm(vmi), None);
    }

    #[tokio::test]
    async fn fresh_unchanged_status_is_not_rewritten() {
        let fx = Fixture::new();
        let row = testing::vm_row("tenant-a", "web-0", Uuid::new_v4(), "POWERED_ON");
        fx.store.insert_vm(row.clone());
        let ctx = fx.context(permissive_cluster());
        let vm = testing::virtual_machine(
            "tenant-a",
            "web-0",
            &[(crate::helpers::VAPP_ID_LABEL, &row.vapp_id.to_string())],
        );

        reconcile_vm(&ctx, &vm).await.unwrap();

        assert_eq!(fx.metrics.count("skipped:vm_status:unchanged"), 1);
        assert_eq!(fx.metrics.count("status_update:vm_status:success"), 0);
        let after = fx.store.get_vm(row.id).await.unwrap().unwrap();
        assert_eq!(after.updated_at, row.updated_at);
    }

    #[tokio::test]
    async fn stale_unchanged_status_is_refreshed() {
        let fx = Fixture::new();
        let row = testing::vm_row("tenant-a", "web-0", Uuid::new_v4(), "POWERED_ON");
        fx.store.insert_vm(row.clone());
        fx.store
            .set_vm_updated_at(row.id, Utc::now() - ChronoDuration::minutes(30));
        let ctx = fx.context(permissive_cluster());
        let vm = testing::virtual_machine("tenant-a", "web-0", &[]);

        reconcile_vm(&ctx, &vm).await.unwrap();

        assert_eq!(fx.metrics.count("status_update:vm_status:success"), 1);
        let after = fx.store.get_vm(row.id).await.unwrap().unwrap();
        assert!(after.updated_at > Utc::now() - ChronoDuration::minutes(1));
    }

    #[tokio::test]
    async fn status_change_is_persisted_with_an_event() {
        let fx = Fixture::new();
        let row = testing::vm_row("tenant-a", "web-0", Uuid::new_v4(), "POWERED_ON");
        fx.store.insert_vm(row.clone());
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_publish_event()
            .withf(|_, ev| ev.reason == "StatusChanged" && !ev.warning)
            .times(1)
            .returning(|_, _| ());
        cluster
            .expect_set_virtual_machine_label()
            .returning(|_, _, _, _| Ok(()));
        cluster
            .expect_get_virtual_machine_instance()
            .returning(|_, _| Ok(None));
        let ctx = fx.context(cluster);
        let mut vm = testing::virtual_machine("tenant-a", "web-0", &[]);
        vm.status.as_mut().unwrap().printable_status = Some(PrintableStatus::Stopped);

        reconcile_vm(&ctx, &vm).await.unwrap();

        let after = fx.store.get_vm(row.id).await.unwrap().unwrap();
        assert_eq!(after.status, "POWERED_OFF");
    }

    #[tokio::test]
    async fn both_failures_are_reported_and_the_status_error_wins() {
        let fx = Fixture::new();
        let row = testing::vm_row("tenant-a", "web-0", Uuid::new_v4(), "POWERED_ON");
        fx.store.insert_vm(row.clone());
        let published = Published::default();
        let fail = FailWrites {
            vm_status: true,
            vm_data: true,
            ..Default::default()
        };
        let ctx = fx.failing_context(recording_cluster(published.clone()), fail);

        let err = reconcile_vm(&ctx, &stopped_vm_with_guest_os())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("vm status rejected"), "{err}");
        assert_eq!(
            *published.lock().unwrap(),
            [
                (true, "StatusUpdateFailed".to_string()),
                (true, "DataUpdateFailed".to_string())
            ]
        );
        assert_eq!(fx.metrics.count("status_update:vm_status:failure"), 1);
        assert_eq!(fx.metrics.count("reconcile_error:vm_data:reconcile"), 1);
        let after = fx.store.get_vm(row.id).await.unwrap().unwrap();
        assert_eq!(after.status, "POWERED_ON");
        assert_eq!(after.guest_os, None);
    }

    #[tokio::test]
    async fn status_failure_still_writes_data() {
        let fx = Fixture::new();
        let row = testing::vm_row("tenant-a", "web-0", Uuid::new_v4(), "POWERED_ON");
        fx.store.insert_vm(row.clone());
        let published = Published::default();
        let fail = FailWrites {
            vm_status: true,
            ..Default::default()
        };
        let ctx = fx.failing_context(recording_cluster(published.clone()), fail);

        let err = reconcile_vm(&ctx, &stopped_vm_with_guest_os())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("vm status rejected"), "{err}");
        assert_eq!(
            *published.lock().unwrap(),
            [(true, "StatusUpdateFailed".to_string())]
        );
        let after = fx.store.get_vm(row.id).await.unwrap().unwrap();
        assert_eq!(after.status, "POWERED_ON");
        assert_eq!(after.guest_os.as_deref(), Some("fedora"));
    }

    #[tokio::test]
    async fn data_failure_alone_fails_the_pass() {
        let fx = Fixture::new();
        let row = testing::vm_row("tenant-a", "web-0", Uuid::new_v4(), "POWERED_ON");
        fx.store.insert_vm(row.clone());
        let published = Published::default();
        let fail = FailWrites {
            vm_data: true,
            ..Default::default()
        };
        let ctx = fx.failing_context(recording_cluster(published.clone()), fail);
        let mut vm = testing::virtual_machine("tenant-a", "web-0", &[]);
        vm.annotations_mut()
            .insert(GUEST_OS_ANNOTATION.to_string(), "fedora".to_string());

        let err = reconcile_vm(&ctx, &vm).await.unwrap_err();

        assert!(err.to_string().contains("vm data rejected"), "{err}");
        assert_eq!(
            *published.lock().unwrap(),
            [(true, "DataUpdateFailed".to_string())]
        );
        assert_eq!(fx.metrics.count("skipped:vm_status:unchanged"), 1);
        assert_eq!(fx.metrics.count("status_update:vm_status:failure"), 0);
    }

    #[tokio::test]
    async fn unmanaged_vm_is_skipped_without_error() {
        let fx = Fixture::new();
        let ctx = fx.context(MockClusterClient::new());
        let vm = testing::virtual_machine("kube-system", "stray", &[]);

        reconcile_vm(&ctx, &vm).await.unwrap();
        assert_eq!(fx.metrics.count("skipped:vm_status:no_vapp_label"), 1);
    }

    #[tokio::test]
    async fn vanished_vm_is_marked_deleted_once() {
        let fx = Fixture::new();
        let row = testing::vm_row("tenant-a", "web-0", Uuid::new_v4(), "POWERED_ON");
        fx.store.insert_vm(row.clone());
        let ctx = fx.context(MockClusterClient::new());

        handle_vm_deleted(&ctx, "tenant-a", "web-0").await.unwrap();
        let after = fx.store.get_vm(row.id).await.unwrap().unwrap();
        assert_eq!(after.status, "DELETED");

        handle_vm_deleted(&ctx, "tenant-a", "web-0").await.unwrap();
        assert_eq!(fx.metrics.count("status_update:vm_status:success"), 1);

        fx.store.remove_vm(row.id);
        handle_vm_deleted(&ctx, "tenant-a", "web-0").await.unwrap();
        assert_eq!(fx.metrics.count("skipped:vm_status:not_found"), 1);
    }

    #[tokio::test]
    async fn sweep_marks_only_missing_objects() {
        let fx = Fixture::new();
        let vapp_id = Uuid::new_v4();
        let present = testing::vm_row("tenant-a", "present", vapp_id, "POWERED_ON");
        let missing = testing::vm_row("tenant-a", "missing", vapp_id, "POWERED_OFF");
        let already = testing::vm_row("tenant-a", "already", vapp_id, "DELETED");
        for row in [&present, &missing, &already] {
            fx.store.insert_vm(row.clone());
        }
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_get_virtual_machine()
            .returning(|ns, name| {
                Ok((name == "present").then(|| testing::virtual_machine(ns, name, &[])))
            });
        let ctx = fx.context(cluster);

        assert_eq!(sweep_vanished_vms(&ctx).await.unwrap(), 1);
        let mut statuses = Vec::new();
        for id in [present.id, missing.id, already.id] {
            statuses.push(fx.store.get_vm(id).await.unwrap().unwrap().status);
        }
        assert_eq!(statuses, ["POWERED_ON", "DELETED", "DELETED"]);
    }
}
