//! Bind a cluster VirtualMachine to its database VM row.
//!
//! Three lookups, tried in order:
//!
//! 1. `(vapp-id label, object name)`, the fast path for VMs we stamped;
//! 2. `(namespace, object name)`;
//! 3. discovery: a VM carrying a vapp-name label inside a VDC namespace gets
//!    its vApp row (created on demand) and a fresh VM row.
//!
//! Creates race with other replicas and duplicate events; a uniqueness
//! violation means someone else won, so the row is re-read.

use kube::ResourceExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cluster::ClusterEvent;
use crate::crd::virtual_machine::VirtualMachine;
use crate::error::Result;
use crate::helpers::{DISPLAY_NAME_ANNOTATION, VAPP_ID_LABEL, VAPP_NAME_LABEL};
use crate::metrics::Outcome;
use crate::store::{NewVApp, NewVm, VApp, VAppStatus, Vdc, Vm};

use super::helpers::kube_object_ref;
use super::status_mapper::{map_vm_status, VmLifecycleSignal};
use super::Context;

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved { vm: Vm, created: bool },
    /// The object does not belong to this system. Carries the skip reason.
    NotManaged(&'static str),
}

impl Resolution {
    pub fn into_vm(self) -> Option<Vm> {
        match self {
            Resolution::Resolved { vm, .. } => Some(vm),
            Resolution::NotManaged(_) => None,
        }
    }
}

pub async fn resolve_vm_record(ctx: &Context, vm: &VirtualMachine) -> Result<Resolution> {
    let ns = vm.namespace().unwrap_or_default();
    let name = vm.name_any();
    let labels = vm.labels();

    if let Some(vapp_id) = labels
        .get(VAPP_ID_LABEL)
        .and_then(|v| Uuid::parse_str(v).ok())
    {
        if let Some(row) = ctx.repos.vms.get_vm_by_vapp_and_name(vapp_id, &name).await? {
            return Ok(Resolution::Resolved {
                vm: row,
                created: false,
            });
        }
    }

    if let Some(row) = ctx
        .repos
        .vms
        .get_vm_by_namespace_and_name(&ns, &name)
        .await?
    {
        return Ok(Resolution::Resolved {
            vm: row,
            created: false,
        });
    }

    let Some(vapp_name) = labels.get(VAPP_NAME_LABEL).filter(|v| !v.is_empty()) else {
        debug!(%ns, %name, "no vapp-name label, not managed");
        return Ok(Resolution::NotManaged("no_vapp_label"));
    };
    let Some(vdc) = ctx.repos.vdcs.get_vdc_by_namespace(&ns).await? else {
        debug!(%ns, %name, "namespace has no VDC, not managed");
        return Ok(Resolution::NotManaged("no_vdc"));
    };

    let vapp = ensure_vapp(ctx, vm, &vdc, vapp_name).await?;
    let row = create_vm_row(ctx, vm, &vapp).await?;
    Ok(Resolution::Resolved {
        vm: row,
        created: true,
    })
}

async fn ensure_vapp(
    ctx: &Context,
    vm: &VirtualMachine,
    vdc: &Vdc,
    vapp_name: &str,
) -> Result<VApp> {
    if let Some(vapp) = ctx.repos.vapps.get_vapp_by_name(vdc.id, vapp_name).await? {
        return Ok(vapp);
    }

    let new = NewVApp {
        name: vapp_name.to_string(),
        vdc_id: vdc.id,
        status: VAppStatus::Instantiating,
        description: format!("Discovered from virtual machine {}", vm.name_any()),
    };
    match ctx.repos.vapps.create_vapp(new).await {
        Ok(vapp) => {
            info!(vapp = %vapp.name, vdc = %vdc.id, "created vApp record");
            ctx.metrics.record_created("vapp", Outcome::Success);
            ctx.cluster
                .publish_event(
                    &kube_object_ref(vm),
                    &ClusterEvent::normal(
                        "VAppRecordCreated",
                        "Resolve",
                        format!("Created vApp record {} in VDC {}", vapp.name, vdc.name),
                    ),
                )
                .await;
            Ok(vapp)
        }
        Err(e) if e.is_already_exists() => {
            debug!(vapp = %vapp_name, "vApp created concurrently, re-reading");
            ctx.repos
                .vapps
                .get_vapp_by_name(vdc.id, vapp_name)
                .await?
                .ok_or(e)
        }
        Err(e) => {
            ctx.metrics.record_created("vapp", Outcome::Failure);
            Err(e)
        }
    }
}

async fn create_vm_row(ctx: &Context, vm: &VirtualMachine, vapp: &VApp) -> Result<Vm> {
    let ns = vm.namespace().unwrap_or_default();
    let name = vm.name_any();
    let display = vm
        .annotations()
        .get(DISPLAY_NAME_ANNOTATION)
        .filter(|v| !v.is_empty())
        .cloned()
        .unwrap_or_else(|| name.clone());
    let status = map_vm_status(&VmLifecycleSignal::from_vm(vm));

    let new = NewVm {
        name: display,
        vm_name: name.clone(),
        namespace: ns.clone(),
        vapp_id: vapp.id,
        status: status.as_str().to_string(),
    };
    match ctx.repos.vms.create_vm(new).await {
        Ok(row) => {
            info!(%ns, %name, vapp = %vapp.name, %status, "created VM record");
            ctx.metrics.record_created("vm", Outcome::Success);
            ctx.cluster
                .publish_event(
                    &kube_object_ref(vm),
                    &ClusterEvent::normal(
                        "VmRecordCreated",
                        "Resolve",
                        format!("Created VM record in vApp {} with status {status}", vapp.name),
                    ),
                )
                .await;
            Ok(row)
        }
        Err(e) if e.is_already_exists() => {
            debug!(%ns, %name, "VM row created concurrently, re-reading");
            let existing = match ctx.repos.vms.get_vm_by_namespace_and_name(&ns, &name).await? {
                Some(row) => Some(row),
                None => ctx.repos.vms.get_vm_by_vapp_and_name(vapp.id, &name).await?,
            };
            existing.ok_or(e)
        }
        Err(e) => {
            ctx.metrics.record_created("vm", Outcome::Failure);
            Err(e)
        }
    }
}

/// Put the row's vApp identity on the cluster object so later passes take
/// the fast lookup. A failed patch is counted and logged; the next pass
/// retries it.
pub async fn stamp_vapp_identity(ctx: &Context, vm: &VirtualMachine, row: &Vm) {
    let wanted = row.vapp_id.to_string();
    if vm.labels().get(VAPP_ID_LABEL) == Some(&wanted) {
        return;
    }
    let ns = vm.namespace().unwrap_or_default();
    let name = vm.name_any();
    match ctx
        .cluster
        .set_virtual_machine_label(&ns, &name, VAPP_ID_LABEL, &wanted)
        .await
    {
        Ok(()) => debug!(%ns, %name, vapp_id = %wanted, "stamped vapp-id label"),
        Err(e) => {
            warn!(%ns, %name, %e, "failed to stamp vapp-id label");
            ctx.metrics.reconcile_error("vm_status", e.category());
        }
    }
}
