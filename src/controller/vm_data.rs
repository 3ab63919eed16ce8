//! CPU / memory / guest-OS facts for a VM row.
//!
//! Live instance data wins; any field the instance does not report falls
//! back to the VM's declared spec. A value that is missing now never
//! erases one stored earlier.

use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::cluster::ClusterEvent;
use crate::crd::virtual_machine::{GuestOsInfo, VirtualMachine, VirtualMachineInstance};
use crate::error::Result;
use crate::helpers::{quantity_to_mb, GUEST_OS_ANNOTATION};
use crate::store::{Vm, VmDataUpdate};

use super::helpers::kube_object_ref;
use super::Context;

pub const UNKNOWN_GUEST_OS: &str = "Unknown";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObservedVmData {
    pub cpu_count: Option<i32>,
    pub memory_mb: Option<i64>,
    pub guest_os: Option<String>,
}

/// prettyName, else "name version", else name, else id.
pub fn describe_guest_os(info: &GuestOsInfo) -> Option<String> {
    let non_empty = |v: &Option<String>| {
        v.as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
    };
    if let Some(pretty) = non_empty(&info.pretty_name) {
        return Some(pretty);
    }
    match (non_empty(&info.name), non_empty(&info.version)) {
        (Some(name), Some(version)) => return Some(format!("{name} {version}")),
        (Some(name), None) => return Some(name),
        _ => {}
    }
    non_empty(&info.id)
}

pub fn observe_vm_data(
    vm: &VirtualMachine,
    vmi: Option<&VirtualMachineInstance>,
) -> ObservedVmData {
    let live = vmi.and_then(|i| i.status.as_ref());
    let declared = vm.spec.domain();

    let cpu_count = live
        .and_then(|s| s.current_cpu_topology.as_ref())
        .and_then(|t| t.vcpus())
        .or_else(|| declared.and_then(|d| d.cpu.as_ref()).and_then(|t| t.vcpus()));

    let memory_mb = live
        .and_then(|s| s.memory.as_ref())
        .and_then(|m| m.guest_current.as_deref())
        .and_then(quantity_to_mb)
        .or_else(|| declared.and_then(|d| d.declared_memory()).and_then(quantity_to_mb));

    let guest_os = live
        .and_then(|s| s.guest_os_info.as_ref())
        .and_then(describe_guest_os)
        .or_else(|| {
            vm.annotations()
                .get(GUEST_OS_ANNOTATION)
                .filter(|v| !v.trim().is_empty())
                .cloned()
        })
        .or_else(|| vmi.map(|_| UNKNOWN_GUEST_OS.to_string()));

    ObservedVmData {
        cpu_count,
        memory_mb,
        guest_os,
    }
}

/// Fields of `observed` that should be written over `stored`, or `None`
/// when nothing would change.
pub fn plan_vm_data_update(stored: &Vm, observed: &ObservedVmData) -> Option<VmDataUpdate> {
    let update = VmDataUpdate {
        cpu_count: observed
            .cpu_count
            .filter(|c| *c > 0 && stored.cpu_count != Some(*c)),
        memory_mb: observed
            .memory_mb
            .filter(|m| *m > 0 && stored.memory_mb != Some(*m)),
        guest_os: observed.guest_os.clone().filter(|os| {
            !os.is_empty()
                && stored.guest_os.as_deref() != Some(os.as_str())
                && !(os == UNKNOWN_GUEST_OS && stored.guest_os.is_some())
        }),
    };
    (!update.is_empty()).then_some(update)
}

/// Observe and persist data facts for one resolved VM row.
pub async fn reconcile_vm_data(ctx: &Context, vm: &VirtualMachine, row: &Vm) -> Result<()> {
    let ns = vm.namespace().unwrap_or_default();
    let name = vm.name_any();

    let vmi = ctx.cluster.get_virtual_machine_instance(&ns, &name).await?;
    let observed = observe_vm_data(vm, vmi.as_ref());
    let Some(update) = plan_vm_data_update(row, &observed) else {
        debug!(%ns, %name, "VM data unchanged");
        return Ok(());
    };

    match ctx.repos.vms.update_vm_data(row.id, &update).await {
        Ok(true) => {
            info!(%ns, %name, ?update, "VM data updated");
            Ok(())
        }
        Ok(false) => {
            debug!(%ns, %name, "VM row vanished before data update");
            ctx.metrics.skipped_update("vm_data", "row_gone");
            Ok(())
        }
        Err(e) => {
            warn!(%ns, %name, %e, "failed to persist VM data");
            ctx.metrics.reconcile_error("vm_data", e.category());
            ctx.cluster
                .publish_event(
                    &kube_object_ref(vm),
                    &ClusterEvent::warning(
                        "DataUpdateFailed",
                        "Reconcile",
                        format!("Failed to persist CPU/memory/guest OS: {e}"),
                    ),
                )
                .await;
            Err(e)
        }
    }
}
