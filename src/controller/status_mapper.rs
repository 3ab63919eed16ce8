//! Cluster VM lifecycle → domain VM status.
//!
//! Pure and total: every combination of inputs maps to exactly one
//! [`VmStatus`].

use crate::crd::virtual_machine::{PrintableStatus, VirtualMachine};

/// Domain status vocabulary stored on VM rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VmStatus {
    PoweredOn,
    PoweredOff,
    PoweringOn,
    PoweringOff,
    Starting,
    Stopped,
    Suspended,
    Deleting,
    Deleted,
    Error,
    Unresolved,
    Unknown,
}

impl VmStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PoweredOn => "POWERED_ON",
            Self::PoweredOff => "POWERED_OFF",
            Self::PoweringOn => "POWERING_ON",
            Self::PoweringOff => "POWERING_OFF",
            Self::Starting => "STARTING",
            Self::Stopped => "STOPPED",
            Self::Suspended => "SUSPENDED",
            Self::Deleting => "DELETING",
            Self::Deleted => "DELETED",
            Self::Error => "ERROR",
            Self::Unresolved => "UNRESOLVED",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for VmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three signals the mapping looks at.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VmLifecycleSignal {
    pub pending_deletion: bool,
    pub printable_status: Option<PrintableStatus>,
    /// Declared run intent; `None` when the VM declares neither
    /// `running` nor a run strategy.
    pub run_intent: Option<bool>,
}

impl VmLifecycleSignal {
    pub fn from_vm(vm: &VirtualMachine) -> Self {
        Self {
            pending_deletion: vm.metadata.deletion_timestamp.is_some(),
            printable_status: vm.status.as_ref().and_then(|s| s.printable_status),
            run_intent: run_intent(vm),
        }
    }
}

/// `spec.running` wins; otherwise the run strategy decides.
fn run_intent(vm: &VirtualMachine) -> Option<bool> {
    if let Some(running) = vm.spec.running {
        return Some(running);
    }
    match vm.spec.run_strategy.as_deref()? {
        "Always" | "RerunOnFailure" | "Once" => Some(true),
        "Halted" | "Manual" => Some(false),
        _ => None,
    }
}

pub fn map_vm_status(signal: &VmLifecycleSignal) -> VmStatus {
    if signal.pending_deletion {
        return VmStatus::Deleting;
    }
    match signal.printable_status {
        Some(printable) => map_printable(printable),
        None => match signal.run_intent {
            Some(true) => VmStatus::Starting,
            Some(false) | None => VmStatus::Stopped,
        },
    }
}

fn map_printable(printable: PrintableStatus) -> VmStatus {
    use PrintableStatus::*;
    match printable {
        Running | Migrating => VmStatus::PoweredOn,
        Stopped => VmStatus::PoweredOff,
        Starting => VmStatus::PoweringOn,
        Stopping | Terminating => VmStatus::PoweringOff,
        Provisioning | WaitingForVolumeBinding | WaitingForReceiver => VmStatus::Starting,
        Paused => VmStatus::Suspended,
        Unknown => VmStatus::Unknown,
        CrashLoopBackOff | ErrorUnschedulable | ErrImagePull | ImagePullBackOff
        | ErrorPvcNotFound | ErrorDataVolumeNotFound | DataVolumeError => VmStatus::Error,
    }
}
