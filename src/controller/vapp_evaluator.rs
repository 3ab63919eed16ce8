//! Aggregate instantiation signals and member VM statuses into one vApp
//! status, plus the table of transitions the vApp controller may persist.

use crate::store::VAppStatus;

use super::status_mapper::VmStatus;

#[derive(Clone, Debug, Default)]
pub struct VAppSignals<'a> {
    pub instantiation_failed: bool,
    pub instantiation_ready: bool,
    pub has_vms: bool,
    pub vm_statuses: &'a [String],
}

/// First matching rule wins.
pub fn evaluate_vapp_status(signals: &VAppSignals<'_>) -> VAppStatus {
    if signals.instantiation_failed {
        return VAppStatus::Failed;
    }
    if !signals.instantiation_ready || !signals.has_vms {
        return VAppStatus::Instantiating;
    }
    let statuses = signals.vm_statuses;
    if statuses
        .iter()
        .any(|s| s.is_empty() || s == VmStatus::Unresolved.as_str())
    {
        return VAppStatus::Instantiating;
    }
    if statuses
        .iter()
        .any(|s| s == VmStatus::Deleting.as_str() || s == VmStatus::Deleted.as_str())
    {
        return VAppStatus::Deleting;
    }
    VAppStatus::Deployed
}

// ── Transition table ──────────────────────────────────────────────────────────

/// A permitted status change. `from: None` matches any current status.
pub struct Transition {
    pub from: Option<VAppStatus>,
    pub to: VAppStatus,
    pub trigger: &'static str,
}

pub static TRANSITIONS: &[Transition] = &[
    Transition {
        from: Some(VAppStatus::Instantiating),
        to: VAppStatus::Deployed,
        trigger: "instantiation ready, all VMs stable",
    },
    Transition {
        from: Some(VAppStatus::Instantiating),
        to: VAppStatus::Failed,
        trigger: "instantiation failed",
    },
    Transition {
        from: Some(VAppStatus::Deployed),
        to: VAppStatus::Deleting,
        trigger: "a VM is deleting",
    },
    Transition {
        from: Some(VAppStatus::Deleting),
        to: VAppStatus::Deleted,
        trigger: "template instance gone",
    },
    Transition {
        from: None,
        to: VAppStatus::Deleted,
        trigger: "template instance gone",
    },
];

pub fn is_allowed(from: VAppStatus, to: VAppStatus) -> bool {
    from == to
        || TRANSITIONS
            .iter()
            .any(|t| t.to == to && t.from.is_none_or(|f| f == from))
}
