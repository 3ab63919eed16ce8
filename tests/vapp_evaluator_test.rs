//! Precedence of the vApp status rules.

use ssvirt_reconciler::controller::vapp_evaluator::{evaluate_vapp_status, VAppSignals};
use ssvirt_reconciler::store::VAppStatus;

fn statuses(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn evaluate(failed: bool, ready: bool, vms: &[&str]) -> VAppStatus {
    let vm_statuses = statuses(vms);
    evaluate_vapp_status(&VAppSignals {
        instantiation_failed: failed,
        instantiation_ready: ready,
        has_vms: !vm_statuses.is_empty(),
        vm_statuses: &vm_statuses,
    })
}

#[test]
fn failure_wins_over_everything() {
    assert_eq!(evaluate(true, true, &["POWERED_ON"]), VAppStatus::Failed);
    assert_eq!(evaluate(true, false, &[]), VAppStatus::Failed);
    assert_eq!(evaluate(true, true, &["DELETING"]), VAppStatus::Failed);
}

#[test]
fn not_ready_or_empty_is_instantiating() {
    assert_eq!(evaluate(false, false, &["POWERED_ON"]), VAppStatus::Instantiating);
    assert_eq!(evaluate(false, true, &[]), VAppStatus::Instantiating);
}

#[test]
fn unresolved_member_beats_deleting_member() {
    assert_eq!(
        evaluate(false, true, &["DELETING", "UNRESOLVED"]),
        VAppStatus::Instantiating
    );
    assert_eq!(
        evaluate(false, true, &["POWERED_ON", ""]),
        VAppStatus::Instantiating
    );
}

#[test]
fn one_deleting_vm_dominates_powered_on_vms() {
    assert_eq!(
        evaluate(false, true, &["POWERED_ON", "POWERED_ON", "DELETING"]),
        VAppStatus::Deleting
    );
    assert_eq!(
        evaluate(false, true, &["SUSPENDED", "DELETED"]),
        VAppStatus::Deleting
    );
}

#[test]
fn stable_members_deploy() {
    assert_eq!(
        evaluate(false, true, &["POWERED_ON", "POWERED_OFF", "SUSPENDED"]),
        VAppStatus::Deployed
    );
}
