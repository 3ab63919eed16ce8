//! Every combination of lifecycle signals maps to a status.

use ssvirt_reconciler::controller::status_mapper::{map_vm_status, VmLifecycleSignal, VmStatus};
use ssvirt_reconciler::crd::virtual_machine::PrintableStatus;

const RUN_INTENTS: [Option<bool>; 3] = [Some(true), Some(false), None];

fn signal(
    pending_deletion: bool,
    printable_status: Option<PrintableStatus>,
    run_intent: Option<bool>,
) -> VmLifecycleSignal {
    VmLifecycleSignal {
        pending_deletion,
        printable_status,
        run_intent,
    }
}

#[test]
fn pending_deletion_dominates_everything() {
    let printable = PrintableStatus::ALL.iter().copied().map(Some).chain([None]);
    for p in printable {
        for intent in RUN_INTENTS {
            assert_eq!(
                map_vm_status(&signal(true, p, intent)),
                VmStatus::Deleting,
                "{p:?} / {intent:?}"
            );
        }
    }
}

#[test]
fn printable_status_ignores_run_intent() {
    for p in PrintableStatus::ALL {
        let expected = map_vm_status(&signal(false, Some(p), None));
        for intent in RUN_INTENTS {
            assert_eq!(map_vm_status(&signal(false, Some(p), intent)), expected);
        }
        assert_ne!(expected, VmStatus::Deleting);
        assert_ne!(expected, VmStatus::Unresolved);
    }
}

#[test]
fn printable_status_table() {
    let cases = [
        (PrintableStatus::Running, VmStatus::PoweredOn),
        (PrintableStatus::Migrating, VmStatus::PoweredOn),
        (PrintableStatus::Stopped, VmStatus::PoweredOff),
        (PrintableStatus::Starting, VmStatus::PoweringOn),
        (PrintableStatus::Stopping, VmStatus::PoweringOff),
        (PrintableStatus::Terminating, VmStatus::PoweringOff),
        (PrintableStatus::Provisioning, VmStatus::Starting),
        (PrintableStatus::WaitingForVolumeBinding, VmStatus::Starting),
        (PrintableStatus::WaitingForReceiver, VmStatus::Starting),
        (PrintableStatus::Paused, VmStatus::Suspended),
        (PrintableStatus::Unknown, VmStatus::Unknown),
        (PrintableStatus::CrashLoopBackOff, VmStatus::Error),
        (PrintableStatus::ErrorUnschedulable, VmStatus::Error),
        (PrintableStatus::ErrImagePull, VmStatus::Error),
        (PrintableStatus::ImagePullBackOff, VmStatus::Error),
        (PrintableStatus::ErrorPvcNotFound, VmStatus::Error),
        (PrintableStatus::ErrorDataVolumeNotFound, VmStatus::Error),
        (PrintableStatus::DataVolumeError, VmStatus::Error),
    ];
    assert_eq!(cases.len(), PrintableStatus::ALL.len());
    for (printable, expected) in cases {
        assert_eq!(
            map_vm_status(&signal(false, Some(printable), None)),
            expected,
            "{printable:?}"
        );
    }
}

#[test]
fn without_printable_status_run_intent_decides() {
    assert_eq!(
        map_vm_status(&signal(false, None, Some(true))),
        VmStatus::Starting
    );
    assert_eq!(
        map_vm_status(&signal(false, None, Some(false))),
        VmStatus::Stopped
    );
    assert_eq!(map_vm_status(&signal(false, None, None)), VmStatus::Stopped);
}

#[test]
fn unrecognised_printable_status_deserialises_as_unknown() {
    let p: PrintableStatus = serde_json::from_str("\"SomethingNew\"").unwrap();
    assert_eq!(
        map_vm_status(&signal(false, Some(p), Some(true))),
        VmStatus::Unknown
    );
}
