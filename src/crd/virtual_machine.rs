//! Typed views of the KubeVirt `VirtualMachine` and `VirtualMachineInstance`
//! resources (`kubevirt.io/v1`).
//!
//! The CRDs are owned by KubeVirt; only the fields the reconcilers read are
//! modelled and everything else is ignored on deserialisation.

use std::collections::BTreeMap;

use kube::CustomResource;
use serde::{Deserialize, Serialize};

// ── Shared sub-types ──────────────────────────────────────────────────────────

/// CPU topology as declared in a domain spec or reported by a live instance.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CpuTopology {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cores: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sockets: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threads: Option<u32>,
}

impl CpuTopology {
    /// cores × sockets × threads; a missing or zero factor counts as 1.
    /// `None` when no factor is set at all, or when the product does not
    /// fit an `i32`.
    pub fn vcpus(&self) -> Option<i32> {
        if self.cores.is_none() && self.sockets.is_none() && self.threads.is_none() {
            return None;
        }
        let factor = |v: Option<u32>| i32::try_from(v.filter(|n| *n > 0).unwrap_or(1)).ok();
        factor(self.cores)?
            .checked_mul(factor(self.sockets)?)?
            .checked_mul(factor(self.threads)?)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DomainMemory {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DomainResources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<BTreeMap<String, String>>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DomainSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuTopology>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<DomainMemory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<DomainResources>,
}

impl DomainSpec {
    /// Declared guest memory, falling back to the memory resource request.
    pub fn declared_memory(&self) -> Option<&str> {
        self.memory
            .as_ref()
            .and_then(|m| m.guest.as_deref())
            .or_else(|| {
                self.resources
                    .as_ref()
                    .and_then(|r| r.requests.as_ref())
                    .and_then(|r| r.get("memory"))
                    .map(String::as_str)
            })
    }
}

// ── VirtualMachineInstance ────────────────────────────────────────────────────

/// A running incarnation of a VirtualMachine.
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize)]
#[kube(
    group = "kubevirt.io",
    version = "v1",
    kind = "VirtualMachineInstance",
    shortname = "vmi",
    namespaced,
    status = "VirtualMachineInstanceStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<DomainSpec>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_current: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_at_boot: Option<String>,
}

/// Guest agent report of the operating system.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestOsInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pretty_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(
        default,
        rename = "currentCPUTopology",
        skip_serializing_if = "Option::is_none"
    )]
    pub current_cpu_topology: Option<CpuTopology>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryStatus>,
    #[serde(
        default,
        rename = "guestOSInfo",
        skip_serializing_if = "Option::is_none"
    )]
    pub guest_os_info: Option<GuestOsInfo>,
}

// ── VirtualMachine ────────────────────────────────────────────────────────────

/// Template the VirtualMachine stamps its instances from.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VirtualMachineInstanceTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<VirtualMachineInstanceSpec>,
}

/// Declared desired state of a KubeVirt VM.
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize)]
#[kube(
    group = "kubevirt.io",
    version = "v1",
    kind = "VirtualMachine",
    shortname = "vm",
    namespaced,
    status = "VirtualMachineStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<VirtualMachineInstanceTemplate>,
}

impl VirtualMachineSpec {
    pub fn domain(&self) -> Option<&DomainSpec> {
        self.template
            .as_ref()
            .and_then(|t| t.spec.as_ref())
            .and_then(|s| s.domain.as_ref())
    }
}

/// KubeVirt's summarised lifecycle, as shown in `kubectl get vm`.
/// Values this crate does not know deserialise as `Unknown`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum PrintableStatus {
    Running,
    Stopped,
    Starting,
    Stopping,
    Terminating,
    Provisioning,
    WaitingForVolumeBinding,
    WaitingForReceiver,
    Paused,
    Migrating,
    CrashLoopBackOff,
    ErrorUnschedulable,
    ErrImagePull,
    ImagePullBackOff,
    ErrorPvcNotFound,
    ErrorDataVolumeNotFound,
    DataVolumeError,
    #[serde(other)]
    Unknown,
}

impl PrintableStatus {
    pub const ALL: [PrintableStatus; 18] = [
        Self::Running,
        Self::Stopped,
        Self::Starting,
        Self::Stopping,
        Self::Terminating,
        Self::Provisioning,
        Self::WaitingForVolumeBinding,
        Self::WaitingForReceiver,
        Self::Paused,
        Self::Migrating,
        Self::CrashLoopBackOff,
        Self::ErrorUnschedulable,
        Self::ErrImagePull,
        Self::ImagePullBackOff,
        Self::ErrorPvcNotFound,
        Self::ErrorDataVolumeNotFound,
        Self::DataVolumeError,
        Self::Unknown,
    ];
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub printable_status: Option<PrintableStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<bool>,
}
