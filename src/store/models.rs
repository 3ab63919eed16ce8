//! Database entities the reconcilers read and write.
//!
//! Parents are referenced by identity only; nothing here holds a graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tenant boundary. Read-only for the reconcilers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub enabled: bool,
    /// Legacy namespace binding; organizations without one have nothing
    /// to converge in the cluster.
    pub namespace: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Organization {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Resource-bounded subdivision of an organization, bound 1:1 to a namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vdc {
    pub id: Uuid,
    pub name: String,
    pub organization_id: Uuid,
    pub namespace: Option<String>,
    pub enabled: bool,
    /// CPU cores; `None` or zero means unlimited.
    pub cpu_limit: Option<i64>,
    /// Memory in MiB; `None` or zero means unlimited.
    pub memory_limit_mb: Option<i64>,
    /// Storage in GiB; `None` or zero means unlimited.
    pub storage_limit_gb: Option<i64>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Vdc {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Bound namespace name, treating an empty string as unbound.
    pub fn namespace_name(&self) -> Option<&str> {
        self.namespace.as_deref().filter(|ns| !ns.is_empty())
    }
}

/// Lifecycle of a vApp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VAppStatus {
    Instantiating,
    Deployed,
    Deleting,
    Deleted,
    Failed,
}

impl VAppStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Instantiating => "INSTANTIATING",
            Self::Deployed => "DEPLOYED",
            Self::Deleting => "DELETING",
            Self::Deleted => "DELETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INSTANTIATING" => Some(Self::Instantiating),
            "DEPLOYED" => Some(Self::Deployed),
            "DELETING" => Some(Self::Deleting),
            "DELETED" => Some(Self::Deleted),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for VAppStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named grouping of VMs within one VDC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VApp {
    pub id: Uuid,
    pub name: String,
    pub vdc_id: Uuid,
    pub status: VAppStatus,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields required to create a vApp row.
#[derive(Debug, Clone, PartialEq)]
pub struct NewVApp {
    pub name: String,
    pub vdc_id: Uuid,
    pub status: VAppStatus,
    pub description: String,
}

/// Mirror of one cluster-managed virtual machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vm {
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Name of the VirtualMachine object in the cluster.
    pub vm_name: String,
    pub namespace: String,
    pub vapp_id: Uuid,
    /// One of the `VmStatus` strings; stored free-form.
    pub status: String,
    pub cpu_count: Option<i32>,
    pub memory_mb: Option<i64>,
    pub guest_os: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields required to create a VM row.
#[derive(Debug, Clone, PartialEq)]
pub struct NewVm {
    pub name: String,
    pub vm_name: String,
    pub namespace: String,
    pub vapp_id: Uuid,
    pub status: String,
}

/// Partial update of the observed VM facts. `None` leaves a column untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmDataUpdate {
    pub cpu_count: Option<i32>,
    pub memory_mb: Option<i64>,
    pub guest_os: Option<String>,
}

impl VmDataUpdate {
    pub fn is_empty(&self) -> bool {
        self.cpu_count.is_none() && self.memory_mb.is_none() && self.guest_os.is_none()
    }
}
