//! Persistence boundary.
//!
//! One capability trait per entity kind. "Not found" is `Ok(None)`, never an
//! error; creates fail with [`Error::AlreadyExists`](crate::error::Error)
//! when a uniqueness constraint is hit; conditional updates report whether a
//! row was affected.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;

pub mod memory;
pub mod models;

pub use models::{NewVApp, NewVm, Organization, VApp, VAppStatus, Vdc, Vm, VmDataUpdate};

#[async_trait]
pub trait OrganizationRepository: Send + Sync {
    async fn get_organization(&self, id: Uuid) -> Result<Option<Organization>>;

    /// All organizations, soft-deleted ones included.
    async fn list_organizations(&self) -> Result<Vec<Organization>>;
}

#[async_trait]
pub trait VdcRepository: Send + Sync {
    async fn get_vdc(&self, id: Uuid) -> Result<Option<Vdc>>;

    /// The non-deleted VDC bound to `namespace`.
    async fn get_vdc_by_namespace(&self, namespace: &str) -> Result<Option<Vdc>>;

    /// All VDCs, soft-deleted ones included.
    async fn list_vdcs(&self) -> Result<Vec<Vdc>>;
}

#[async_trait]
pub trait VAppRepository: Send + Sync {
    async fn get_vapp(&self, id: Uuid) -> Result<Option<VApp>>;

    async fn get_vapp_by_name(&self, vdc_id: Uuid, name: &str) -> Result<Option<VApp>>;

    async fn create_vapp(&self, new: NewVApp) -> Result<VApp>;

    /// Set status and touch `updated_at`. Returns false if the row is gone.
    async fn update_vapp_status(&self, id: Uuid, status: VAppStatus) -> Result<bool>;
}

#[async_trait]
pub trait VmRepository: Send + Sync {
    async fn get_vm(&self, id: Uuid) -> Result<Option<Vm>>;

    async fn get_vm_by_vapp_and_name(&self, vapp_id: Uuid, vm_name: &str) -> Result<Option<Vm>>;

    async fn get_vm_by_namespace_and_name(
        &self,
        namespace: &str,
        vm_name: &str,
    ) -> Result<Option<Vm>>;

    async fn list_vms(&self) -> Result<Vec<Vm>>;

    async fn list_vms_by_vapp(&self, vapp_id: Uuid) -> Result<Vec<Vm>>;

    async fn create_vm(&self, new: NewVm) -> Result<Vm>;

    /// Set status and touch `updated_at`. Returns false if the row is gone.
    async fn update_vm_status(&self, id: Uuid, status: &str) -> Result<bool>;

    /// Write only the `Some` fields of `data`; `updated_at` is not touched.
    /// Returns false if the row is gone.
    async fn update_vm_data(&self, id: Uuid, data: &VmDataUpdate) -> Result<bool>;
}

/// The four repositories handed to every controller.
#[derive(Clone)]
pub struct Repositories {
    pub organizations: Arc<dyn OrganizationRepository>,
    pub vdcs: Arc<dyn VdcRepository>,
    pub vapps: Arc<dyn VAppRepository>,
    pub vms: Arc<dyn VmRepository>,
}

impl Repositories {
    /// Use one store for every entity kind.
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: OrganizationRepository + VdcRepository + VAppRepository + VmRepository + 'static,
    {
        Self {
            organizations: store.clone(),
            vdcs: store.clone(),
            vapps: store.clone(),
            vms: store,
        }
    }
}
