//! In-memory store implementing every repository trait.
//!
//! Enforces the same uniqueness constraints as the PostgreSQL schema so
//! that race handling can be exercised without a database.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Error, Result};

use super::{
    NewVApp, NewVm, Organization, OrganizationRepository, VApp, VAppRepository, VAppStatus, Vdc,
    VdcRepository, Vm, VmDataUpdate, VmRepository,
};

#[derive(Default)]
struct Tables {
    organizations: HashMap<Uuid, Organization>,
    vdcs: HashMap<Uuid, Vdc>,
    vapps: HashMap<Uuid, VApp>,
    vms: HashMap<Uuid, Vm>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        // A poisoned lock only means a test panicked mid-write; the data is
        // still usable for the remaining assertions.
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert_organization(&self, org: Organization) {
        self.lock().organizations.insert(org.id, org);
    }

    pub fn insert_vdc(&self, vdc: Vdc) {
        self.lock().vdcs.insert(vdc.id, vdc);
    }

    pub fn insert_vapp(&self, vapp: VApp) {
        self.lock().vapps.insert(vapp.id, vapp);
    }

    pub fn insert_vm(&self, vm: Vm) {
        self.lock().vms.insert(vm.id, vm);
    }

    /// Remove a VM row, as an administrator purging it would.
    pub fn remove_vm(&self, id: Uuid) {
        self.lock().vms.remove(&id);
    }

    /// Backdate a VM's `updated_at`, e.g. to step outside the staleness window.
    pub fn set_vm_updated_at(&self, id: Uuid, at: DateTime<Utc>) {
        if let Some(vm) = self.lock().vms.get_mut(&id) {
            vm.updated_at = at;
        }
    }

    pub fn vm_count(&self) -> usize {
        self.lock().vms.len()
    }

    pub fn vapp_count(&self) -> usize {
        self.lock().vapps.len()
    }

    pub fn vapps(&self) -> Vec<VApp> {
        self.lock().vapps.values().cloned().collect()
    }
}

#[async_trait]
impl OrganizationRepository for MemoryStore {
    async fn get_organization(&self, id: Uuid) -> Result<Option<Organization>> {
        Ok(self.lock().organizations.get(&id).cloned())
    }

    async fn list_organizations(&self) -> Result<Vec<Organization>> {
        Ok(self.lock().organizations.values().cloned().collect())
    }
}

#[async_trait]
impl VdcRepository for MemoryStore {
    async fn get_vdc(&self, id: Uuid) -> Result<Option<Vdc>> {
        Ok(self.lock().vdcs.get(&id).cloned())
    }

    async fn get_vdc_by_namespace(&self, namespace: &str) -> Result<Option<Vdc>> {
        Ok(self
            .lock()
            .vdcs
            .values()
            .find(|v| !v.is_deleted() && v.namespace_name() == Some(namespace))
            .cloned())
    }

    async fn list_vdcs(&self) -> Result<Vec<Vdc>> {
        Ok(self.lock().vdcs.values().cloned().collect())
    }
}

#[async_trait]
impl VAppRepository for MemoryStore {
    async fn get_vapp(&self, id: Uuid) -> Result<Option<VApp>> {
        Ok(self.lock().vapps.get(&id).cloned())
    }

    async fn get_vapp_by_name(&self, vdc_id: Uuid, name: &str) -> Result<Option<VApp>> {
        Ok(self
            .lock()
            .vapps
            .values()
            .find(|a| a.vdc_id == vdc_id && a.name == name)
            .cloned())
    }

    async fn create_vapp(&self, new: NewVApp) -> Result<VApp> {
        let mut tables = self.lock();
        if tables
            .vapps
            .values()
            .any(|a| a.vdc_id == new.vdc_id && a.name == new.name)
        {
            return Err(Error::already_exists(format!(
                "vapp {} in vdc {}",
                new.name, new.vdc_id
            )));
        }
        let now = Utc::now();
        let vapp = VApp {
            id: Uuid::new_v4(),
            name: new.name,
            vdc_id: new.vdc_id,
            status: new.status,
            description: new.description,
            created_at: now,
            updated_at: now,
        };
        tables.vapps.insert(vapp.id, vapp.clone());
        Ok(vapp)
    }

    async fn update_vapp_status(&self, id: Uuid, status: VAppStatus) -> Result<bool> {
        Ok(match self.lock().vapps.get_mut(&id) {
            Some(vapp) => {
                vapp.status = status;
                vapp.updated_at = Utc::now();
                true
            }
            None => false,
        })
    }
}

#[async_trait]
impl VmRepository for MemoryStore {
    async fn get_vm(&self, id: Uuid) -> Result<Option<Vm>> {
        Ok(self.lock().vms.get(&id).cloned())
    }

    async fn get_vm_by_vapp_and_name(&self, vapp_id: Uuid, vm_name: &str) -> Result<Option<Vm>> {
        Ok(self
            .lock()
            .vms
            .values()
            .find(|v| v.vapp_id == vapp_id && v.vm_name == vm_name)
            .cloned())
    }

    async fn get_vm_by_namespace_and_name(
        &self,
        namespace: &str,
        vm_name: &str,
    ) -> Result<Option<Vm>> {
        Ok(self
            .lock()
            .vms
            .values()
            .find(|v| v.namespace == namespace && v.vm_name == vm_name)
            .cloned())
    }

    async fn list_vms(&self) -> Result<Vec<Vm>> {
        Ok(self.lock().vms.values().cloned().collect())
    }

    async fn list_vms_by_vapp(&self, vapp_id: Uuid) -> Result<Vec<Vm>> {
        Ok(self
            .lock()
            .vms
            .values()
            .filter(|v| v.vapp_id == vapp_id)
            .cloned()
            .collect())
    }

    async fn create_vm(&self, new: NewVm) -> Result<Vm> {
        let mut tables = self.lock();
        if tables.vms.values().any(|v| {
            v.vm_name == new.vm_name && (v.namespace == new.namespace || v.vapp_id == new.vapp_id)
        }) {
            return Err(Error::already_exists(format!(
                "vm {}/{}",
                new.namespace, new.vm_name
            )));
        }
        let now = Utc::now();
        let vm = Vm {
            id: Uuid::new_v4(),
            name: new.name,
            vm_name: new.vm_name,
            namespace: new.namespace,
            vapp_id: new.vapp_id,
            status: new.status,
            cpu_count: None,
            memory_mb: None,
            guest_os: None,
            created_at: now,
            updated_at: now,
        };
        tables.vms.insert(vm.id, vm.clone());
        Ok(vm)
    }

    async fn update_vm_status(&self, id: Uuid, status: &str) -> Result<bool> {
        Ok(match self.lock().vms.get_mut(&id) {
            Some(vm) => {
                vm.status = status.to_string();
                vm.updated_at = Utc::now();
                true
            }
            None => false,
        })
    }

    async fn update_vm_data(&self, id: Uuid, data: &VmDataUpdate) -> Result<bool> {
        Ok(match self.lock().vms.get_mut(&id) {
            Some(vm) => {
                if let Some(cpu) = data.cpu_count {
                    vm.cpu_count = Some(cpu);
                }
                if let Some(mem) = data.memory_mb {
                    vm.memory_mb = Some(mem);
                }
                if let Some(ref os) = data.guest_os {
                    vm.guest_os = Some(os.clone());
                }
                true
            }
            None => false,
        })
    }
}
