use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::{
    NewVApp, NewVm, Organization, OrganizationRepository, VApp, VAppRepository, VAppStatus, Vdc,
    VdcRepository, Vm, VmDataUpdate, VmRepository,
};

const SCHEMA: &str = include_str!("../migrations/0001_init.sql");

const ORGANIZATION_COLUMNS: &str =
    "id, name, display_name, description, enabled, namespace, deleted_at, created_at, updated_at";
const VDC_COLUMNS: &str = "id, name, organization_id, namespace, enabled, cpu_limit, \
     memory_limit_mb, storage_limit_gb, deleted_at, created_at, updated_at";
const VAPP_COLUMNS: &str = "id, name, vdc_id, status, description, created_at, updated_at";
const VM_COLUMNS: &str = "id, name, vm_name, namespace, vapp_id, status, cpu_count, memory_mb, \
     guest_os, created_at, updated_at";

/// Production repository implementation backed by tokio-postgres.
///
/// Holds one pipelined client; if the connection drops, the next call
/// reconnects.
pub struct PgStore {
    connstr: String,
    client: RwLock<Arc<Client>>,
}

impl PgStore {
    pub async fn connect(connstr: &str) -> Result<Self> {
        let client = open(connstr).await?;
        Ok(Self {
            connstr: connstr.to_string(),
            client: RwLock::new(Arc::new(client)),
        })
    }

    /// Create the tables and indexes if they do not exist yet.
    pub async fn apply_schema(&self) -> Result<()> {
        self.client().await?.batch_execute(SCHEMA).await?;
        info!("database schema applied");
        Ok(())
    }

    async fn client(&self) -> Result<Arc<Client>> {
        {
            let current = self.client.read().await;
            if !current.is_closed() {
                return Ok(current.clone());
            }
        }
        let mut slot = self.client.write().await;
        // Another task may have reconnected while we waited for the lock.
        if slot.is_closed() {
            warn!("postgres connection closed, reconnecting");
            *slot = Arc::new(open(&self.connstr).await?);
        }
        Ok(slot.clone())
    }
}

async fn open(connstr: &str) -> Result<Client> {
    let (client, connection) = tokio_postgres::connect(connstr, NoTls).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!("postgres connection error: {e}");
        }
    });
    Ok(client)
}

/// Map a unique-constraint violation to `AlreadyExists`, anything else
/// to a plain database error.
fn unique_violation(e: tokio_postgres::Error, what: String) -> Error {
    if e.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        Error::already_exists(what)
    } else {
        Error::Postgres(e)
    }
}

fn organization_from_row(row: &Row) -> Result<Organization> {
    Ok(Organization {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        display_name: row.try_get("display_name")?,
        description: row.try_get("description")?,
        enabled: row.try_get("enabled")?,
        namespace: row.try_get("namespace")?,
        deleted_at: row.try_get("deleted_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn vdc_from_row(row: &Row) -> Result<Vdc> {
    Ok(Vdc {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        organization_id: row.try_get("organization_id")?,
        namespace: row.try_get("namespace")?,
        enabled: row.try_get("enabled")?,
        cpu_limit: row.try_get("cpu_limit")?,
        memory_limit_mb: row.try_get("memory_limit_mb")?,
        storage_limit_gb: row.try_get("storage_limit_gb")?,
        deleted_at: row.try_get("deleted_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn vapp_from_row(row: &Row) -> Result<VApp> {
    let raw: String = row.try_get("status")?;
    let status = VAppStatus::parse(&raw)
        .ok_or_else(|| Error::malformed(format!("unknown vapp status {raw:?}")))?;
    Ok(VApp {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        vdc_id: row.try_get("vdc_id")?,
        status,
        description: row.try_get("description")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn vm_from_row(row: &Row) -> Result<Vm> {
    Ok(Vm {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        vm_name: row.try_get("vm_name")?,
        namespace: row.try_get("namespace")?,
        vapp_id: row.try_get("vapp_id")?,
        status: row.try_get("status")?,
        cpu_count: row.try_get("cpu_count")?,
        memory_mb: row.try_get("memory_mb")?,
        guest_os: row.try_get("guest_os")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl OrganizationRepository for PgStore {
    async fn get_organization(&self, id: Uuid) -> Result<Option<Organization>> {
        let sql = format!("SELECT {ORGANIZATION_COLUMNS} FROM organizations WHERE id = $1");
        let row = self.client().await?.query_opt(&sql, &[&id]).await?;
        row.as_ref().map(organization_from_row).transpose()
    }

    async fn list_organizations(&self) -> Result<Vec<Organization>> {
        let sql = format!("SELECT {ORGANIZATION_COLUMNS} FROM organizations ORDER BY created_at");
        let rows = self.client().await?.query(&sql, &[]).await?;
        rows.iter().map(organization_from_row).collect()
    }
}

#[async_trait]
impl VdcRepository for PgStore {
    async fn get_vdc(&self, id: Uuid) -> Result<Option<Vdc>> {
        let sql = format!("SELECT {VDC_COLUMNS} FROM vdcs WHERE id = $1");
        let row = self.client().await?.query_opt(&sql, &[&id]).await?;
        row.as_ref().map(vdc_from_row).transpose()
    }

    async fn get_vdc_by_namespace(&self, namespace: &str) -> Result<Option<Vdc>> {
        let sql = format!(
            "SELECT {VDC_COLUMNS} FROM vdcs WHERE namespace = $1 AND deleted_at IS NULL"
        );
        let row = self.client().await?.query_opt(&sql, &[&namespace]).await?;
        row.as_ref().map(vdc_from_row).transpose()
    }

    async fn list_vdcs(&self) -> Result<Vec<Vdc>> {
        let sql = format!("SELECT {VDC_COLUMNS} FROM vdcs ORDER BY created_at");
        let rows = self.client().await?.query(&sql, &[]).await?;
        rows.iter().map(vdc_from_row).collect()
    }
}

#[async_trait]
impl VAppRepository for PgStore {
    async fn get_vapp(&self, id: Uuid) -> Result<Option<VApp>> {
        let sql = format!("SELECT {VAPP_COLUMNS} FROM vapps WHERE id = $1");
        let row = self.client().await?.query_opt(&sql, &[&id]).await?;
        row.as_ref().map(vapp_from_row).transpose()
    }

    async fn get_vapp_by_name(&self, vdc_id: Uuid, name: &str) -> Result<Option<VApp>> {
        let sql = format!("SELECT {VAPP_COLUMNS} FROM vapps WHERE vdc_id = $1 AND name = $2");
        let row = self.client().await?.query_opt(&sql, &[&vdc_id, &name]).await?;
        row.as_ref().map(vapp_from_row).transpose()
    }

    async fn create_vapp(&self, new: NewVApp) -> Result<VApp> {
        let sql = format!(
            "INSERT INTO vapps (id, name, vdc_id, status, description) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {VAPP_COLUMNS}"
        );
        let row = self
            .client()
            .await?
            .query_one(
                &sql,
                &[
                    &Uuid::new_v4(),
                    &new.name,
                    &new.vdc_id,
                    &new.status.as_str(),
                    &new.description,
                ],
            )
            .await
            .map_err(|e| unique_violation(e, format!("vapp {} in vdc {}", new.name, new.vdc_id)))?;
        vapp_from_row(&row)
    }

    async fn update_vapp_status(&self, id: Uuid, status: VAppStatus) -> Result<bool> {
        let n = self
            .client()
            .await?
            .execute(
                "UPDATE vapps SET status = $2, updated_at = now() WHERE id = $1",
                &[&id, &status.as_str()],
            )
            .await?;
        Ok(n > 0)
    }
}

#[async_trait]
impl VmRepository for PgStore {
    async fn get_vm(&self, id: Uuid) -> Result<Option<Vm>> {
        let sql = format!("SELECT {VM_COLUMNS} FROM vms WHERE id = $1");
        let row = self.client().await?.query_opt(&sql, &[&id]).await?;
        row.as_ref().map(vm_from_row).transpose()
    }

    async fn get_vm_by_vapp_and_name(&self, vapp_id: Uuid, vm_name: &str) -> Result<Option<Vm>> {
        let sql = format!("SELECT {VM_COLUMNS} FROM vms WHERE vapp_id = $1 AND vm_name = $2");
        let row = self
            .client()
            .await?
            .query_opt(&sql, &[&vapp_id, &vm_name])
            .await?;
        row.as_ref().map(vm_from_row).transpose()
    }

    async fn get_vm_by_namespace_and_name(
        &self,
        namespace: &str,
        vm_name: &str,
    ) -> Result<Option<Vm>> {
        let sql = format!("SELECT {VM_COLUMNS} FROM vms WHERE namespace = $1 AND vm_name = $2");
        let row = self
            .client()
            .await?
            .query_opt(&sql, &[&namespace, &vm_name])
            .await?;
        row.as_ref().map(vm_from_row).transpose()
    }

    async fn list_vms(&self) -> Result<Vec<Vm>> {
        let sql = format!("SELECT {VM_COLUMNS} FROM vms ORDER BY created_at");
        let rows = self.client().await?.query(&sql, &[]).await?;
        rows.iter().map(vm_from_row).collect()
    }

    async fn list_vms_by_vapp(&self, vapp_id: Uuid) -> Result<Vec<Vm>> {
        let sql = format!("SELECT {VM_COLUMNS} FROM vms WHERE vapp_id = $1 ORDER BY vm_name");
        let rows = self.client().await?.query(&sql, &[&vapp_id]).await?;
        rows.iter().map(vm_from_row).collect()
    }

    async fn create_vm(&self, new: NewVm) -> Result<Vm> {
        let sql = format!(
            "INSERT INTO vms (id, name, vm_name, namespace, vapp_id, status) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING {VM_COLUMNS}"
        );
        let row = self
            .client()
            .await?
            .query_one(
                &sql,
                &[
                    &Uuid::new_v4(),
                    &new.name,
                    &new.vm_name,
                    &new.namespace,
                    &new.vapp_id,
                    &new.status,
                ],
            )
            .await
            .map_err(|e| unique_violation(e, format!("vm {}/{}", new.namespace, new.vm_name)))?;
        vm_from_row(&row)
    }

    async fn update_vm_status(&self, id: Uuid, status: &str) -> Result<bool> {
        let n = self
            .client()
            .await?
            .execute(
                "UPDATE vms SET status = $2, updated_at = now() WHERE id = $1",
                &[&id, &status],
            )
            .await?;
        Ok(n > 0)
    }

    async fn update_vm_data(&self, id: Uuid, data: &VmDataUpdate) -> Result<bool> {
        // COALESCE keeps the stored value for every field left as NULL.
        let n = self
            .client()
            .await?
            .execute(
                "UPDATE vms SET cpu_count = COALESCE($2, cpu_count), \
                 memory_mb = COALESCE($3, memory_mb), guest_os = COALESCE($4, guest_os) \
                 WHERE id = $1",
                &[&id, &data.cpu_count, &data.memory_mb, &data.guest_os],
            )
            .await?;
        Ok(n > 0)
    }
}
