//! Orchestration API boundary.
//!
//! Everything the reconcilers do against the cluster goes through
//! [`ClusterClient`] so that controller logic can be exercised against a
//! mock. Gets return `Ok(None)` on 404 and creates treat 409 as success.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, ObjectReference, ResourceQuota, ResourceQuotaSpec};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::events::{Event as KubeEvent, EventType, Recorder, Reporter};
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use serde_json::json;
use tracing::{debug, warn};

use crate::controller::helpers::FIELD_MANAGER;
use crate::crd::template_instance::TemplateInstance;
use crate::crd::virtual_machine::{VirtualMachine, VirtualMachineInstance};
use crate::error::Result;
use crate::helpers::managed_namespace_selector;

/// A human-readable event attached to a cluster object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterEvent {
    pub warning: bool,
    pub reason: String,
    pub action: String,
    pub note: Option<String>,
}

impl ClusterEvent {
    pub fn normal(reason: &str, action: &str, note: impl Into<String>) -> Self {
        Self {
            warning: false,
            reason: reason.to_string(),
            action: action.to_string(),
            note: Some(note.into()),
        }
    }

    pub fn warning(reason: &str, action: &str, note: impl Into<String>) -> Self {
        Self {
            warning: true,
            ..Self::normal(reason, action, note)
        }
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>>;

    /// Namespaces carrying the managed-by label.
    async fn list_managed_namespaces(&self) -> Result<Vec<Namespace>>;

    async fn create_namespace(&self, ns: &Namespace) -> Result<()>;

    /// Merge-patch namespace labels and annotations; a `None` value removes
    /// the key.
    async fn patch_namespace_metadata(
        &self,
        name: &str,
        labels: &BTreeMap<String, Option<String>>,
        annotations: &BTreeMap<String, Option<String>>,
    ) -> Result<()>;

    async fn delete_namespace(&self, name: &str) -> Result<()>;

    async fn get_resource_quota(&self, namespace: &str, name: &str)
        -> Result<Option<ResourceQuota>>;

    async fn create_resource_quota(&self, namespace: &str, quota: &ResourceQuota) -> Result<()>;

    /// Overwrite the quota's hard limits with exactly `hard`.
    async fn replace_resource_quota_hard(
        &self,
        namespace: &str,
        name: &str,
        hard: &BTreeMap<String, Quantity>,
    ) -> Result<()>;

    async fn create_network_policy(&self, namespace: &str, policy: &NetworkPolicy) -> Result<()>;

    async fn get_virtual_machine(&self, namespace: &str, name: &str)
        -> Result<Option<VirtualMachine>>;

    async fn get_virtual_machine_instance(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualMachineInstance>>;

    async fn set_virtual_machine_label(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<()>;

    /// Scan every namespace for the TemplateInstance with this UID.
    async fn find_template_instance_by_uid(&self, uid: &str) -> Result<Option<TemplateInstance>>;

    /// Publish an event. Failures are logged, never returned.
    async fn publish_event(&self, object: &ObjectReference, event: &ClusterEvent);
}

// ── kube-rs implementation ────────────────────────────────────────────────────

pub struct KubeClusterClient {
    client: Client,
    reporter: Reporter,
}

impl KubeClusterClient {
    pub fn new(client: Client, reporter: Reporter) -> Self {
        Self { client, reporter }
    }
}

fn is_conflict(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 409)
}

fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 404)
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn list_managed_namespaces(&self) -> Result<Vec<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let lp = ListParams::default().labels(&managed_namespace_selector());
        Ok(api.list(&lp).await?.items)
    }

    async fn create_namespace(&self, ns: &Namespace) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.create(&PostParams::default(), ns).await {
            Ok(_) => Ok(()),
            Err(e) if is_conflict(&e) => {
                debug!(name = %ns.name_any(), "namespace already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_namespace_metadata(
        &self,
        name: &str,
        labels: &BTreeMap<String, Option<String>>,
        annotations: &BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let patch = json!({
            "metadata": {
                "labels": labels,
                "annotations": annotations,
            }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_resource_quota(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ResourceQuota>> {
        let api: Api<ResourceQuota> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_resource_quota(&self, namespace: &str, quota: &ResourceQuota) -> Result<()> {
        let api: Api<ResourceQuota> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), quota).await {
            Ok(_) => Ok(()),
            Err(e) if is_conflict(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn replace_resource_quota_hard(
        &self,
        namespace: &str,
        name: &str,
        hard: &BTreeMap<String, Quantity>,
    ) -> Result<()> {
        let api: Api<ResourceQuota> = Api::namespaced(self.client.clone(), namespace);
        let mut quota = api.get(name).await?;
        quota
            .spec
            .get_or_insert_with(ResourceQuotaSpec::default)
            .hard = Some(hard.clone());
        let pp = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        api.replace(name, &pp, &quota).await?;
        Ok(())
    }

    async fn create_network_policy(&self, namespace: &str, policy: &NetworkPolicy) -> Result<()> {
        let api: Api<NetworkPolicy> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), policy).await {
            Ok(_) => Ok(()),
            Err(e) if is_conflict(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_virtual_machine(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualMachine>> {
        let api: Api<VirtualMachine> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_virtual_machine_instance(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualMachineInstance>> {
        let api: Api<VirtualMachineInstance> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn set_virtual_machine_label(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let api: Api<VirtualMachine> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "metadata": { "labels": { key: value } } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn find_template_instance_by_uid(&self, uid: &str) -> Result<Option<TemplateInstance>> {
        let api: Api<TemplateInstance> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        Ok(list
            .items
            .into_iter()
            .find(|ti| ti.metadata.uid.as_deref() == Some(uid)))
    }

    async fn publish_event(&self, object: &ObjectReference, event: &ClusterEvent) {
        let rec = Recorder::new(self.client.clone(), self.reporter.clone());
        let type_ = if event.warning {
            EventType::Warning
        } else {
            EventType::Normal
        };
        if let Err(e) = rec
            .publish(
                &KubeEvent {
                    type_,
                    reason: event.reason.clone(),
                    note: event.note.clone(),
                    action: event.action.clone(),
                    secondary: None,
                },
                object,
            )
            .await
        {
            warn!(%e, reason = %event.reason, "failed to publish event");
        }
    }
}
