//! Derive the vapp-name label for VMs stamped out by a template.
//!
//! Template instantiation only leaves the owning TemplateInstance UID on
//! the VM. The TemplateInstance name is the vApp name, so once the owner is
//! found the label is written back to the VM.

use kube::ResourceExt;
use tracing::{debug, info};

use crate::cluster::ClusterEvent;
use crate::crd::virtual_machine::VirtualMachine;
use crate::error::Result;
use crate::helpers::{TEMPLATE_INSTANCE_OWNER_LABEL, VAPP_NAME_LABEL};

use super::helpers::kube_object_ref;
use super::Context;

/// Returns the label value written, if any.
pub async fn derive_vapp_name_label(
    ctx: &Context,
    vm: &VirtualMachine,
) -> Result<Option<String>> {
    let labels = vm.labels();
    if labels.get(VAPP_NAME_LABEL).is_some_and(|v| !v.is_empty()) {
        return Ok(None);
    }
    let Some(owner_uid) = labels
        .get(TEMPLATE_INSTANCE_OWNER_LABEL)
        .filter(|v| !v.is_empty())
    else {
        return Ok(None);
    };

    let ns = vm.namespace().unwrap_or_default();
    let name = vm.name_any();
    let Some(instance) = ctx.cluster.find_template_instance_by_uid(owner_uid).await? else {
        debug!(%ns, %name, %owner_uid, "owning template instance not found yet");
        return Ok(None);
    };

    let vapp_name = instance.name_any();
    ctx.cluster
        .set_virtual_machine_label(&ns, &name, VAPP_NAME_LABEL, &vapp_name)
        .await?;
    info!(%ns, %name, vapp = %vapp_name, "derived vapp-name label");
    ctx.cluster
        .publish_event(
            &kube_object_ref(vm),
            &ClusterEvent::normal(
                "VAppLabelSet",
                "LabelDerivation",
                format!("Set {VAPP_NAME_LABEL}={vapp_name} from template instance"),
            ),
        )
        .await;
    Ok(Some(vapp_name))
}
