use kube::CustomResource;
use serde::{Deserialize, Serialize};

/// OpenShift record of a template having been instantiated.
/// Its name is the vApp name; its conditions drive the vApp status.
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize)]
#[kube(
    group = "template.openshift.io",
    version = "v1",
    kind = "TemplateInstance",
    namespaced,
    status = "TemplateInstanceStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct TemplateInstanceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TemplateInstanceCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TemplateInstanceStatus {
    #[serde(default)]
    pub conditions: Vec<TemplateInstanceCondition>,
}

const READY_CONDITION: &str = "Ready";
const FAILURE_CONDITION: &str = "InstantiateFailure";

impl TemplateInstance {
    fn condition_true(&self, type_: &str) -> bool {
        self.status.as_ref().is_some_and(|s| {
            s.conditions
                .iter()
                .any(|c| c.type_ == type_ && c.status == "True")
        })
    }

    pub fn is_ready(&self) -> bool {
        self.condition_true(READY_CONDITION)
    }

    pub fn has_failed(&self) -> bool {
        self.condition_true(FAILURE_CONDITION)
    }

    /// Message of the failure condition, if any.
    pub fn failure_message(&self) -> Option<&str> {
        self.status
            .as_ref()?
            .conditions
            .iter()
            .find(|c| c.type_ == FAILURE_CONDITION && c.status == "True")
            .and_then(|c| c.message.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_conditions(conds: &[(&str, &str)]) -> TemplateInstance {
        let mut ti = TemplateInstance::new("web", TemplateInstanceSpec::default());
        ti.status = Some(TemplateInstanceStatus {
            conditions: conds
                .iter()
                .map(|(t, s)| TemplateInstanceCondition {
                    type_: t.to_string(),
                    status: s.to_string(),
                    reason: None,
                    message: Some(format!("{t} is {s}")),
                })
                .collect(),
        });
        ti
    }

    #[test]
    fn conditions_must_be_true() {
        let ti = with_conditions(&[("Ready", "False"), ("InstantiateFailure", "True")]);
        assert!(!ti.is_ready());
        assert!(ti.has_failed());
        assert_eq!(ti.failure_message(), Some("InstantiateFailure is True"));
    }

    #[test]
    fn no_status_is_neither_ready_nor_failed() {
        let ti = TemplateInstance::new("web", TemplateInstanceSpec::default());
        assert!(!ti.is_ready());
        assert!(!ti.has_failed());
    }
}
