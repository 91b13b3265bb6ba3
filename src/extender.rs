use k8s_openapi::api::core::v1::{Node, Pod};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Request body the orchestrator's scheduler sends to `filter`/`prioritize`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExtenderArgs {
    pub pod: Pod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<NodeListWrapper>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodenames: Option<Vec<String>>,
}

/// `v1.NodeList`-shaped wrapper; only the `items` field is read.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeListWrapper {
    #[serde(default)]
    pub items: Vec<Node>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtenderFilterResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodes: Option<NodeListWrapper>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodenames: Option<Vec<String>>,
    #[serde(rename = "failedNodes", skip_serializing_if = "HashMap::is_empty")]
    pub failed_nodes: HashMap<String, String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostPriority {
    pub host: String,
    pub score: i64,
}

pub type HostPriorityList = Vec<HostPriority>;

/// The bind endpoint uses the extender API's PascalCase JSON field
/// convention, unlike `filter`/`prioritize`.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtenderBindingArgs {
    #[serde(rename = "PodName")]
    pub pod_name: String,
    #[serde(rename = "PodNamespace")]
    pub pod_namespace: String,
    #[serde(rename = "PodUID")]
    pub pod_uid: String,
    #[serde(rename = "Node")]
    pub node: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtenderBindingResult {
    #[serde(rename = "Error", skip_serializing_if = "String::is_empty")]
    pub error: String,
}

pub const TELEMETRY_POLICY_LABEL: &str = "telemetry-policy";

/// The policy name a pod references, if any, via the well-known label.
pub fn referenced_policy(pod: &Pod) -> Option<String> {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(TELEMETRY_POLICY_LABEL))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn test_referenced_policy_present() {
        let pod = Pod {
            metadata: ObjectMeta {
                labels: Some([(TELEMETRY_POLICY_LABEL.to_string(), "low-memory".to_string())].into_iter().collect()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(referenced_policy(&pod), Some("low-memory".to_string()));
    }

    #[test]
    fn test_referenced_policy_absent() {
        let pod = Pod::default();
        assert_eq!(referenced_policy(&pod), None);
    }

    #[test]
    fn test_extender_binding_args_uses_pascal_case_fields() {
        let raw = r#"{"PodName":"p","PodNamespace":"ns","PodUID":"uid-1","Node":"node-1"}"#;
        let args: ExtenderBindingArgs = serde_json::from_str(raw).unwrap();
        assert_eq!(args.pod_name, "p");
        assert_eq!(args.node, "node-1");
    }
}
