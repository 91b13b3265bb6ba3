use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/* ============================= RULE TYPES ============================= */

/// Comparison applied between a node's metric value and a rule's target.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RuleOperator {
    Equals,
    LessThan,
    GreaterThan,
}

/// How a strategy's rules combine into a single violation verdict.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum LogicalOperator {
    #[default]
    AllOf,
    AnyOf,
}

/// A single metric predicate: `metricname <operator> target`.
///
/// `labels` is only meaningful on `labeling` strategies, where each entry
/// has the form `key=value` and is applied to violating nodes.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRule {
    pub metricname: String,
    pub operator: RuleOperator,
    pub target: i64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
}

impl Default for RuleOperator {
    fn default() -> Self {
        RuleOperator::Equals
    }
}

/// A named set of rules combined by `logical_operator`, backing one
/// strategy kind of one `TelemetryPolicy`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStrategy {
    pub policy_name: String,

    #[serde(default)]
    pub logical_operator: LogicalOperator,

    pub rules: Vec<PolicyRule>,
}

/// The four strategy kinds a `TelemetryPolicy` may declare. Any subset may
/// be omitted; an absent kind registers nothing for that policy.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StrategyMap {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dontschedule: Option<PolicyStrategy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduleonmetric: Option<PolicyStrategy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deschedule: Option<PolicyStrategy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labeling: Option<PolicyStrategy>,
}

/* ============================= SPEC ============================= */

/// TelemetryPolicy declares node-metric-driven scheduling strategies.
///
/// Each populated field of `strategies` registers one strategy instance
/// with the running enforcer; removing a field (or the whole object)
/// unregisters it.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "telemetry.stochastic.io",
    version = "v1",
    kind = "TelemetryPolicy",
    plural = "telemetrypolicies",
    status = "TelemetryPolicyStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryPolicySpec {
    pub strategies: StrategyMap,
}

/* ============================= STATUS ============================= */

/// TelemetryPolicyStatus reports what the controller last registered.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryPolicyStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Number of strategy kinds registered from this policy (0-4).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategies_registered: Option<i32>,

    /// RFC3339 timestamp of the last enforcer tick that considered this policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_enforced: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    fn sample_rule(name: &str, op: RuleOperator, target: i64) -> PolicyRule {
        PolicyRule {
            metricname: name.to_string(),
            operator: op,
            target,
            labels: vec![],
        }
    }

    #[test]
    fn test_crd_generates_valid_yaml() {
        let crd = TelemetryPolicy::crd();
        let yaml = serde_yaml::to_string(&crd).expect("CRD should serialize to YAML");
        assert!(yaml.contains("telemetry.stochastic.io"));
        assert!(yaml.contains("TelemetryPolicy"));
        assert!(yaml.contains("telemetrypolicies"));
    }

    #[test]
    fn test_crd_api_group() {
        let crd = TelemetryPolicy::crd();
        assert_eq!(crd.spec.group, "telemetry.stochastic.io");
    }

    #[test]
    fn test_crd_version() {
        let crd = TelemetryPolicy::crd();
        assert!(!crd.spec.versions.is_empty());
        assert_eq!(crd.spec.versions[0].name, "v1");
    }

    #[test]
    fn test_crd_is_namespaced() {
        let crd = TelemetryPolicy::crd();
        assert_eq!(crd.spec.scope, "Namespaced");
    }

    #[test]
    fn test_rule_operator_serializes_camel_case() {
        assert_eq!(
            serde_json::to_string(&RuleOperator::LessThan).unwrap(),
            r#""lessThan""#
        );
        assert_eq!(
            serde_json::to_string(&RuleOperator::GreaterThan).unwrap(),
            r#""greaterThan""#
        );
        assert_eq!(
            serde_json::to_string(&RuleOperator::Equals).unwrap(),
            r#""equals""#
        );
    }

    #[test]
    fn test_logical_operator_default_is_all_of() {
        assert_eq!(LogicalOperator::default(), LogicalOperator::AllOf);
    }

    #[test]
    fn test_strategy_map_default_all_none() {
        let map = StrategyMap::default();
        assert!(map.dontschedule.is_none());
        assert!(map.scheduleonmetric.is_none());
        assert!(map.deschedule.is_none());
        assert!(map.labeling.is_none());
    }

    #[test]
    fn test_spec_serialization_roundtrip() {
        let spec = TelemetryPolicySpec {
            strategies: StrategyMap {
                dontschedule: Some(PolicyStrategy {
                    policy_name: "gpu-pressure".to_string(),
                    logical_operator: LogicalOperator::AnyOf,
                    rules: vec![sample_rule("gpu_memory_used_percent", RuleOperator::GreaterThan, 90)],
                }),
                ..Default::default()
            },
        };

        let json = serde_json::to_string(&spec).expect("should serialize");
        let deserialized: TelemetryPolicySpec =
            serde_json::from_str(&json).expect("should deserialize");

        let strat = deserialized.strategies.dontschedule.unwrap();
        assert_eq!(strat.policy_name, "gpu-pressure");
        assert_eq!(strat.logical_operator, LogicalOperator::AnyOf);
        assert_eq!(strat.rules.len(), 1);
        assert_eq!(strat.rules[0].target, 90);
    }

    #[test]
    fn test_spec_omitted_strategies_deserialize_as_none() {
        let json = r#"{"strategies":{}}"#;
        let spec: TelemetryPolicySpec = serde_json::from_str(json).expect("should deserialize");
        assert!(spec.strategies.dontschedule.is_none());
        assert!(spec.strategies.scheduleonmetric.is_none());
    }

    #[test]
    fn test_status_default_all_none() {
        let status = TelemetryPolicyStatus::default();
        assert_eq!(status.observed_generation, None);
        assert_eq!(status.strategies_registered, None);
        assert_eq!(status.last_enforced, None);
        assert_eq!(status.message, None);
    }

    #[test]
    fn test_status_omits_none_fields_in_json() {
        let status = TelemetryPolicyStatus {
            strategies_registered: Some(2),
            ..Default::default()
        };
        let json = serde_json::to_string(&status).expect("should serialize");
        assert!(json.contains("strategiesRegistered"));
        assert!(!json.contains("observedGeneration"));
        assert!(!json.contains("lastEnforced"));
    }

    #[test]
    fn test_policy_rule_with_labels() {
        let rule = PolicyRule {
            metricname: "node_cpu_idle_percent".to_string(),
            operator: RuleOperator::LessThan,
            target: 10,
            labels: vec!["cpu-pressure=true".to_string()],
        };
        let json = serde_json::to_string(&rule).expect("should serialize");
        let deserialized: PolicyRule = serde_json::from_str(&json).expect("should deserialize");
        assert_eq!(deserialized.labels, vec!["cpu-pressure=true".to_string()]);
    }

    #[test]
    fn test_policy_rule_empty_labels_omitted() {
        let rule = sample_rule("m", RuleOperator::Equals, 1);
        let json = serde_json::to_string(&rule).expect("should serialize");
        assert!(!json.contains("labels"));
    }

    #[test]
    fn test_full_strategy_map_roundtrip() {
        let map = StrategyMap {
            dontschedule: Some(PolicyStrategy {
                policy_name: "p1".to_string(),
                logical_operator: LogicalOperator::AllOf,
                rules: vec![sample_rule("m1", RuleOperator::LessThan, 5)],
            }),
            scheduleonmetric: Some(PolicyStrategy {
                policy_name: "p1".to_string(),
                logical_operator: LogicalOperator::AllOf,
                rules: vec![sample_rule("m2", RuleOperator::GreaterThan, 5)],
            }),
            deschedule: Some(PolicyStrategy {
                policy_name: "p1".to_string(),
                logical_operator: LogicalOperator::AnyOf,
                rules: vec![sample_rule("m3", RuleOperator::Equals, 0)],
            }),
            labeling: Some(PolicyStrategy {
                policy_name: "p1".to_string(),
                logical_operator: LogicalOperator::AllOf,
                rules: vec![sample_rule("m4", RuleOperator::GreaterThan, 100)],
            }),
        };

        let json = serde_json::to_string(&map).unwrap();
        let deserialized: StrategyMap = serde_json::from_str(&json).unwrap();
        assert!(deserialized.dontschedule.is_some());
        assert!(deserialized.scheduleonmetric.is_some());
        assert!(deserialized.deschedule.is_some());
        assert!(deserialized.labeling.is_some());
    }
}
