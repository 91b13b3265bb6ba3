use std::collections::HashSet;

use crate::cache::MetricCache;
use crate::crd::{LogicalOperator, PolicyRule, PolicyStrategy, RuleOperator};

/* ============================= KIND ============================= */

/// The four strategy kinds a `TelemetryPolicy` can register. Replaces the
/// original's interface-with-type-assertion dispatch with a plain tagged
/// enum, matched everywhere instead of invoked through dynamic dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    DontSchedule,
    ScheduleOnMetric,
    Deschedule,
    Labeling,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 4] = [
        StrategyKind::DontSchedule,
        StrategyKind::ScheduleOnMetric,
        StrategyKind::Deschedule,
        StrategyKind::Labeling,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StrategyKind::DontSchedule => "dontschedule",
            StrategyKind::ScheduleOnMetric => "scheduleonmetric",
            StrategyKind::Deschedule => "deschedule",
            StrategyKind::Labeling => "labeling",
        }
    }
}

/* ============================= STRATEGY ============================= */

/// One registered strategy instance, tagged by kind and carrying its
/// declarative rule set.
#[derive(Debug, Clone, PartialEq)]
pub enum Strategy {
    DontSchedule(PolicyStrategy),
    ScheduleOnMetric(PolicyStrategy),
    Deschedule(PolicyStrategy),
    Labeling(PolicyStrategy),
}

impl Strategy {
    pub fn from_kind(kind: StrategyKind, inner: PolicyStrategy) -> Strategy {
        match kind {
            StrategyKind::DontSchedule => Strategy::DontSchedule(inner),
            StrategyKind::ScheduleOnMetric => Strategy::ScheduleOnMetric(inner),
            StrategyKind::Deschedule => Strategy::Deschedule(inner),
            StrategyKind::Labeling => Strategy::Labeling(inner),
        }
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            Strategy::DontSchedule(_) => StrategyKind::DontSchedule,
            Strategy::ScheduleOnMetric(_) => StrategyKind::ScheduleOnMetric,
            Strategy::Deschedule(_) => StrategyKind::Deschedule,
            Strategy::Labeling(_) => StrategyKind::Labeling,
        }
    }

    pub fn inner(&self) -> &PolicyStrategy {
        match self {
            Strategy::DontSchedule(s)
            | Strategy::ScheduleOnMetric(s)
            | Strategy::Deschedule(s)
            | Strategy::Labeling(s) => s,
        }
    }

    pub fn policy_name(&self) -> &str {
        &self.inner().policy_name
    }

    /// Equal iff same kind, same policy name, same rules in order — see
    /// Open Question (ii) for why this stays uniform across kinds even
    /// though `scheduleonmetric` only reads `rules[0]`.
    pub fn equals(&self, other: &Strategy) -> bool {
        self.kind() == other.kind() && self.inner() == other.inner()
    }

    /// Nodes currently matching this strategy's rules. `scheduleonmetric`
    /// never violates — it only scores, via `prioritize_order`.
    pub async fn violated(&self, cache: &MetricCache) -> HashSet<String> {
        match self {
            Strategy::DontSchedule(s) | Strategy::Deschedule(s) | Strategy::Labeling(s) => {
                violated_nodes(cache, s).await
            }
            Strategy::ScheduleOnMetric(_) => HashSet::new(),
        }
    }
}

/* ============================= RULE EVALUATION ============================= */

pub fn evaluate_rule(value: i64, rule: &PolicyRule) -> bool {
    match rule.operator {
        RuleOperator::Equals => value == rule.target,
        RuleOperator::LessThan => value < rule.target,
        RuleOperator::GreaterThan => value > rule.target,
    }
}

/// Nodes violating `strategy`: the set of rules is combined per
/// `logical_operator`, and a node missing a referenced metric never
/// satisfies that rule (so it counts against `allOf`, never against
/// `anyOf`).
pub async fn violated_nodes(cache: &MetricCache, strategy: &PolicyStrategy) -> HashSet<String> {
    if strategy.rules.is_empty() {
        return HashSet::new();
    }

    let mut infos = Vec::with_capacity(strategy.rules.len());
    for rule in &strategy.rules {
        infos.push(cache.read_metric(&rule.metricname).await);
    }

    let mut candidate_nodes: HashSet<String> = HashSet::new();
    for info in infos.iter().flatten() {
        candidate_nodes.extend(info.keys().cloned());
    }

    let mut violating = HashSet::new();
    for node in candidate_nodes {
        let mut satisfied = Vec::with_capacity(strategy.rules.len());
        for (rule, info) in strategy.rules.iter().zip(infos.iter()) {
            let ok = info
                .as_ref()
                .and_then(|m| m.get(&node))
                .map(|metric| evaluate_rule(metric.value, rule))
                .unwrap_or(false);
            satisfied.push(ok);
        }

        let violates = match strategy.logical_operator {
            LogicalOperator::AllOf => satisfied.iter().all(|ok| *ok),
            LogicalOperator::AnyOf => satisfied.iter().any(|ok| *ok),
        };

        if violates {
            violating.insert(node);
        }
    }

    violating
}

/// Prioritize-time ordering for a `scheduleonmetric` strategy: only the
/// first rule's metric and operator direction matter. Returns nodes sorted
/// so index 0 should receive the top score, ties broken by name.
pub fn prioritize_order(
    nodes: &[String],
    metric: &std::collections::HashMap<String, crate::cache::NodeMetric>,
    rule: &PolicyRule,
) -> Vec<(String, Option<i64>)> {
    let mut scored: Vec<(String, Option<i64>)> = nodes
        .iter()
        .map(|n| (n.clone(), metric.get(n).map(|m| m.value)))
        .collect();

    let ascending = matches!(rule.operator, RuleOperator::LessThan);

    scored.sort_by(|(name_a, val_a), (name_b, val_b)| {
        use std::cmp::Ordering;
        match (val_a, val_b) {
            (Some(a), Some(b)) => {
                let ord = if ascending { a.cmp(b) } else { b.cmp(a) };
                ord.then_with(|| name_a.cmp(name_b))
            }
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => name_a.cmp(name_b),
        }
    });

    scored
}

/// Map a rank (0 = best) among `total` candidates to a [0,10] score.
/// Nodes with no known value score 0 regardless of rank.
pub fn rank_to_score(rank: usize, total: usize, has_value: bool) -> i64 {
    if !has_value || total <= 1 {
        return if has_value && total <= 1 { 10 } else { 0 };
    }
    let numerator = (total - 1 - rank) as i64 * 10;
    numerator / (total as i64 - 1)
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NodeMetric;
    use std::collections::HashMap;
    use std::time::Duration;

    fn rule(metric: &str, op: RuleOperator, target: i64) -> PolicyRule {
        PolicyRule {
            metricname: metric.to_string(),
            operator: op,
            target,
            labels: vec![],
        }
    }

    #[test]
    fn test_evaluate_rule_less_than() {
        assert!(evaluate_rule(100, &rule("m", RuleOperator::LessThan, 1000)));
        assert!(!evaluate_rule(10000, &rule("m", RuleOperator::LessThan, 10)));
    }

    #[test]
    fn test_evaluate_rule_greater_than_strict() {
        assert!(!evaluate_rule(100, &rule("m", RuleOperator::GreaterThan, 100)));
        assert!(evaluate_rule(101, &rule("m", RuleOperator::GreaterThan, 100)));
    }

    #[test]
    fn test_evaluate_rule_equals() {
        assert!(evaluate_rule(5, &rule("m", RuleOperator::Equals, 5)));
        assert!(!evaluate_rule(6, &rule("m", RuleOperator::Equals, 5)));
    }

    #[tokio::test]
    async fn test_violated_nodes_all_of_requires_every_rule() {
        let cache = MetricCache::new();
        let mut mem = HashMap::new();
        mem.insert(
            "node-1".to_string(),
            NodeMetric { value: 100, timestamp: chrono::Utc::now(), window: Duration::from_secs(60) },
        );
        cache.write_metric("memory", mem).await;

        let mut cpu = HashMap::new();
        cpu.insert(
            "node-1".to_string(),
            NodeMetric { value: 5, timestamp: chrono::Utc::now(), window: Duration::from_secs(60) },
        );
        cache.write_metric("cpu", cpu).await;

        let strategy = PolicyStrategy {
            policy_name: "p".to_string(),
            logical_operator: LogicalOperator::AllOf,
            rules: vec![
                rule("memory", RuleOperator::GreaterThan, 1),
                rule("cpu", RuleOperator::GreaterThan, 100),
            ],
        };

        let violating = violated_nodes(&cache, &strategy).await;
        assert!(violating.is_empty());
    }

    #[tokio::test]
    async fn test_violated_nodes_any_of() {
        let cache = MetricCache::new();
        let mut mem = HashMap::new();
        mem.insert(
            "node-1".to_string(),
            NodeMetric { value: 100, timestamp: chrono::Utc::now(), window: Duration::from_secs(60) },
        );
        cache.write_metric("memory", mem).await;

        let strategy = PolicyStrategy {
            policy_name: "p".to_string(),
            logical_operator: LogicalOperator::AnyOf,
            rules: vec![
                rule("memory", RuleOperator::GreaterThan, 1),
                rule("missing", RuleOperator::GreaterThan, 1),
            ],
        };

        let violating = violated_nodes(&cache, &strategy).await;
        assert!(violating.contains("node-1"));
    }

    #[tokio::test]
    async fn test_violated_nodes_missing_metric_never_satisfies() {
        let cache = MetricCache::new();
        let strategy = PolicyStrategy {
            policy_name: "p".to_string(),
            logical_operator: LogicalOperator::AllOf,
            rules: vec![rule("absent", RuleOperator::GreaterThan, 1)],
        };
        assert!(violated_nodes(&cache, &strategy).await.is_empty());
    }

    #[tokio::test]
    async fn test_scheduleonmetric_never_violates() {
        let cache = MetricCache::new();
        let strat = Strategy::ScheduleOnMetric(PolicyStrategy {
            policy_name: "p".to_string(),
            logical_operator: LogicalOperator::AllOf,
            rules: vec![rule("m", RuleOperator::GreaterThan, 0)],
        });
        assert!(strat.violated(&cache).await.is_empty());
    }

    #[test]
    fn test_equals_reflexive_and_kind_sensitive() {
        let inner = PolicyStrategy {
            policy_name: "p".to_string(),
            logical_operator: LogicalOperator::AllOf,
            rules: vec![rule("m", RuleOperator::Equals, 1)],
        };
        let a = Strategy::Deschedule(inner.clone());
        let b = Strategy::Deschedule(inner.clone());
        let c = Strategy::Labeling(inner);

        assert!(a.equals(&b));
        assert!(b.equals(&a));
        assert!(!a.equals(&c));
    }

    #[test]
    fn test_prioritize_order_less_than_ascending() {
        let mut metric = HashMap::new();
        metric.insert("a".to_string(), NodeMetric { value: 100, timestamp: chrono::Utc::now(), window: Duration::from_secs(60) });
        metric.insert("b".to_string(), NodeMetric { value: 200, timestamp: chrono::Utc::now(), window: Duration::from_secs(60) });
        metric.insert("c".to_string(), NodeMetric { value: 10, timestamp: chrono::Utc::now(), window: Duration::from_secs(60) });

        let nodes = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let r = rule("m", RuleOperator::LessThan, 0);
        let ordered = prioritize_order(&nodes, &metric, &r);

        assert_eq!(ordered[0].0, "c");
        assert_eq!(ordered[1].0, "a");
        assert_eq!(ordered[2].0, "b");
    }

    #[test]
    fn test_rank_to_score_bounds() {
        assert_eq!(rank_to_score(0, 3, true), 10);
        assert_eq!(rank_to_score(2, 3, true), 0);
        assert_eq!(rank_to_score(0, 1, true), 10);
        assert_eq!(rank_to_score(0, 3, false), 0);
    }
}
