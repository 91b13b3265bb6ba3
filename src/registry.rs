use std::collections::{HashMap, HashSet};
use std::time::Duration;

use futures::future::join_all;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use crate::cache::{MetricCache, MetricSourceClient};
use crate::crd::PolicyStrategy;
use crate::strategy::{violated_nodes, Strategy, StrategyKind};

const FIELD_MANAGER: &str = "telemetry-aware-scheduler";

/* ============================= REGISTRY ============================= */

/// Strategies currently registered, keyed by kind. `add_strategy` replaces
/// any existing instance for which `Strategy::equals` holds, giving
/// update-in-place semantics for CRD edits.
#[derive(Default)]
pub struct StrategyRegistry {
    strategies: HashMap<StrategyKind, Vec<Strategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        let mut strategies = HashMap::new();
        for kind in StrategyKind::ALL {
            strategies.insert(kind, Vec::new());
        }
        Self { strategies }
    }

    pub fn add_strategy(&mut self, strategy: Strategy) {
        let kind = strategy.kind();
        let bucket = self.strategies.entry(kind).or_default();
        bucket.retain(|existing| !existing.equals(&strategy));
        bucket.push(strategy);
    }

    /// Remove every strategy (of any kind) registered under `policy_name`.
    pub fn remove_strategy(&mut self, policy_name: &str) {
        for bucket in self.strategies.values_mut() {
            bucket.retain(|s| s.policy_name() != policy_name);
        }
    }

    pub fn get(&self, kind: StrategyKind) -> &[Strategy] {
        self.strategies
            .get(&kind)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn count(&self, kind: StrategyKind) -> usize {
        self.get(kind).len()
    }

    pub fn referenced_metric_names(&self) -> HashSet<String> {
        self.strategies
            .values()
            .flatten()
            .flat_map(|s| s.inner().rules.iter().map(|r| r.metricname.clone()))
            .collect()
    }
}

/* ============================= ENFORCE RESULT ============================= */

#[derive(Debug, Default)]
pub struct EnforceResult {
    /// Total count of node violations found across the reconciled
    /// strategies, not the count of nodes successfully patched — every
    /// cluster node gets a patch each tick (to null out stale labels), so
    /// the two numbers are not the same thing.
    pub nodes_patched: u32,
    pub errors: Vec<String>,
}

/* ============================= DESCHEDULE / LABELING ENFORCEMENT ============================= */

/// Reconcile `<policyName>=violating` labels for every registered
/// deschedule strategy, one merge-patch per node (Open Question (i)).
pub async fn enforce_deschedule(
    client: &Client,
    cache: &MetricCache,
    strategies: &[PolicyStrategy],
) -> EnforceResult {
    enforce_violation_labels(client, cache, strategies, |p| p.policy_name.clone(), |_| "violating".to_string())
        .await
}

/// Reconcile arbitrary `key=value` labels for every registered labeling
/// strategy. Labels come from the union of all rule `labels` entries on a
/// strategy; they are applied when the strategy as a whole is violated for
/// a node, and removed (set to `null`) otherwise.
pub async fn enforce_labeling(
    client: &Client,
    cache: &MetricCache,
    strategies: &[PolicyStrategy],
) -> EnforceResult {
    let mut result = EnforceResult::default();

    let violations: Vec<(Vec<(String, String)>, HashSet<String>)> = join_all(strategies.iter().map(|s| async move {
        let labels: Vec<(String, String)> = s
            .rules
            .iter()
            .flat_map(|r| r.labels.iter())
            .filter_map(|kv| kv.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        (labels, violated_nodes(cache, s).await)
    }))
    .await;

    if violations.iter().all(|(labels, _)| labels.is_empty()) {
        return result;
    }

    result.nodes_patched = violations
        .iter()
        .filter(|(labels, _)| !labels.is_empty())
        .map(|(_, violating)| violating.len() as u32)
        .sum();

    let nodes_api: Api<Node> = Api::all(client.clone());
    let nodes = match nodes_api.list(&Default::default()).await {
        Ok(list) => list,
        Err(e) => {
            result.errors.push(format!("failed to list nodes: {e}"));
            return result;
        }
    };

    for node in &nodes.items {
        let node_name = node.name_any();
        let mut label_patch = serde_json::Map::new();
        let mut any = false;

        for (labels, violating) in &violations {
            let is_violating = violating.contains(&node_name);
            for (key, value) in labels {
                any = true;
                if is_violating {
                    label_patch.insert(key.clone(), serde_json::Value::String(value.clone()));
                } else {
                    label_patch.insert(key.clone(), serde_json::Value::Null);
                }
            }
        }

        if !any {
            continue;
        }

        if let Err(e) = patch_node_labels(&nodes_api, &node_name, label_patch).await {
            warn!(node = %node_name, error = %e, "node_label_patch_failed");
            result.errors.push(format!("{node_name}: {e}"));
        }
    }

    result
}

async fn enforce_violation_labels(
    client: &Client,
    cache: &MetricCache,
    strategies: &[PolicyStrategy],
    label_key: impl Fn(&PolicyStrategy) -> String,
    label_value: impl Fn(&PolicyStrategy) -> String,
) -> EnforceResult {
    let mut result = EnforceResult::default();
    if strategies.is_empty() {
        return result;
    }

    let violations: Vec<(String, String, HashSet<String>)> = join_all(strategies.iter().map(|s| async move {
        (label_key(s), label_value(s), violated_nodes(cache, s).await)
    }))
    .await;

    result.nodes_patched = violations.iter().map(|(_, _, violating)| violating.len() as u32).sum();

    let nodes_api: Api<Node> = Api::all(client.clone());
    let nodes = match nodes_api.list(&Default::default()).await {
        Ok(list) => list,
        Err(e) => {
            result.errors.push(format!("failed to list nodes: {e}"));
            return result;
        }
    };

    for node in &nodes.items {
        let node_name = node.name_any();
        let mut label_patch = serde_json::Map::new();

        for (key, value, violating) in &violations {
            if violating.contains(&node_name) {
                label_patch.insert(key.clone(), serde_json::Value::String(value.clone()));
            } else {
                label_patch.insert(key.clone(), serde_json::Value::Null);
            }
        }

        if let Err(e) = patch_node_labels(&nodes_api, &node_name, label_patch).await {
            warn!(node = %node_name, error = %e, "node_label_patch_failed");
            result.errors.push(format!("{node_name}: {e}"));
        }
    }

    result
}

async fn patch_node_labels(
    nodes_api: &Api<Node>,
    node_name: &str,
    labels: serde_json::Map<String, serde_json::Value>,
) -> Result<(), kube::Error> {
    let patch = serde_json::json!({ "metadata": { "labels": labels } });
    nodes_api
        .patch(
            node_name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
    Ok(())
}

/* ============================= ENFORCER LOOP ============================= */

/// Runs one enforcement pass per kind that has a non-trivial `Enforce`
/// (deschedule, labeling). All reconciliations for a tick complete before
/// the next tick starts.
pub async fn enforce_registered_strategies(
    registry: &RwLock<StrategyRegistry>,
    client: &Client,
    cache: &MetricCache,
) -> EnforceResult {
    let (deschedule, labeling): (Vec<PolicyStrategy>, Vec<PolicyStrategy>) = {
        let reg = registry.read().await;
        (
            reg.get(StrategyKind::Deschedule)
                .iter()
                .map(|s| s.inner().clone())
                .collect(),
            reg.get(StrategyKind::Labeling)
                .iter()
                .map(|s| s.inner().clone())
                .collect(),
        )
    };

    let deschedule_result = enforce_deschedule(client, cache, &deschedule).await;
    let labeling_result = enforce_labeling(client, cache, &labeling).await;

    EnforceResult {
        nodes_patched: deschedule_result.nodes_patched + labeling_result.nodes_patched,
        errors: deschedule_result
            .errors
            .into_iter()
            .chain(labeling_result.errors)
            .collect(),
    }
}

pub async fn run_enforcer(
    registry: std::sync::Arc<RwLock<StrategyRegistry>>,
    client: Client,
    cache: MetricCache,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let result = enforce_registered_strategies(&registry, &client, &cache).await;
                info!(
                    nodes_patched = result.nodes_patched,
                    errors = result.errors.len(),
                    "enforcer_tick_complete"
                );
                for err in &result.errors {
                    warn!(error = %err, "enforcer_tick_error");
                }
            }
            _ = shutdown.recv() => {
                info!("enforcer_stopped");
                break;
            }
        }
    }
}

/* ============================= METRIC PULLER ============================= */

/// Refreshes the cache for every metric name referenced by a registered
/// strategy. Metrics no longer referenced by any strategy are simply not
/// refreshed again; they age out of relevance even though still in the map.
pub async fn run_metric_puller(
    registry: std::sync::Arc<RwLock<StrategyRegistry>>,
    source: MetricSourceClient,
    cache: MetricCache,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let names = registry.read().await.referenced_metric_names();
                for name in names {
                    match source.fetch_metric(&name).await {
                        Ok(values) => cache.write_metric(&name, values).await,
                        Err(e) => warn!(metric = %name, error = %e, "metric_pull_failed"),
                    }
                }
                info!("metric_pull_tick_complete");
            }
            _ = shutdown.recv() => {
                info!("metric_puller_stopped");
                break;
            }
        }
    }
}

/* ============================= TESTS ============================= */
