use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::{Client, ResourceExt};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::crd::{PolicyStrategy, TelemetryPolicy, TelemetryPolicyStatus};
use crate::strategy::{Strategy, StrategyKind};
use crate::registry::StrategyRegistry;

const FINALIZER: &str = "telemetry.stochastic.io/cleanup";
const REQUEUE_INTERVAL: Duration = Duration::from_secs(30);
const FIELD_MANAGER: &str = "telemetry-aware-scheduler";

pub struct PolicyControllerContext {
    pub client: Client,
    pub registry: Arc<RwLock<StrategyRegistry>>,
}

/// Runs the `TelemetryPolicy` watch to completion (or until the stream
/// ends / the process is cancelled). The caller races this against its own
/// shutdown signal.
pub async fn run(ctx: Arc<PolicyControllerContext>) {
    let policies: Api<TelemetryPolicy> = Api::all(ctx.client.clone());

    Controller::new(policies, Default::default())
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            if let Err(e) = result {
                warn!(error = %e, "policy_reconcile_dispatch_error");
            }
        })
        .await;
}

async fn reconcile(
    policy: Arc<TelemetryPolicy>,
    ctx: Arc<PolicyControllerContext>,
) -> std::result::Result<Action, kube::Error> {
    let name = policy.name_any();
    let namespace = policy.namespace().unwrap_or_default();
    let generation = policy.metadata.generation;

    if policy.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&policy, &ctx).await;
    }

    if !has_finalizer(&policy) {
        add_finalizer(&policy, &ctx.client).await?;
    }

    info!(policy = %name, namespace = %namespace, "policy_reconcile_start");

    let strategies = strategies_for(&name, &policy);
    let registered = strategies.len() as i32;

    {
        let mut reg = ctx.registry.write().await;
        reg.remove_strategy(&name);
        for strategy in strategies {
            reg.add_strategy(strategy);
        }
    }

    let status = TelemetryPolicyStatus {
        observed_generation: generation,
        strategies_registered: Some(registered),
        last_enforced: Some(chrono::Utc::now().to_rfc3339()),
        message: Some(format!("{registered} strategies registered")),
    };

    let status_patch = serde_json::json!({ "status": status });
    let api: Api<TelemetryPolicy> = Api::namespaced(ctx.client.clone(), &namespace);
    api.patch_status(
        &name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&status_patch),
    )
    .await?;

    info!(policy = %name, namespace = %namespace, registered, "policy_reconcile_done");

    Ok(Action::requeue(REQUEUE_INTERVAL))
}

fn strategies_for(policy_name: &str, policy: &TelemetryPolicy) -> Vec<Strategy> {
    let strategies = &policy.spec.strategies;
    let mut out = Vec::new();

    let mut tag = |kind: StrategyKind, inner: &Option<PolicyStrategy>| {
        if let Some(s) = inner {
            let mut s = s.clone();
            s.policy_name = policy_name.to_string();
            out.push(Strategy::from_kind(kind, s));
        }
    };

    tag(StrategyKind::DontSchedule, &strategies.dontschedule);
    tag(StrategyKind::ScheduleOnMetric, &strategies.scheduleonmetric);
    tag(StrategyKind::Deschedule, &strategies.deschedule);
    tag(StrategyKind::Labeling, &strategies.labeling);

    out
}

fn error_policy(
    _policy: Arc<TelemetryPolicy>,
    error: &kube::Error,
    _ctx: Arc<PolicyControllerContext>,
) -> Action {
    warn!(error = %error, "policy_reconcile_error");
    Action::requeue(Duration::from_secs(60))
}

fn has_finalizer(policy: &TelemetryPolicy) -> bool {
    policy
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|s| s == FINALIZER))
}

async fn add_finalizer(policy: &TelemetryPolicy, client: &Client) -> std::result::Result<(), kube::Error> {
    let name = policy.name_any();
    let namespace = policy.namespace().unwrap_or_default();
    let api: Api<TelemetryPolicy> = Api::namespaced(client.clone(), &namespace);

    let patch = serde_json::json!({ "metadata": { "finalizers": [FINALIZER] } });
    api.patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;

    info!(policy = %name, "finalizer_added");
    Ok(())
}

async fn remove_finalizer(policy: &TelemetryPolicy, client: &Client) -> std::result::Result<(), kube::Error> {
    let name = policy.name_any();
    let namespace = policy.namespace().unwrap_or_default();
    let api: Api<TelemetryPolicy> = Api::namespaced(client.clone(), &namespace);

    let patch = serde_json::json!({ "metadata": { "finalizers": [] } });
    api.patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;

    info!(policy = %name, "finalizer_removed");
    Ok(())
}

async fn handle_deletion(
    policy: &TelemetryPolicy,
    ctx: &PolicyControllerContext,
) -> std::result::Result<Action, kube::Error> {
    let name = policy.name_any();
    info!(policy = %name, "policy_handling_deletion");

    {
        let mut reg = ctx.registry.write().await;
        reg.remove_strategy(&name);
    }

    if has_finalizer(policy) {
        remove_finalizer(policy, &ctx.client).await?;
    }

    Ok(Action::await_change())
}

/* ============================= TESTS ============================= */
