use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use kube::{Client, ResourceExt};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder};
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use crate::cache::{MetricCache, MetricSourceClient};
use crate::controller::{self, PolicyControllerContext};
use crate::extender::{
    referenced_policy, ExtenderArgs, ExtenderFilterResult, HostPriority, HostPriorityList, NodeListWrapper,
};
use crate::registry::{run_enforcer, run_metric_puller, StrategyRegistry};
use crate::strategy::{prioritize_order, rank_to_score, StrategyKind};

/* ============================= PROMETHEUS ============================= */

static TAS_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static TAS_FILTER_REQUESTS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("tas_filter_requests_total", "Total filter requests handled")
        .expect("metric definition is valid");
    TAS_REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static TAS_PRIORITIZE_REQUESTS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("tas_prioritize_requests_total", "Total prioritize requests handled")
        .expect("metric definition is valid");
    TAS_REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static TAS_STRATEGY_VIOLATIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "tas_strategy_violations_total",
            "Total node violations observed, by strategy kind and policy",
        ),
        &["kind", "policy"],
    )
    .expect("metric definition is valid");
    TAS_REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static TAS_ENFORCER_TICKS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("tas_enforcer_tick_total", "Total enforcer/metric-pull ticks observed")
        .expect("metric definition is valid");
    TAS_REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static TAS_METRIC_CACHE_SIZE: LazyLock<IntGauge> = LazyLock::new(|| {
    let g = IntGauge::new("tas_metric_cache_size", "Number of distinct metric names currently cached")
        .expect("metric definition is valid");
    TAS_REGISTRY.register(Box::new(g.clone())).expect("metric not yet registered");
    g
});

/* ============================= STATE ============================= */

#[derive(Clone)]
struct TasState {
    cache: MetricCache,
    registry: Arc<RwLock<StrategyRegistry>>,
    ready: Arc<RwLock<bool>>,
}

/* ============================= ENTRY: SERVE ============================= */

#[allow(clippy::too_many_arguments)]
pub async fn serve(
    addr_str: &str,
    tls_cert: Option<&str>,
    tls_key: Option<&str>,
    sync_period: Duration,
) -> Result<()> {
    println!("Starting telemetry-aware scheduler extender...\n");
    info!("tas_starting");

    let client = Client::try_default()
        .await
        .context("Failed to connect to Kubernetes cluster")?;

    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    if let (Some(cert), Some(key)) = (tls_cert, tls_key) {
        print!("  TLS .......................... ");
        crate::tls::validate_tls_files(cert, key)?;
        println!("loaded ({cert}, {key})");
    }

    let addr: SocketAddr = addr_str.parse().context("Invalid address format")?;

    LazyLock::force(&TAS_FILTER_REQUESTS);
    LazyLock::force(&TAS_PRIORITIZE_REQUESTS);
    LazyLock::force(&TAS_STRATEGY_VIOLATIONS);
    LazyLock::force(&TAS_ENFORCER_TICKS);
    LazyLock::force(&TAS_METRIC_CACHE_SIZE);

    println!("  Sync period .................. {}s", sync_period.as_secs());
    println!("  Server ....................... {addr}");
    println!();
    println!("  Available endpoints:");
    println!("    POST scheduler/filter ...... Drop nodes violating dontschedule strategies");
    println!("    POST scheduler/prioritize .. Score nodes by scheduleonmetric strategies");
    println!("    GET  /healthz .............. Liveness probe");
    println!("    GET  /readyz ............... Readiness probe");
    println!("    GET  /metrics .............. Prometheus metrics");
    println!();
    println!("Telemetry-aware scheduler running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    let cache = MetricCache::new();
    let registry = Arc::new(RwLock::new(StrategyRegistry::new()));
    let state = TasState { cache: cache.clone(), registry: registry.clone(), ready: Arc::new(RwLock::new(false)) };

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let policy_ctx = Arc::new(PolicyControllerContext { client: client.clone(), registry: registry.clone() });
    let controller_task = tokio::spawn(controller::run(policy_ctx));

    let enforcer_task = tokio::spawn(run_enforcer(
        registry.clone(),
        client.clone(),
        cache.clone(),
        sync_period,
        shutdown_tx.subscribe(),
    ));

    let source = MetricSourceClient::new(client.clone());
    let puller_task = tokio::spawn(run_metric_puller(
        registry.clone(),
        source,
        cache.clone(),
        sync_period,
        shutdown_tx.subscribe(),
    ));

    let sampler_state = state.clone();
    let mut sampler_shutdown = shutdown_tx.subscribe();
    let sampler_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sync_period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    TAS_ENFORCER_TICKS.inc();
                    TAS_METRIC_CACHE_SIZE.set(sampler_state.cache.metric_count().await as i64);
                    *sampler_state.ready.write().await = true;
                }
                _ = sampler_shutdown.recv() => break,
            }
        }
    });

    let http_shutdown = shutdown_tx.subscribe();
    let http_state = state.clone();
    let http_handle = if let (Some(cert), Some(key)) = (tls_cert, tls_key) {
        let cert = cert.to_string();
        let key = key.to_string();
        tokio::spawn(async move { serve_https(http_state, http_shutdown, addr, &cert, &key).await })
    } else {
        tokio::spawn(async move { serve_http(http_state, http_shutdown, addr).await })
    };

    tokio::signal::ctrl_c().await?;
    info!("shutdown_signal_received");
    println!("\n{}", "=".repeat(70));
    println!("Shutdown signal received. Stopping telemetry-aware scheduler...");
    println!("{}", "=".repeat(70));

    let _ = shutdown_tx.send(());
    controller_task.abort();
    let _ = enforcer_task.await;
    let _ = puller_task.await;
    let _ = sampler_task.await;
    let _ = http_handle.await?;

    info!("tas_stopped");
    println!("Telemetry-aware scheduler stopped.");
    Ok(())
}

/* ============================= ROUTER ============================= */

fn build_router(state: TasState) -> Router {
    Router::new()
        .route("/scheduler/filter", post(filter_handler))
        .route("/scheduler/prioritize", post(prioritize_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route(
            "/readyz",
            get({
                let state = state.clone();
                move || ready_handler(state.clone())
            }),
        )
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn serve_http(state: TasState, mut shutdown: broadcast::Receiver<()>, addr: SocketAddr) -> Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await.context("failed to bind TAS listener")?;
    info!(addr = %addr, "tas_http_server_started");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}

async fn serve_https(
    state: TasState,
    mut shutdown: broadcast::Receiver<()>,
    addr: SocketAddr,
    tls_cert: &str,
    tls_key: &str,
) -> Result<()> {
    let app = build_router(state);
    let rustls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(tls_cert, tls_key)
        .await
        .context("Failed to load TLS configuration")?;

    info!(addr = %addr, "tas_https_server_started");

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        let _ = shutdown.recv().await;
        shutdown_handle.graceful_shutdown(Some(Duration::from_secs(5)));
    });

    axum_server::bind_rustls(addr, rustls_config)
        .handle(handle)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}

async fn ready_handler(state: TasState) -> impl IntoResponse {
    if *state.ready.read().await {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = TAS_REGISTRY.gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
        },
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
    }
}

/* ============================= FILTER ============================= */

async fn filter_handler(State(state): State<TasState>, Json(args): Json<ExtenderArgs>) -> impl IntoResponse {
    TAS_FILTER_REQUESTS.inc();

    let Some(policy_name) = referenced_policy(&args.pod) else {
        return Json(pass_through_filter(&args));
    };

    let reg = state.registry.read().await;
    let mut violating: std::collections::HashSet<String> = std::collections::HashSet::new();
    for strategy in reg.get(StrategyKind::DontSchedule) {
        if strategy.policy_name() != policy_name {
            continue;
        }
        let v = strategy.violated(&state.cache).await;
        TAS_STRATEGY_VIOLATIONS
            .with_label_values(&[StrategyKind::DontSchedule.as_str(), &policy_name])
            .inc_by(v.len() as u64);
        violating.extend(v);
    }
    drop(reg);

    let input_nodes: Vec<String> = match &args.nodenames {
        Some(names) => names.clone(),
        None => args
            .nodes
            .as_ref()
            .map(|n| n.items.iter().map(|node| node.name_any()).collect())
            .unwrap_or_default(),
    };

    let kept: Vec<String> = input_nodes.into_iter().filter(|n| !violating.contains(n)).collect();

    let result = if args.nodenames.is_some() {
        ExtenderFilterResult { nodenames: Some(kept), ..Default::default() }
    } else {
        let kept_nodes = args
            .nodes
            .map(|n| NodeListWrapper { items: n.items.into_iter().filter(|node| kept.contains(&node.name_any())).collect() });
        ExtenderFilterResult { nodes: kept_nodes, ..Default::default() }
    };

    Json(result)
}

fn pass_through_filter(args: &ExtenderArgs) -> ExtenderFilterResult {
    ExtenderFilterResult {
        nodes: args.nodes.clone(),
        nodenames: args.nodenames.clone(),
        ..Default::default()
    }
}

/* ============================= PRIORITIZE ============================= */

async fn prioritize_handler(State(state): State<TasState>, Json(args): Json<ExtenderArgs>) -> impl IntoResponse {
    TAS_PRIORITIZE_REQUESTS.inc();

    let input_nodes: Vec<String> = match &args.nodenames {
        Some(names) => names.clone(),
        None => args
            .nodes
            .as_ref()
            .map(|n| n.items.iter().map(|node| node.name_any()).collect())
            .unwrap_or_default(),
    };

    let Some(policy_name) = referenced_policy(&args.pod) else {
        let flat: HostPriorityList = input_nodes.into_iter().map(|host| HostPriority { host, score: 0 }).collect();
        return Json(flat);
    };

    let reg = state.registry.read().await;
    let strategy = reg
        .get(StrategyKind::ScheduleOnMetric)
        .iter()
        .find(|s| s.policy_name() == policy_name)
        .cloned();
    drop(reg);

    let Some(strategy) = strategy else {
        let flat: HostPriorityList = input_nodes.into_iter().map(|host| HostPriority { host, score: 0 }).collect();
        return Json(flat);
    };

    let Some(rule) = strategy.inner().rules.first().cloned() else {
        let flat: HostPriorityList = input_nodes.into_iter().map(|host| HostPriority { host, score: 0 }).collect();
        return Json(flat);
    };

    let metric = state.cache.read_metric(&rule.metricname).await.unwrap_or_default();
    let metric_owned: std::collections::HashMap<String, crate::cache::NodeMetric> =
        metric.iter().map(|(k, v)| (k.clone(), v.clone())).collect();

    let ordered = prioritize_order(&input_nodes, &metric_owned, &rule);
    let total = ordered.len();

    let scored: HostPriorityList = ordered
        .into_iter()
        .enumerate()
        .map(|(rank, (host, value))| HostPriority { host, score: rank_to_score(rank, total, value.is_some()) })
        .collect();

    Json(scored)
}

/* ============================= TESTS ============================= */
