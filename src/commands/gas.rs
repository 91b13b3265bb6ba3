use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use prometheus::{Encoder, Histogram, IntCounterVec, Registry, TextEncoder};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::extender::{ExtenderArgs, ExtenderBindingArgs, ExtenderBindingResult, ExtenderFilterResult, NodeListWrapper};
use crate::gpu::{self, compute_pod_assignment, encode_assignment, NodeGpuState, SelectionMode};

const FIELD_MANAGER: &str = "gpu-aware-scheduler";

/* ============================= PROMETHEUS ============================= */

static GAS_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static GAS_FILTER_REQUESTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new("gas_filter_requests_total", "Total GAS filter requests by result"),
        &["result"],
    )
    .expect("metric definition is valid");
    GAS_REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static GAS_BIND_REQUESTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new("gas_bind_requests_total", "Total GAS bind requests by result"),
        &["result"],
    )
    .expect("metric definition is valid");
    GAS_REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static GAS_BIND_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(prometheus::HistogramOpts::new(
        "gas_bind_duration_seconds",
        "Duration of GAS bind request processing in seconds",
    ))
    .expect("metric definition is valid");
    GAS_REGISTRY.register(Box::new(h.clone())).expect("metric not yet registered");
    h
});

static GAS_DEVICE_ASSIGNMENTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new("gas_device_assignments_total", "Total device assignments committed, by node"),
        &["node"],
    )
    .expect("metric definition is valid");
    GAS_REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

/* ============================= STATE ============================= */

#[derive(Clone)]
struct GasState {
    client: Client,
    mode: SelectionMode,
    respect_allow_deny_lists: bool,
    ready: std::sync::Arc<tokio::sync::RwLock<bool>>,
}

/* ============================= ENTRY: SERVE ============================= */

pub async fn serve(
    addr_str: &str,
    tls_cert: Option<&str>,
    tls_key: Option<&str>,
    mode: SelectionMode,
    respect_allow_deny_lists: bool,
) -> Result<()> {
    println!("Starting GPU-aware scheduler extender...\n");
    info!("gas_starting");

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

    LazyLock::force(&GAS_FILTER_REQUESTS);
    LazyLock::force(&GAS_BIND_REQUESTS);
    LazyLock::force(&GAS_BIND_DURATION);
    LazyLock::force(&GAS_DEVICE_ASSIGNMENTS);

    println!("  Server ....................... {addr}");
    println!();
    println!("  Available endpoints:");
    println!("    POST scheduler/filter ...... Drop nodes that cannot fit the pod's GPU request");
    println!("    POST scheduler/bind ........ Assign devices and commit the binding");
    println!("    GET  /healthz .............. Liveness probe");
    println!("    GET  /readyz ............... Readiness probe");
    println!("    GET  /metrics .............. Prometheus metrics");
    println!();
    println!("GPU-aware scheduler running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    let state = GasState {
        client,
        mode,
        respect_allow_deny_lists,
        ready: std::sync::Arc::new(tokio::sync::RwLock::new(true)),
    };
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let http_shutdown = shutdown_tx.subscribe();

    let http_handle = if let (Some(cert), Some(key)) = (tls_cert, tls_key) {
        let cert = cert.to_string();
        let key = key.to_string();
        let state = state.clone();
        tokio::spawn(async move { serve_https(state, http_shutdown, addr, &cert, &key).await })
    } else {
        let state = state.clone();
        tokio::spawn(async move { serve_http(state, http_shutdown, addr).await })
    };

    tokio::signal::ctrl_c().await?;
    info!("shutdown_signal_received");
    println!("\n{}", "=".repeat(70));
    println!("Shutdown signal received. Stopping GPU-aware scheduler...");
    println!("{}", "=".repeat(70));

    let _ = shutdown_tx.send(());
    let _ = http_handle.await?;

    info!("gas_stopped");
    println!("GPU-aware scheduler stopped.");
    Ok(())
}

/* ============================= ROUTER ============================= */

fn build_router(state: GasState) -> Router {
    Router::new()
        .route("/scheduler/filter", post(filter_handler))
        .route("/scheduler/bind", post(bind_handler))
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

async fn ready_handler(state: GasState) -> impl IntoResponse {
    if *state.ready.read().await {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn serve_http(state: GasState, mut shutdown: broadcast::Receiver<()>, addr: SocketAddr) -> Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await.context("failed to bind GAS listener")?;
    info!(addr = %addr, "gas_http_server_started");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}

async fn serve_https(
    state: GasState,
    mut shutdown: broadcast::Receiver<()>,
    addr: SocketAddr,
    tls_cert: &str,
    tls_key: &str,
) -> Result<()> {
    let app = build_router(state);
    let rustls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(tls_cert, tls_key)
        .await
        .context("Failed to load TLS configuration")?;

    info!(addr = %addr, "gas_https_server_started");

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

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = GAS_REGISTRY.gather();
    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
        },
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
    }
}

/* ============================= ALLOW/DENY LISTS ============================= */

fn parse_csv_set(raw: Option<&String>) -> HashSet<String> {
    raw.map(|s| s.split(',').map(|v| v.trim().to_string()).filter(|v| !v.is_empty()).collect())
        .unwrap_or_default()
}

fn allow_deny_lists(pod: &Pod, enabled: bool) -> (Option<HashSet<String>>, HashSet<String>) {
    if !enabled {
        return (None, HashSet::new());
    }
    let annotations = pod.metadata.annotations.as_ref();
    let allowed = annotations
        .and_then(|a| a.get(gpu::POD_ANNOTATION_CARDS_ALLOWED))
        .map(|s| parse_csv_set(Some(s)));
    let denied = annotations.and_then(|a| a.get(gpu::POD_ANNOTATION_CARDS_DENIED)).map(|s| parse_csv_set(Some(s))).unwrap_or_default();
    (allowed, denied)
}

/* ============================= NODE STATE LOOKUP ============================= */

async fn node_gpu_state(client: &Client, node: &Node, node_name: &str) -> Result<NodeGpuState, kube::Error> {
    let pods_api: Api<Pod> = Api::all(client.clone());
    let field_selector = format!("spec.nodeName={node_name}");
    let pods = pods_api.list(&ListParams::default().fields(&field_selector)).await?;
    Ok(NodeGpuState::build(node, node_name, &pods.items))
}

/* ============================= FILTER ============================= */

async fn filter_handler(State(state): State<GasState>, Json(args): Json<ExtenderArgs>) -> impl IntoResponse {
    let requests = gpu::container_gpu_requests(&args.pod);
    if requests.is_empty() {
        GAS_FILTER_REQUESTS.with_label_values(&["pass_through"]).inc();
        return Json(ExtenderFilterResult {
            nodes: args.nodes.clone(),
            nodenames: args.nodenames.clone(),
            ..Default::default()
        });
    }

    let (allowed, denied) = allow_deny_lists(&args.pod, state.respect_allow_deny_lists);

    let candidate_nodes: Vec<Node> = match &args.nodes {
        Some(n) => n.items.clone(),
        None => {
            let nodes_api: Api<Node> = Api::all(state.client.clone());
            let mut out = Vec::new();
            for name in args.nodenames.clone().unwrap_or_default() {
                if let Ok(node) = nodes_api.get(&name).await {
                    out.push(node);
                }
            }
            out
        }
    };

    let mut retained = Vec::new();
    let mut failed = std::collections::HashMap::new();

    for node in candidate_nodes {
        let node_name = node.name_any();
        let state_result = node_gpu_state(&state.client, &node, &node_name).await;
        let fits = match state_result {
            Ok(gpu_state) => {
                compute_pod_assignment(&gpu_state.devices, &requests, state.mode, allowed.as_ref(), &denied).is_some()
            }
            Err(e) => {
                warn!(node = %node_name, error = %e, "gas_filter_node_state_failed");
                false
            }
        };

        if fits {
            retained.push(node);
        } else {
            failed.insert(node_name, "insufficient GPU capacity".to_string());
        }
    }

    GAS_FILTER_REQUESTS.with_label_values(&["evaluated"]).inc();

    if args.nodenames.is_some() {
        Json(ExtenderFilterResult {
            nodenames: Some(retained.iter().map(|n| n.name_any()).collect()),
            failed_nodes: failed,
            ..Default::default()
        })
    } else {
        Json(ExtenderFilterResult {
            nodes: Some(NodeListWrapper { items: retained }),
            failed_nodes: failed,
            ..Default::default()
        })
    }
}

/* ============================= BIND ============================= */

async fn bind_handler(State(state): State<GasState>, Json(args): Json<ExtenderBindingArgs>) -> impl IntoResponse {
    let _timer = GAS_BIND_DURATION.start_timer();

    match do_bind(&state, &args).await {
        Ok(()) => {
            GAS_BIND_REQUESTS.with_label_values(&["success"]).inc();
            GAS_DEVICE_ASSIGNMENTS.with_label_values(&[&args.node]).inc();
            info!(pod = %args.pod_name, node = %args.node, "gas_bind_committed");
            (StatusCode::OK, Json(ExtenderBindingResult::default()))
        }
        Err(e) => {
            GAS_BIND_REQUESTS.with_label_values(&["error"]).inc();
            warn!(pod = %args.pod_name, node = %args.node, error = %e, "gas_bind_failed");
            (StatusCode::OK, Json(ExtenderBindingResult { error: e.to_string() }))
        }
    }
}

async fn do_bind(state: &GasState, args: &ExtenderBindingArgs) -> Result<()> {
    let pods_api: Api<Pod> = Api::namespaced(state.client.clone(), &args.pod_namespace);
    let pod = pods_api.get(&args.pod_name).await.context("pod not found")?;

    let requests = gpu::container_gpu_requests(&pod);
    if requests.is_empty() {
        anyhow::bail!("pod requests no GPU resources");
    }

    let nodes_api: Api<Node> = Api::all(state.client.clone());
    let node = nodes_api.get(&args.node).await.context("node not found")?;

    let (allowed, denied) = allow_deny_lists(&pod, state.respect_allow_deny_lists);
    let gpu_state = node_gpu_state(&state.client, &node, &args.node).await.context("failed to read node GPU state")?;

    let assignment = compute_pod_assignment(&gpu_state.devices, &requests, state.mode, allowed.as_ref(), &denied)
        .context("no device assignment satisfies the pod's GPU request on this node")?;

    let encoded = encode_assignment(&assignment);
    let mut annotations = serde_json::Map::new();
    annotations.insert(gpu::ANNOTATION_CARDS.to_string(), serde_json::Value::String(encoded));
    let patch = serde_json::json!({ "metadata": { "annotations": annotations } });
    pods_api
        .patch(&args.pod_name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await
        .context("failed to patch pod device-assignment annotation")?;

    // Bind commits via a direct nodeName merge-patch: the binding
    // subresource isn't guaranteed to exist outside a full orchestrator, and
    // every other mutation in this system already goes through Patch::Merge.
    let bind_patch = serde_json::json!({ "spec": { "nodeName": args.node } });
    pods_api
        .patch(&args.pod_name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&bind_patch))
        .await
        .context("failed to bind pod to node")?;

    Ok(())
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use tower::ServiceExt;

    #[test]
    fn test_parse_csv_set() {
        let raw = "card0,card1, card2".to_string();
        let set = parse_csv_set(Some(&raw));
        assert_eq!(set.len(), 3);
        assert!(set.contains("card1"));
    }

    #[test]
    fn test_allow_deny_lists_disabled_returns_empty() {
        let pod = Pod {
            metadata: ObjectMeta {
                annotations: Some([(gpu::POD_ANNOTATION_CARDS_DENIED.to_string(), "card0".to_string())].into_iter().collect()),
                ..Default::default()
            },
            ..Default::default()
        };
        let (allowed, denied) = allow_deny_lists(&pod, false);
        assert!(allowed.is_none());
        assert!(denied.is_empty());
    }

    #[test]
    fn test_allow_deny_lists_enabled_reads_annotations() {
        let pod = Pod {
            metadata: ObjectMeta {
                annotations: Some(
                    [(gpu::POD_ANNOTATION_CARDS_DENIED.to_string(), "card0".to_string())]
                        .into_iter()
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        };
        let (allowed, denied) = allow_deny_lists(&pod, true);
        assert!(allowed.is_none());
        assert!(denied.contains("card0"));
    }

    /// A `kube::Client` whose transport is never actually invoked — sufficient
    /// for router tests that short-circuit (pass-through, malformed body)
    /// before any cluster call is made.
    fn test_client() -> Client {
        let service = tower::service_fn(|_req: http::Request<kube::client::Body>| async move {
            Ok::<_, std::convert::Infallible>(
                http::Response::builder()
                    .status(500)
                    .body(kube::client::Body::empty())
                    .unwrap(),
            )
        });
        Client::new(service, "default")
    }

    fn new_state(ready: bool) -> GasState {
        GasState {
            client: test_client(),
            mode: SelectionMode::Spread,
            respect_allow_deny_lists: false,
            ready: std::sync::Arc::new(tokio::sync::RwLock::new(ready)),
        }
    }

    #[tokio::test]
    async fn test_healthz_always_ok() {
        let app = build_router(new_state(false));
        let response = app
            .oneshot(axum::http::Request::builder().uri("/healthz").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readyz_when_ready() {
        let app = build_router(new_state(true));
        let response = app
            .oneshot(axum::http::Request::builder().uri("/readyz").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readyz_when_not_ready() {
        let app = build_router(new_state(false));
        let response = app
            .oneshot(axum::http::Request::builder().uri("/readyz").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_metrics_returns_ok() {
        let app = build_router(new_state(true));
        let response = app
            .oneshot(axum::http::Request::builder().uri("/metrics").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_filter_pass_through_for_non_gpu_pod() {
        let args = ExtenderArgs { pod: Pod::default(), nodes: None, nodenames: Some(vec!["node-1".to_string()]) };
        let app = build_router(new_state(true));
        let body = serde_json::to_vec(&args).unwrap();
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/scheduler/filter")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let result: ExtenderFilterResult = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(result.nodenames.unwrap(), vec!["node-1".to_string()]);
    }

    #[tokio::test]
    async fn test_filter_malformed_body_returns_400() {
        let app = build_router(new_state(true));
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/scheduler/filter")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
