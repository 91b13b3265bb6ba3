use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use kube::Client;
use tokio::sync::RwLock;
use tracing::warn;

/* ============================= TYPES ============================= */

/// A single node's value for a single metric at the time it was read.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeMetric {
    pub value: i64,
    pub timestamp: DateTime<Utc>,
    pub window: Duration,
}

/// Per-node values for one metric name, shared via `Arc` so a reader that
/// clones the handle under the cache's read lock sees a snapshot that never
/// changes underneath it, even while a writer replaces the whole map.
pub type NodeMetricsInfo = Arc<HashMap<String, NodeMetric>>;

/// Concurrently readable, concurrently replaceable mapping of metric name
/// to per-node values. Writes replace a metric's map wholesale; reads never
/// observe a partially-updated map.
#[derive(Clone, Default)]
pub struct MetricCache {
    inner: Arc<RwLock<HashMap<String, NodeMetricsInfo>>>,
}

impl MetricCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn read_metric(&self, name: &str) -> Option<NodeMetricsInfo> {
        self.inner.read().await.get(name).cloned()
    }

    pub async fn write_metric(&self, name: &str, info: HashMap<String, NodeMetric>) {
        self.inner
            .write()
            .await
            .insert(name.to_string(), Arc::new(info));
    }

    pub async fn metric_count(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn metric_names(&self) -> HashSet<String> {
        self.inner.read().await.keys().cloned().collect()
    }
}

/* ============================= METRIC SOURCE CLIENT ============================= */

/// Queries the cluster's custom-metrics API (`custom.metrics.k8s.io`) for a
/// metric's value across every node. The API server aggregates this from
/// whatever metrics pipeline is installed; this client only speaks the
/// query surface, never collects metrics itself.
#[derive(Clone)]
pub struct MetricSourceClient {
    client: Client,
}

impl MetricSourceClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Fetch the current value of `metric_name` for every node the custom
    /// metrics API reports. Nodes absent from the response are simply
    /// absent from the returned map (treated by strategy evaluation as an
    /// unsatisfiable rule, not an error).
    pub async fn fetch_metric(&self, metric_name: &str) -> Result<HashMap<String, NodeMetric>> {
        let uri = format!("/apis/custom.metrics.k8s.io/v1beta2/nodes/*/{metric_name}");
        let request = http::Request::builder()
            .uri(uri)
            .body(Vec::new())
            .context("failed to build custom metrics API request")?;

        let body: serde_json::Value = self
            .client
            .request(request)
            .await
            .context("custom metrics API request failed")?;

        Ok(parse_metric_list_response(&body))
    }
}

fn parse_metric_list_response(body: &serde_json::Value) -> HashMap<String, NodeMetric> {
    let now = Utc::now();
    let mut out = HashMap::new();

    let Some(items) = body.get("items").and_then(|v| v.as_array()) else {
        return out;
    };

    for item in items {
        let Some(node_name) = item
            .get("describedObject")
            .and_then(|d| d.get("name"))
            .and_then(|n| n.as_str())
        else {
            continue;
        };

        let Some(value) = item.get("value").and_then(|v| v.as_str()) else {
            continue;
        };

        let Ok(parsed) = value.parse::<i64>() else {
            warn!(node = %node_name, value = %value, "unparseable_metric_value");
            continue;
        };

        let window = item
            .get("window")
            .and_then(|w| w.as_str())
            .and_then(parse_window)
            .unwrap_or(Duration::from_secs(60));

        out.insert(
            node_name.to_string(),
            NodeMetric {
                value: parsed,
                timestamp: now,
                window,
            },
        );
    }

    out
}

/// Parse a Kubernetes duration string like `"60s"`/`"1m"` into a `Duration`.
fn parse_window(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if let Some(secs) = raw.strip_suffix('s') {
        return secs.parse::<u64>().ok().map(Duration::from_secs);
    }
    if let Some(mins) = raw.strip_suffix('m') {
        return mins
            .parse::<u64>()
            .ok()
            .map(|m| Duration::from_secs(m * 60));
    }
    None
}

/* ============================= TESTS ============================= */
