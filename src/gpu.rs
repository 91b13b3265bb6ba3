use std::collections::{HashMap, HashSet};

use k8s_openapi::api::core::v1::{Node, Pod};

/* ============================= ANNOTATIONS ============================= */

pub const ANNOTATION_CARDS: &str = "gpu.intel.com/cards";
pub const ANNOTATION_TILES: &str = "gpu.intel.com/tiles";
pub const ANNOTATION_MEMORY_MAX: &str = "gpu.intel.com/memory.max";
pub const ANNOTATION_MILLICORES_CAPACITY: &str = "gpu.intel.com/millicores-capacity";
pub const POD_ANNOTATION_CARDS_ALLOWED: &str = "gpu.intel.com/cards-allowed";
pub const POD_ANNOTATION_CARDS_DENIED: &str = "gpu.intel.com/cards-denied";

pub const RESOURCE_MILLICORES: &str = "gpu.intel.com/millicores";
pub const RESOURCE_MEMORY: &str = "gpu.intel.com/memory";
pub const RESOURCE_I915: &str = "gpu.intel.com/i915";
pub const RESOURCE_XE: &str = "gpu.intel.com/xe";

const DEFAULT_MILLICORES_CAPACITY: i64 = 1000;

/* ============================= DEVICE ============================= */

/// One schedulable GPU device: a whole card (`card0`) or one of its tiles
/// (`card0.gt1`). Tiles on the same card split the card's capacity evenly.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: String,
    pub card: String,
    pub memory_total: i64,
    pub millicores_total: i64,
    pub memory_used: i64,
    pub millicores_used: i64,
}

impl Device {
    pub fn memory_free(&self) -> i64 {
        self.memory_total - self.memory_used
    }

    pub fn millicores_free(&self) -> i64 {
        self.millicores_total - self.millicores_used
    }
}

/* ============================= CAPACITY PARSING ============================= */

fn parse_csv_int_map(raw: &str) -> HashMap<String, i64> {
    raw.split(',')
        .filter_map(|kv| kv.split_once('='))
        .filter_map(|(k, v)| v.trim().parse::<i64>().ok().map(|n| (k.trim().to_string(), n)))
        .collect()
}

/// Build the per-device capacity list a node advertises, before accounting
/// for any pods already assigned to it.
pub fn capacity_devices(node: &Node) -> Vec<Device> {
    let annotations = node.metadata.annotations.clone().unwrap_or_default();

    let cards: Vec<String> = annotations
        .get(ANNOTATION_CARDS)
        .map(|s| {
            s.split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let tiles = annotations
        .get(ANNOTATION_TILES)
        .map(|s| parse_csv_int_map(s))
        .unwrap_or_default();
    let memory_max = annotations
        .get(ANNOTATION_MEMORY_MAX)
        .map(|s| parse_csv_int_map(s))
        .unwrap_or_default();
    let millicores_capacity = annotations
        .get(ANNOTATION_MILLICORES_CAPACITY)
        .map(|s| parse_csv_int_map(s))
        .unwrap_or_default();

    let mut devices = Vec::new();
    for card in &cards {
        let tile_count = (*tiles.get(card).unwrap_or(&1)).max(1);
        let memory_total = *memory_max.get(card).unwrap_or(&0);
        let millicores_total = *millicores_capacity
            .get(card)
            .unwrap_or(&DEFAULT_MILLICORES_CAPACITY);

        if tile_count <= 1 {
            devices.push(Device {
                id: card.clone(),
                card: card.clone(),
                memory_total,
                millicores_total,
                memory_used: 0,
                millicores_used: 0,
            });
        } else {
            for t in 0..tile_count {
                devices.push(Device {
                    id: format!("{card}.gt{t}"),
                    card: card.clone(),
                    memory_total: memory_total / tile_count,
                    millicores_total: millicores_total / tile_count,
                    memory_used: 0,
                    millicores_used: 0,
                });
            }
        }
    }
    devices
}

/* ============================= ASSIGNMENT ENCODING ============================= */

/// Bind-time pod annotation value: one `container=dev1,dev2` entry per
/// GPU-requesting container, separated by `;`.
pub fn encode_assignment(per_container: &[(String, Vec<String>)]) -> String {
    per_container
        .iter()
        .map(|(name, devs)| format!("{name}={}", devs.join(",")))
        .collect::<Vec<_>>()
        .join(";")
}

pub fn decode_assignment(raw: &str) -> Vec<(String, Vec<String>)> {
    raw.split(';')
        .filter(|s| !s.is_empty())
        .filter_map(|entry| {
            let (name, devs) = entry.split_once('=')?;
            Some((
                name.to_string(),
                devs.split(',')
                    .map(|d| d.trim().to_string())
                    .filter(|d| !d.is_empty())
                    .collect(),
            ))
        })
        .collect()
}

/* ============================= POD RESOURCE REQUESTS ============================= */

fn parse_quantity_i64(raw: &str) -> i64 {
    let raw = raw.trim();
    let (digits, multiplier) = if let Some(n) = raw.strip_suffix("Ki") {
        (n, 1024)
    } else if let Some(n) = raw.strip_suffix("Mi") {
        (n, 1024 * 1024)
    } else if let Some(n) = raw.strip_suffix("Gi") {
        (n, 1024 * 1024 * 1024)
    } else {
        (raw, 1)
    };
    digits.parse::<i64>().unwrap_or(0) * multiplier
}

/// GPU resource request for one container.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpuRequest {
    pub millicores: i64,
    pub memory: i64,
    pub same_tile: bool,
}

/// Per-container GPU requests, in container order. Containers with no GPU
/// resource requests are omitted.
pub fn container_gpu_requests(pod: &Pod) -> Vec<(String, GpuRequest)> {
    let Some(spec) = &pod.spec else {
        return Vec::new();
    };

    let same_tile = pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_CARDS))
        .map(|v| v == "same")
        .unwrap_or(false);

    let mut out = Vec::new();
    for container in &spec.containers {
        let Some(resources) = &container.resources else {
            continue;
        };
        let Some(requests) = &resources.requests else {
            continue;
        };

        let wants_gpu = requests.contains_key(RESOURCE_I915) || requests.contains_key(RESOURCE_XE);
        if !wants_gpu {
            continue;
        }

        let millicores = requests
            .get(RESOURCE_MILLICORES)
            .map(|q| parse_quantity_i64(&q.0))
            .unwrap_or(0);
        let memory = requests
            .get(RESOURCE_MEMORY)
            .map(|q| parse_quantity_i64(&q.0))
            .unwrap_or(0);

        out.push((container.name.clone(), GpuRequest { millicores, memory, same_tile }));
    }
    out
}

/* ============================= NODE STATE ============================= */

/// Derived, never stored: node capacity minus what's consumed by pods
/// currently bound to it with a non-terminal phase.
#[derive(Debug, Clone)]
pub struct NodeGpuState {
    pub node_name: String,
    pub devices: Vec<Device>,
}

fn is_terminal(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

impl NodeGpuState {
    pub fn build(node: &Node, node_name: &str, pods_on_node: &[Pod]) -> NodeGpuState {
        let mut devices = capacity_devices(node);

        for pod in pods_on_node {
            if is_terminal(pod) {
                continue;
            }
            let Some(assignment_raw) = pod
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(ANNOTATION_CARDS))
            else {
                continue;
            };
            if assignment_raw == "same" {
                continue;
            }

            let requests: HashMap<String, GpuRequest> = container_gpu_requests(pod).into_iter().collect();

            for (container_name, device_ids) in decode_assignment(assignment_raw) {
                let Some(request) = requests.get(&container_name) else {
                    continue;
                };
                if device_ids.is_empty() {
                    continue;
                }
                let per_device_mc = request.millicores / device_ids.len() as i64;
                let per_device_mem = request.memory / device_ids.len() as i64;
                for device in &mut devices {
                    if device_ids.contains(&device.id) {
                        device.millicores_used += per_device_mc;
                        device.memory_used += per_device_mem;
                    }
                }
            }
        }

        NodeGpuState {
            node_name: node_name.to_string(),
            devices,
        }
    }
}

/* ============================= DEVICE SELECTION ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Memory,
    Millicores,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    Spread,
    Pack,
    Balanced(ResourceKind),
}

impl SelectionMode {
    pub fn parse(raw: &str) -> Option<SelectionMode> {
        match raw {
            "spread" => Some(SelectionMode::Spread),
            "pack" => Some(SelectionMode::Pack),
            "balanced-memory" => Some(SelectionMode::Balanced(ResourceKind::Memory)),
            "balanced-millicores" => Some(SelectionMode::Balanced(ResourceKind::Millicores)),
            _ => None,
        }
    }
}

fn sort_candidates(candidates: &mut [&Device], mode: SelectionMode) {
    use std::cmp::Ordering;
    candidates.sort_by(|a, b| -> Ordering {
        match mode {
            SelectionMode::Spread => a
                .millicores_used
                .cmp(&b.millicores_used)
                .then_with(|| a.memory_used.cmp(&b.memory_used))
                .then_with(|| a.id.cmp(&b.id)),
            SelectionMode::Pack => b
                .millicores_used
                .cmp(&a.millicores_used)
                .then_with(|| b.memory_used.cmp(&a.memory_used))
                .then_with(|| a.id.cmp(&b.id)),
            SelectionMode::Balanced(ResourceKind::Memory) => {
                a.memory_used.cmp(&b.memory_used).then_with(|| a.id.cmp(&b.id))
            }
            SelectionMode::Balanced(ResourceKind::Millicores) => a
                .millicores_used
                .cmp(&b.millicores_used)
                .then_with(|| a.id.cmp(&b.id)),
        }
    });
}

fn pick_prefix(candidates: &[&Device], request: &GpuRequest) -> Option<Vec<String>> {
    let mut chosen = Vec::new();
    let mut mc_sum = 0i64;
    let mut mem_sum = 0i64;
    for device in candidates {
        chosen.push(device.id.clone());
        mc_sum += device.millicores_free();
        mem_sum += device.memory_free();
        if mc_sum >= request.millicores && mem_sum >= request.memory {
            return Some(chosen);
        }
    }
    None
}

/// Choose the smallest device prefix (by `mode`'s ordering) that covers
/// `request`, honoring allow/deny lists and same-tile co-tenancy.
pub fn select_devices(
    devices: &[Device],
    request: &GpuRequest,
    mode: SelectionMode,
    allowed: Option<&HashSet<String>>,
    denied: &HashSet<String>,
) -> Option<Vec<String>> {
    let mut candidates: Vec<&Device> = devices
        .iter()
        .filter(|d| allowed.map(|a| a.contains(&d.id)).unwrap_or(true))
        .filter(|d| !denied.contains(&d.id))
        .collect();

    sort_candidates(&mut candidates, mode);

    if request.same_tile {
        let mut cards: Vec<&str> = candidates.iter().map(|d| d.card.as_str()).collect();
        cards.dedup();
        for card in cards {
            let subset: Vec<&Device> = candidates.iter().filter(|d| d.card == card).copied().collect();
            if let Some(selected) = pick_prefix(&subset, request) {
                return Some(selected);
            }
        }
        return None;
    }

    pick_prefix(&candidates, request)
}

/// Compute a full pod assignment across all its GPU-requesting containers,
/// charging each container's selection against a working copy of `devices`
/// so two containers in the same pod never double-book a device.
pub fn compute_pod_assignment(
    devices: &[Device],
    requests: &[(String, GpuRequest)],
    mode: SelectionMode,
    allowed: Option<&HashSet<String>>,
    denied: &HashSet<String>,
) -> Option<Vec<(String, Vec<String>)>> {
    let mut working: Vec<Device> = devices.to_vec();
    let mut assignment = Vec::new();

    for (container_name, request) in requests {
        let selected = select_devices(&working, request, mode, allowed, denied)?;
        let per_device_mc = request.millicores / selected.len() as i64;
        let per_device_mem = request.memory / selected.len() as i64;
        for device in &mut working {
            if selected.contains(&device.id) {
                device.millicores_used += per_device_mc;
                device.memory_used += per_device_mem;
            }
        }
        assignment.push((container_name.clone(), selected));
    }

    Some(assignment)
}

/* ============================= TESTS ============================= */
