//! Resource list arithmetic over Kubernetes quantities.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, PodSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::crd::ReplicaSpecs;

pub const RESOURCE_NVIDIA_GPU: &str = "nvidia.com/gpu";

pub type ResourceList = BTreeMap<String, Quantity>;

/// Parses a quantity such as `500m`, `2`, `1.5Gi` or `1e3` into a plain number.
pub fn parse_quantity(q: &Quantity) -> Option<f64> {
    let s = q.0.trim();
    if s.is_empty() {
        return None;
    }

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    let value: f64 = number.parse().ok()?;

    let multiplier = match suffix {
        "" => 1.0,
        "n" => 1e-9,
        "u" => 1e-6,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024.0,
        "Mi" => 1024.0_f64.powi(2),
        "Gi" => 1024.0_f64.powi(3),
        "Ti" => 1024.0_f64.powi(4),
        "Pi" => 1024.0_f64.powi(5),
        "Ei" => 1024.0_f64.powi(6),
        exp if exp.starts_with('e') || exp.starts_with('E') => {
            let power: i32 = exp[1..].parse().ok()?;
            10f64.powi(power)
        }
        _ => return None,
    };

    Some(value * multiplier)
}

/// Formats a number back into a quantity, using millis when it has a fraction.
pub fn format_quantity(value: f64) -> Quantity {
    if (value - value.round()).abs() < 1e-9 {
        Quantity(format!("{}", value.round() as i64))
    } else {
        Quantity(format!("{}m", (value * 1000.0).round() as i64))
    }
}

fn combine(a: &ResourceList, b: &ResourceList, op: impl Fn(f64, f64) -> f64) -> ResourceList {
    let mut result = a.clone();
    for (name, quantity) in b {
        let merged = match result.get(name) {
            Some(existing) => match (parse_quantity(existing), parse_quantity(quantity)) {
                (Some(x), Some(y)) => format_quantity(op(x, y)),
                (None, _) => quantity.clone(),
                (_, None) => existing.clone(),
            },
            None => quantity.clone(),
        };
        result.insert(name.clone(), merged);
    }
    result
}

pub fn add(a: &ResourceList, b: &ResourceList) -> ResourceList {
    combine(a, b, |x, y| x + y)
}

pub fn max(a: &ResourceList, b: &ResourceList) -> ResourceList {
    combine(a, b, f64::max)
}

pub fn multiply(factor: i64, list: &ResourceList) -> ResourceList {
    list.iter()
        .map(|(name, q)| {
            let scaled = parse_quantity(q)
                .map(|v| format_quantity(v * factor as f64))
                .unwrap_or_else(|| q.clone());
            (name.clone(), scaled)
        })
        .collect()
}

fn limits_of(c: &Container) -> ResourceList {
    c.resources
        .as_ref()
        .and_then(|r| r.limits.clone())
        .unwrap_or_default()
}

fn requests_of(c: &Container) -> ResourceList {
    c.resources
        .as_ref()
        .and_then(|r| r.requests.clone())
        .unwrap_or_default()
}

pub fn sum_containers(containers: &[Container]) -> (ResourceList, ResourceList) {
    containers.iter().fold(
        (ResourceList::new(), ResourceList::new()),
        |(limits, requests), c| (add(&limits, &limits_of(c)), add(&requests, &requests_of(c))),
    )
}

pub fn max_containers(containers: &[Container]) -> (ResourceList, ResourceList) {
    containers.iter().fold(
        (ResourceList::new(), ResourceList::new()),
        |(limits, requests), c| (max(&limits, &limits_of(c)), max(&requests, &requests_of(c))),
    )
}

/// Effective resources of one pod: the larger of the biggest init container
/// and the sum of the regular containers.
pub fn pod_resources(spec: &PodSpec) -> ResourceRequirements {
    let init_containers = spec.init_containers.as_deref().unwrap_or_default();
    let (init_limits, init_requests) = max_containers(init_containers);
    let (limits, requests) = sum_containers(&spec.containers);

    ResourceRequirements {
        limits: Some(max(&init_limits, &limits)),
        requests: Some(max(&init_requests, &requests)),
        ..Default::default()
    }
}

pub fn replicas_of(replicas: Option<i32>) -> i32 {
    replicas.unwrap_or(1)
}

/// Total requests of a job: per-replica requests times replicas, summed over
/// replica types.
pub fn aggregate_job_resources(specs: &ReplicaSpecs) -> ResourceList {
    specs.values().fold(ResourceList::new(), |total, spec| {
        let per_replica = spec
            .template
            .spec
            .as_ref()
            .map(pod_resources)
            .and_then(|r| r.requests)
            .unwrap_or_default();
        add(&total, &multiply(replicas_of(spec.replicas) as i64, &per_replica))
    })
}

pub fn gpu_count(list: &ResourceList) -> i64 {
    list.get(RESOURCE_NVIDIA_GPU)
        .and_then(parse_quantity)
        .map(|v| v as i64)
        .unwrap_or(0)
}
