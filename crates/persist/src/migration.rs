//! Normalization of job specs written against older API versions.
//!
//! Every function here is pure and idempotent: running it on an already
//! migrated spec leaves the spec unchanged.

use k8s_openapi::api::core::v1::PodTemplateSpec;

use crate::convert::resources::{parse_quantity, RESOURCE_NVIDIA_GPU};
use crate::crd::training::{MPILegacySpec, MPI_REPLICA_TYPE_LAUNCHER, MPI_REPLICA_TYPE_WORKER};
use crate::crd::{CleanPodPolicy, FlatRunPolicy, MPIJobSpec, ReplicaSpec, ReplicaSpecs, RunPolicy};
use crate::{Error, Result};

/// Returns the structured run policy, building it from the flat spec fields
/// when absent. Clean pod policy defaults to `Running`.
pub fn run_policy_from(run_policy: Option<&RunPolicy>, flat: &FlatRunPolicy) -> RunPolicy {
    let mut policy = run_policy.cloned().unwrap_or_else(|| RunPolicy {
        clean_pod_policy: flat.clean_pod_policy,
        ttl_seconds_after_finished: flat.ttl_seconds_after_finished,
        active_deadline_seconds: flat.active_deadline_seconds,
        backoff_limit: flat.backoff_limit,
    });
    if policy.clean_pod_policy.is_none() {
        policy.clean_pod_policy = Some(CleanPodPolicy::Running);
    }
    policy
}

/// Upper-cases the first letter of every replica type, so `master` and
/// `Master` land under the same key.
pub fn canonicalize_replica_types(specs: ReplicaSpecs) -> ReplicaSpecs {
    specs
        .into_iter()
        .map(|(rtype, spec)| {
            let mut chars = rtype.chars();
            let key = match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => rtype,
            };
            (key, spec)
        })
        .collect()
}

/// Workers and units per worker implied by the legacy fields. Zero means
/// "not determined".
fn units_per_worker(legacy: &MPILegacySpec) -> Result<(i32, i32)> {
    if legacy.deprecated_gpus.is_some() && legacy.processing_units.is_some() {
        return Err(Error::Validation(
            "cannot specify both gpus and processingUnits".to_string(),
        ));
    }

    let total_and_per_node = match (legacy.deprecated_gpus, legacy.processing_units) {
        (Some(gpus), _) => Some((gpus, legacy.gpus_per_node.unwrap_or(1))),
        (None, Some(units)) => Some((units, legacy.processing_units_per_node.unwrap_or(1))),
        (None, None) => None,
    };

    if let Some((total, per_node)) = total_and_per_node {
        if per_node <= 0 {
            return Err(Error::Validation(format!("invalid units per node {}", per_node)));
        }
        if total < per_node {
            return Ok((1, total));
        }
        if total % per_node == 0 {
            return Ok((total / per_node, per_node));
        }
        return Err(Error::Validation(format!(
            "processing units {} must be a multiple of units per node {}",
            total, per_node
        )));
    }

    let (Some(replicas), Some(template)) = (legacy.replicas, legacy.template.as_ref()) else {
        return Ok((0, 0));
    };
    let Some(container) = template.spec.as_ref().and_then(|s| s.containers.first()) else {
        return Ok((0, 0));
    };

    let resource_type = if legacy.processing_resource_type.is_empty() {
        RESOURCE_NVIDIA_GPU
    } else {
        legacy.processing_resource_type.as_str()
    };
    let units = container
        .resources
        .as_ref()
        .and_then(|r| r.limits.as_ref())
        .and_then(|l| l.get(resource_type))
        .and_then(parse_quantity)
        .map(|v| v as i32)
        .unwrap_or(0);

    Ok((replicas, units))
}

/// Rewrites the flat legacy MPIJob fields into replica specs.
pub fn migrate_mpi_legacy(spec: &mut MPIJobSpec) -> Result<()> {
    if let Some(policy) = spec.clean_pod_policy {
        spec.run_policy.get_or_insert_with(RunPolicy::default).clean_pod_policy = Some(policy);
    }
    if let Some(limit) = spec.backoff_limit {
        let run_policy = spec.run_policy.get_or_insert_with(RunPolicy::default);
        if run_policy.backoff_limit.is_none() {
            run_policy.backoff_limit = Some(limit);
        }
    }

    if !spec.legacy.is_set() {
        return Ok(());
    }

    let (workers, units) = units_per_worker(&spec.legacy)?;
    if spec.slots_per_worker.is_none() && units > 0 {
        spec.slots_per_worker = Some(units);
    }

    let template: PodTemplateSpec = spec.legacy.template.clone().unwrap_or_default();
    let specs = spec.mpi_replica_specs.get_or_insert_with(ReplicaSpecs::new);

    let worker_missing = specs
        .get(MPI_REPLICA_TYPE_WORKER)
        .map_or(true, |w| w.replicas.is_none());
    if worker_missing && workers > 0 {
        let worker = specs.entry(MPI_REPLICA_TYPE_WORKER.to_string()).or_default();
        worker.replicas = Some(workers);
        worker.template = template.clone();
    }

    specs
        .entry(MPI_REPLICA_TYPE_LAUNCHER.to_string())
        .or_insert_with(|| ReplicaSpec {
            replicas: Some(1),
            template,
            ..Default::default()
        });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodSpec, ResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use std::collections::BTreeMap;

    fn template_with_gpus(gpus: &str) -> PodTemplateSpec {
        let mut limits = BTreeMap::new();
        limits.insert(RESOURCE_NVIDIA_GPU.to_string(), Quantity(gpus.to_string()));
        PodTemplateSpec {
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "mpi".to_string(),
                    resources: Some(ResourceRequirements {
                        limits: Some(limits),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn legacy_spec(legacy: MPILegacySpec) -> MPIJobSpec {
        MPIJobSpec {
            legacy,
            ..Default::default()
        }
    }

    #[test]
    fn test_gpus_split_across_nodes() {
        let mut spec = legacy_spec(MPILegacySpec {
            deprecated_gpus: Some(16),
            gpus_per_node: Some(8),
            template: Some(template_with_gpus("8")),
            ..Default::default()
        });

        migrate_mpi_legacy(&mut spec).unwrap();

        let specs = spec.mpi_replica_specs.as_ref().unwrap();
        assert_eq!(specs[MPI_REPLICA_TYPE_WORKER].replicas, Some(2));
        assert_eq!(specs[MPI_REPLICA_TYPE_LAUNCHER].replicas, Some(1));
        assert_eq!(spec.slots_per_worker, Some(8));
    }

    #[test]
    fn test_fewer_units_than_per_node() {
        let mut spec = legacy_spec(MPILegacySpec {
            processing_units: Some(2),
            processing_units_per_node: Some(4),
            ..Default::default()
        });

        migrate_mpi_legacy(&mut spec).unwrap();

        let specs = spec.mpi_replica_specs.as_ref().unwrap();
        assert_eq!(specs[MPI_REPLICA_TYPE_WORKER].replicas, Some(1));
        assert_eq!(spec.slots_per_worker, Some(2));
    }

    #[test]
    fn test_indivisible_units_rejected() {
        let mut spec = legacy_spec(MPILegacySpec {
            deprecated_gpus: Some(12),
            gpus_per_node: Some(8),
            ..Default::default()
        });
        assert!(matches!(migrate_mpi_legacy(&mut spec), Err(Error::Validation(_))));
    }

    #[test]
    fn test_gpus_and_units_conflict() {
        let mut spec = legacy_spec(MPILegacySpec {
            deprecated_gpus: Some(8),
            processing_units: Some(8),
            ..Default::default()
        });
        assert!(matches!(migrate_mpi_legacy(&mut spec), Err(Error::Validation(_))));
    }

    #[test]
    fn test_replicas_with_container_limits() {
        let mut spec = legacy_spec(MPILegacySpec {
            replicas: Some(3),
            template: Some(template_with_gpus("4")),
            ..Default::default()
        });

        migrate_mpi_legacy(&mut spec).unwrap();

        let specs = spec.mpi_replica_specs.as_ref().unwrap();
        assert_eq!(specs[MPI_REPLICA_TYPE_WORKER].replicas, Some(3));
        assert_eq!(spec.slots_per_worker, Some(4));
    }

    #[test]
    fn test_existing_values_win_and_idempotent() {
        let mut specs = ReplicaSpecs::new();
        specs.insert(
            MPI_REPLICA_TYPE_WORKER.to_string(),
            ReplicaSpec {
                replicas: Some(5),
                ..Default::default()
            },
        );
        let mut spec = MPIJobSpec {
            mpi_replica_specs: Some(specs),
            slots_per_worker: Some(1),
            clean_pod_policy: Some(CleanPodPolicy::All),
            legacy: MPILegacySpec {
                deprecated_gpus: Some(16),
                gpus_per_node: Some(8),
                ..Default::default()
            },
            ..Default::default()
        };

        migrate_mpi_legacy(&mut spec).unwrap();
        let once = serde_json::to_value(&spec).unwrap();
        migrate_mpi_legacy(&mut spec).unwrap();
        assert_eq!(serde_json::to_value(&spec).unwrap(), once);

        let specs = spec.mpi_replica_specs.as_ref().unwrap();
        assert_eq!(specs[MPI_REPLICA_TYPE_WORKER].replicas, Some(5));
        assert_eq!(spec.slots_per_worker, Some(1));
        assert_eq!(
            spec.run_policy.as_ref().unwrap().clean_pod_policy,
            Some(CleanPodPolicy::All)
        );
    }

    #[test]
    fn test_run_policy_from_flat_fields() {
        let flat = FlatRunPolicy {
            backoff_limit: Some(3),
            ..Default::default()
        };
        let policy = run_policy_from(None, &flat);
        assert_eq!(policy.backoff_limit, Some(3));
        assert_eq!(policy.clean_pod_policy, Some(CleanPodPolicy::Running));

        let explicit = RunPolicy {
            clean_pod_policy: Some(CleanPodPolicy::None),
            ..Default::default()
        };
        assert_eq!(run_policy_from(Some(&explicit), &flat), explicit);
    }

    #[test]
    fn test_canonicalize_replica_types() {
        let mut specs = ReplicaSpecs::new();
        specs.insert("master".to_string(), ReplicaSpec::default());
        specs.insert("Worker".to_string(), ReplicaSpec::default());

        let specs = canonicalize_replica_types(specs);
        let mut keys: Vec<_> = specs.keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, vec!["Master", "Worker"]);
    }
}
