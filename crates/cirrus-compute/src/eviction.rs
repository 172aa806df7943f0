//! Targeted machine eviction
//!
//! Removing specific machines races the server reconciler, which would
//! recreate them as soon as they disappear. The coordinator pauses the
//! cluster and records the targets in the eviction hint, deletes the
//! servers, shrinks the allocation, and finally writes the reduced replica
//! counts while clearing the pause in a single conditional write.
//!
//! If any step fails, the pause and hint are cleared with the replica counts
//! untouched, a shrunk allocation is grown back to match them, and
//! [`Error::EvictionFailed`] reports which servers were already deleted. The
//! reconciler then replaces those servers on its next pass. Failures while
//! undoing are reported through [`Error::CompensationFailed`] as the source.

use std::collections::{BTreeMap, BTreeSet};

use kube::ResourceExt;
use tracing::{error, info, instrument, warn};

use cirrus_backend::Backends;
use cirrus_common::crd::{ComputeCluster, WorkloadPoolSpec};
use cirrus_common::store::{modify, ObjectKey, ObjectStore};
use cirrus_common::{Error, Result};

use crate::allocation::sync_allocation;
use crate::resource::ManagedResource;
use crate::server::ServerSet;

/// A server selected for eviction
#[derive(Clone, Debug, PartialEq, Eq)]
struct Target {
    id: String,
    name: String,
    pool: String,
}

fn ensure_evictable(key: &ObjectKey, cluster: &ComputeCluster) -> Result<()> {
    if cluster.is_deleting() {
        return Err(Error::conflict(key.to_string(), "cluster is being deleted"));
    }
    if cluster.spec.control.eviction_in_flight() {
        return Err(Error::conflict(
            key.to_string(),
            "another eviction is in progress",
        ));
    }
    Ok(())
}

/// Replica counts after removing `targets`
fn decremented(pools: &[WorkloadPoolSpec], targets: &[Target]) -> Vec<WorkloadPoolSpec> {
    let mut removed: BTreeMap<&str, u32> = BTreeMap::new();
    for target in targets {
        *removed.entry(target.pool.as_str()).or_default() += 1;
    }

    pools
        .iter()
        .cloned()
        .map(|mut pool| {
            if let Some(n) = removed.get(pool.name.as_str()) {
                pool.replicas = pool.replicas.saturating_sub(*n);
            }
            pool
        })
        .collect()
}

async fn resolve_targets(
    backends: &Backends,
    cluster: &ComputeCluster,
    machine_ids: &[String],
) -> Result<Vec<Target>> {
    let resource = cluster.name_any();
    let requested: BTreeSet<&str> = machine_ids.iter().map(String::as_str).collect();
    if requested.is_empty() {
        return Err(Error::validation_for_field(
            resource,
            "machineIds",
            "at least one machine is required",
        ));
    }

    let set = match &cluster.spec.control.identity_id {
        Some(identity_id) => {
            let scope = cluster.scope().identity(identity_id.as_str());
            ServerSet::build(
                backends
                    .region
                    .list_servers(&scope, &cluster.owner()?)
                    .await?,
            )?
        }
        None => ServerSet::default(),
    };

    requested
        .into_iter()
        .map(|id| {
            let (pool, server) = set.find_by_id(id).ok_or_else(|| {
                Error::validation_for_field(
                    resource.as_str(),
                    "machineIds",
                    format!("machine {} does not belong to the cluster", id),
                )
            })?;
            if server.metadata.is_deprovisioning() {
                return Err(Error::validation_for_field(
                    resource.as_str(),
                    "machineIds",
                    format!("machine {} is already being deleted", id),
                ));
            }
            if cluster.spec.pool(pool).is_none() {
                return Err(Error::validation_for_field(
                    resource.as_str(),
                    "machineIds",
                    format!("machine {} belongs to removed pool {}", id, pool),
                ));
            }
            Ok(Target {
                id: id.to_string(),
                name: server.metadata.name.clone(),
                pool: pool.to_string(),
            })
        })
        .collect()
}

/// Delete the targets, recording each one as it goes
async fn delete_targets(
    backends: &Backends,
    cluster: &ComputeCluster,
    targets: &[Target],
    deleted: &mut Vec<String>,
) -> Result<()> {
    let identity_id = cluster.spec.control.identity_id.as_deref().ok_or_else(|| {
        Error::internal_with_context("eviction", "cluster has no identity")
    })?;
    let scope = cluster.scope().identity(identity_id);

    for target in targets {
        info!(server = %target.name, id = %target.id, pool = %target.pool, "evicting server");
        // A server already gone counts as deleted
        backends.region.delete_server(&scope, &target.id).await?;
        deleted.push(target.id.clone());
    }
    Ok(())
}

/// Progress of an eviction, consulted when it has to be undone
#[derive(Default)]
struct Progress {
    deleted: Vec<String>,
    /// Allocation ID once it has been shrunk
    shrunk: Option<String>,
}

async fn apply_eviction(
    store: &dyn ObjectStore<ComputeCluster>,
    backends: &Backends,
    key: &ObjectKey,
    paused: &ComputeCluster,
    targets: &[Target],
    progress: &mut Progress,
) -> Result<ComputeCluster> {
    delete_targets(backends, paused, targets, &mut progress.deleted).await?;

    let pools = decremented(&paused.spec.workload_pools, targets);
    let allocation_id = sync_allocation(backends, paused, &pools).await?;
    progress.shrunk = Some(allocation_id.clone());

    modify(store, key, |c: &mut ComputeCluster| {
        c.spec.workload_pools = decremented(&c.spec.workload_pools, targets);
        c.spec.control.paused = false;
        c.spec.control.eviction_hint.clear();
        c.spec.control.allocation_id = Some(allocation_id.clone());
        Ok(())
    })
    .await
}

/// Put the allocation back to the pre-eviction pools
async fn restore_allocation(
    backends: &Backends,
    paused: &ComputeCluster,
    allocation_id: &str,
) -> Result<()> {
    let mut original = paused.clone();
    original.spec.control.allocation_id = Some(allocation_id.to_string());
    sync_allocation(backends, &original, &paused.spec.workload_pools).await?;
    Ok(())
}

/// Remove specific machines from a cluster and shrink their pools
///
/// Returns the cluster as persisted after the eviction.
#[instrument(skip(store, backends), fields(cluster = %key))]
pub async fn evict_machines(
    store: &dyn ObjectStore<ComputeCluster>,
    backends: &Backends,
    key: &ObjectKey,
    machine_ids: &[String],
) -> Result<ComputeCluster> {
    let cluster = store
        .get(key)
        .await?
        .ok_or_else(|| Error::not_found("ComputeCluster", key.to_string()))?;
    ensure_evictable(key, &cluster)?;

    let targets = resolve_targets(backends, &cluster, machine_ids).await?;
    let hint: Vec<String> = targets.iter().map(|t| t.id.clone()).collect();

    let paused = modify(store, key, |c: &mut ComputeCluster| {
        ensure_evictable(key, c)?;
        c.spec.control.paused = true;
        c.spec.control.eviction_hint = hint.clone();
        Ok(())
    })
    .await?;

    let mut progress = Progress::default();
    let source = match apply_eviction(store, backends, key, &paused, &targets, &mut progress).await
    {
        Ok(cluster) => {
            info!(evicted = targets.len(), "eviction complete");
            return Ok(cluster);
        }
        Err(source) => source,
    };

    warn!(error = %source, deleted = ?progress.deleted, "eviction failed, unpausing");
    let mut failures = Vec::new();

    if let Some(allocation_id) = &progress.shrunk {
        if let Err(e) = restore_allocation(backends, &paused, allocation_id).await {
            error!(error = %e, allocation = %allocation_id, "failed to restore allocation");
            failures.push(format!("restore allocation: {}", e));
        }
    }

    let restored = modify(store, key, |c: &mut ComputeCluster| {
        c.spec.control.paused = false;
        c.spec.control.eviction_hint.clear();
        Ok(())
    })
    .await;
    if let Err(e) = restored {
        error!(error = %e, "failed to unpause cluster after eviction failure");
        failures.push(format!("unpause: {}", e));
    }

    let source = if failures.is_empty() {
        source
    } else {
        Error::CompensationFailed {
            failures,
            source: Box::new(source),
        }
    };
    Err(Error::EvictionFailed {
        deleted: progress.deleted,
        source: Box::new(source),
    })
}
