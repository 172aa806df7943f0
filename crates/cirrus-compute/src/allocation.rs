//! Quota allocations held in the identity service
//!
//! An object's allocation commits one `clusters` unit (clusters only), one
//! `servers` unit per replica, and the flavor's GPU count per replica.
//! Nothing is ever reserved.

use std::collections::BTreeMap;

use tracing::info;

use cirrus_backend::identity::{KIND_CLUSTERS, KIND_GPUS, KIND_SERVERS};
use cirrus_backend::{AllocationWrite, Backends, RegionApi, ResourceAllocation};
use cirrus_common::crd::WorkloadPoolSpec;
use cirrus_common::store::ObjectKey;
use cirrus_common::{Error, Result};

use crate::resource::ManagedResource;

fn committed(kind: &str, amount: u32) -> ResourceAllocation {
    ResourceAllocation {
        kind: kind.to_string(),
        committed: amount,
        reserved: 0,
    }
}

/// Allocation request for `obj` holding `pools`
///
/// Flavors are looked up in the object's region to count GPUs; a pool
/// naming a flavor the region does not offer is a validation error.
pub async fn compute_allocation<K: ManagedResource>(
    region: &dyn RegionApi,
    obj: &K,
    pools: &[WorkloadPoolSpec],
) -> Result<AllocationWrite> {
    let gpus_per_server: BTreeMap<String, u32> = if pools.is_empty() {
        BTreeMap::new()
    } else {
        region
            .list_flavors(&obj.scope().organization_id, obj.region_id())
            .await?
            .into_iter()
            .map(|f| {
                let gpus = f.gpu_count();
                (f.id, gpus)
            })
            .collect()
    };

    let mut servers = 0u32;
    let mut gpus = 0u32;
    for pool in pools {
        let per_server = gpus_per_server.get(&pool.flavor_id).ok_or_else(|| {
            Error::validation_for_field(
                pool.name.as_str(),
                "flavorId",
                format!("flavor {} is not offered in the region", pool.flavor_id),
            )
        })?;
        servers = servers.saturating_add(pool.replicas);
        gpus = gpus.saturating_add(pool.replicas.saturating_mul(*per_server));
    }

    let mut allocations = Vec::with_capacity(3);
    if K::COUNTS_AS_CLUSTER {
        allocations.push(committed(KIND_CLUSTERS, 1));
    }
    allocations.push(committed(KIND_SERVERS, servers));
    allocations.push(committed(KIND_GPUS, gpus));

    Ok(AllocationWrite {
        kind: K::ALLOCATION_KIND.to_string(),
        id: ObjectKey::of(obj).to_string(),
        allocations,
    })
}

/// Bring the object's allocation in line with `pools`
///
/// Updates the recorded allocation, or creates one when none is recorded.
/// Returns the allocation ID.
pub async fn sync_allocation<K: ManagedResource>(
    backends: &Backends,
    obj: &K,
    pools: &[WorkloadPoolSpec],
) -> Result<String> {
    let request = compute_allocation(backends.region.as_ref(), obj, pools).await?;
    let scope = obj.scope();

    let allocation = match &obj.control().allocation_id {
        Some(id) => {
            info!(allocation = %id, servers = request.committed(KIND_SERVERS), "updating allocation");
            backends
                .identity
                .update_allocation(&scope, id, &request)
                .await?
        }
        None => {
            info!(servers = request.committed(KIND_SERVERS), "creating allocation");
            backends.identity.create_allocation(&scope, &request).await?
        }
    };
    Ok(allocation.id)
}
