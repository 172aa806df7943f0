//! Status derivation from observed backend state

use cirrus_backend::region::Server;
use cirrus_common::crd::{
    ClusterPhase, HealthStatus, MachineStatus, ProvisioningStatus, WorkloadPoolStatus,
};
use cirrus_common::Error;

use crate::server::ServerSet;

/// Machine view of a backend server
pub fn machine_status(server: &Server) -> MachineStatus {
    MachineStatus {
        hostname: server.metadata.name.clone(),
        id: server.metadata.id.clone(),
        image_id: server.spec.image_id.clone(),
        flavor_id: server.spec.flavor_id.clone(),
        private_ip: server.status.private_ip.clone(),
        public_ip: server.status.public_ip.clone(),
        provisioning_status: server
            .metadata
            .provisioning()
            .unwrap_or(ProvisioningStatus::Unknown),
        health_status: server.metadata.health(),
    }
}

/// Per-pool status for every declared pool, then any leftover pools
///
/// Pools no longer declared still show up while their servers drain.
pub fn pool_statuses(set: &ServerSet, declared: &[String]) -> Vec<WorkloadPoolStatus> {
    let mut statuses: Vec<WorkloadPoolStatus> = declared
        .iter()
        .map(|name| pool_status(set, name))
        .collect();

    statuses.extend(
        set.pool_names()
            .filter(|name| !declared.iter().any(|d| d == name))
            .map(|name| pool_status(set, name)),
    );
    statuses
}

fn pool_status(set: &ServerSet, name: &str) -> WorkloadPoolStatus {
    let machines: Vec<MachineStatus> = set
        .pool(name)
        .map(|servers| servers.values().map(machine_status).collect())
        .unwrap_or_default();

    WorkloadPoolStatus {
        name: name.to_string(),
        replicas: machines.len() as u32,
        machines,
    }
}

/// Worst health across all machines; unknown when there are none
pub fn aggregate_health(pools: &[WorkloadPoolStatus]) -> HealthStatus {
    let mut machines = pools.iter().flat_map(|p| p.machines.iter()).peekable();
    if machines.peek().is_none() {
        return HealthStatus::Unknown;
    }
    machines.fold(HealthStatus::Healthy, |acc, m| acc.worst(m.health_status))
}

/// Phase and message for the outcome of the reconcile stage of a pass
///
/// `Ok(n)` carries the number of backend mutations the pass issued.
pub fn phase_for(outcome: &Result<usize, Error>, paused: bool) -> (ClusterPhase, Option<String>) {
    match outcome {
        Ok(0) => (ClusterPhase::Stable, None),
        Ok(n) => (
            ClusterPhase::Reconciling,
            Some(format!("{} changes applied", n)),
        ),
        Err(e) if e.is_yield() && paused => (ClusterPhase::Evicting, Some(e.to_string())),
        Err(e) if e.is_yield() => (ClusterPhase::Reconciling, Some(e.to_string())),
        Err(e) => (ClusterPhase::Failed, Some(e.to_string())),
    }
}

/// Phase for a failure before servers were observed
pub fn phase_for_resolution(err: &Error) -> (ClusterPhase, Option<String>) {
    if err.is_yield() {
        (ClusterPhase::ResolvingDependencies, Some(err.to_string()))
    } else {
        (ClusterPhase::Failed, Some(err.to_string()))
    }
}
