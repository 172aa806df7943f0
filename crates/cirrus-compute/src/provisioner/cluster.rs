use kube::ResourceExt;

use cirrus_backend::{Owner, ProjectScope};
use cirrus_common::crd::{ComputeCluster, ComputeClusterStatus, ControlState, WorkloadPoolSpec};
use cirrus_common::Result;

use crate::resource::{require_uid, set_condition, ManagedResource, StatusReport};

impl ManagedResource for ComputeCluster {
    type Status = ComputeClusterStatus;

    const ALLOCATION_KIND: &'static str = "computecluster";
    const COUNTS_AS_CLUSTER: bool = true;
    const EXTERNAL_NETWORK_ALLOWED: bool = false;

    fn owner(&self) -> Result<Owner> {
        Ok(Owner::Cluster(require_uid(self)?))
    }

    fn scope(&self) -> ProjectScope {
        ProjectScope::new(
            self.spec.organization_id.as_str(),
            self.spec.project_id.as_str(),
        )
    }

    fn region_id(&self) -> &str {
        &self.spec.region_id
    }

    fn control(&self) -> &ControlState {
        &self.spec.control
    }

    fn control_mut(&mut self) -> &mut ControlState {
        &mut self.spec.control
    }

    fn pools(&self) -> Vec<WorkloadPoolSpec> {
        self.spec.workload_pools.clone()
    }

    fn security_group_name(&self, pool: &str) -> String {
        format!("{}-{}", self.name_any(), pool)
    }

    fn status_ref(&self) -> Option<&ComputeClusterStatus> {
        self.status.as_ref()
    }

    fn apply_report(&mut self, report: &StatusReport) {
        let status = self.status.get_or_insert_with(Default::default);
        status.phase = report.phase.clone();
        status.message = report.message.clone();
        let ready = report.ready_condition(&status.conditions);
        set_condition(&mut status.conditions, ready);

        if let Some(observation) = &report.observation {
            status.workload_pools = observation.pools.clone();
            status.health = observation.health;
            status.ssh_private_key = observation.ssh_private_key.clone();
        }
        if report.observed_generation.is_some() {
            status.observed_generation = report.observed_generation;
        }
    }
}
