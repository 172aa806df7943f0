use kube::ResourceExt;

use cirrus_backend::{Owner, ProjectScope};
use cirrus_common::crd::{
    ComputeInstance, ComputeInstanceStatus, ControlState, WorkloadPoolSpec,
};
use cirrus_common::Result;

use crate::resource::{require_uid, set_condition, ManagedResource, StatusReport};

/// An instance is a pool of one named after itself, so its server is `{name}-0`
impl ManagedResource for ComputeInstance {
    type Status = ComputeInstanceStatus;

    const ALLOCATION_KIND: &'static str = "computeinstance";
    const COUNTS_AS_CLUSTER: bool = false;
    const EXTERNAL_NETWORK_ALLOWED: bool = true;

    fn owner(&self) -> Result<Owner> {
        Ok(Owner::Instance(require_uid(self)?))
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
        vec![self.spec.as_pool(&self.name_any())]
    }

    fn security_group_name(&self, _pool: &str) -> String {
        self.name_any()
    }

    fn status_ref(&self) -> Option<&ComputeInstanceStatus> {
        self.status.as_ref()
    }

    fn apply_report(&mut self, report: &StatusReport) {
        let name = self.name_any();
        let status = self.status.get_or_insert_with(Default::default);
        status.phase = report.phase.clone();
        status.message = report.message.clone();
        let ready = report.ready_condition(&status.conditions);
        set_condition(&mut status.conditions, ready);

        if let Some(observation) = &report.observation {
            status.machine = observation
                .pools
                .iter()
                .find(|p| p.name == name)
                .and_then(|p| p.machines.first().cloned());
            status.health = observation.health;
            status.ssh_private_key = observation.ssh_private_key.clone();
        }
        if report.observed_generation.is_some() {
            status.observed_generation = report.observed_generation;
        }
    }
}
