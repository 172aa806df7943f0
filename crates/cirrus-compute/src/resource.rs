//! Shared view over clusters and instances
//!
//! Both kinds run the same provisioning sequence. [`ManagedResource`]
//! exposes the pieces that sequence needs, and [`StatusReport`] carries
//! what a pass observed back into the kind-specific status type.

use chrono::Utc;
use kube::ResourceExt;

use cirrus_backend::{Owner, ProjectScope};
use cirrus_common::crd::{
    ClusterPhase, Condition, ConditionStatus, ControlState, HealthStatus, WorkloadPoolSpec,
    WorkloadPoolStatus,
};
use cirrus_common::store::StoredObject;
use cirrus_common::{Error, Result, RELEASE_FINALIZER};

/// Condition type summarizing readiness
pub const READY_CONDITION: &str = "Ready";

/// What one pass observed
#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    /// Per-pool machines
    pub pools: Vec<WorkloadPoolStatus>,
    /// Worst machine health
    pub health: HealthStatus,
    /// SSH key from the region identity
    pub ssh_private_key: Option<String>,
}

/// Status produced by a pass
#[derive(Clone, Debug, PartialEq)]
pub struct StatusReport {
    /// Lifecycle phase
    pub phase: ClusterPhase,
    /// Why the phase is what it is
    pub message: Option<String>,
    /// Machine state; `None` leaves the recorded machines untouched
    pub observation: Option<Observation>,
    /// Generation the pass acted on
    pub observed_generation: Option<i64>,
}

impl StatusReport {
    /// Report a phase without machine data
    pub fn phase(phase: ClusterPhase, message: Option<String>) -> Self {
        Self {
            phase,
            message,
            observation: None,
            observed_generation: None,
        }
    }

    /// The Ready condition for this report
    ///
    /// Keeps the previous transition time when the status and reason match
    /// so that re-reporting an unchanged state is a no-op write.
    pub fn ready_condition(&self, previous: &[Condition]) -> Condition {
        let status = match self.phase {
            ClusterPhase::Stable => ConditionStatus::True,
            ClusterPhase::Failed => ConditionStatus::False,
            _ => ConditionStatus::Unknown,
        };
        let reason = self.phase.to_string();
        let message = self.message.clone().unwrap_or_default();

        let last_transition_time = previous
            .iter()
            .find(|c| c.type_ == READY_CONDITION && c.status == status && c.reason == reason)
            .map(|c| c.last_transition_time)
            .unwrap_or_else(Utc::now);

        Condition {
            type_: READY_CONDITION.to_string(),
            status,
            reason,
            message,
            last_transition_time,
        }
    }
}

/// Replace the condition of the same type in place, or append it
pub(crate) fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => *existing = condition,
        None => conditions.push(condition),
    }
}

/// A persisted object the provisioner drives
pub trait ManagedResource: StoredObject {
    /// Status subresource type
    type Status: Clone + PartialEq + Send + Sync;

    /// Kind recorded on the quota allocation
    const ALLOCATION_KIND: &'static str;

    /// Whether the object consumes a `clusters` quota unit
    const COUNTS_AS_CLUSTER: bool;

    /// Whether a referenced network may live outside the object's identity
    const EXTERNAL_NETWORK_ALLOWED: bool;

    /// Owner used to tag region resources
    fn owner(&self) -> Result<Owner>;

    /// Organization and project
    fn scope(&self) -> ProjectScope;

    /// Region the servers run in
    fn region_id(&self) -> &str;

    /// Controller-owned references
    fn control(&self) -> &ControlState;

    /// Mutable controller-owned references
    fn control_mut(&mut self) -> &mut ControlState;

    /// Workload pools, an instance being a pool of one
    fn pools(&self) -> Vec<WorkloadPoolSpec>;

    /// Name of the security group for `pool`
    fn security_group_name(&self, pool: &str) -> String;

    /// Recorded status, if any
    fn status_ref(&self) -> Option<&Self::Status>;

    /// Fold a report into the recorded status
    fn apply_report(&mut self, report: &StatusReport);

    /// Whether deletion has been requested
    fn is_deleting(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    /// Whether the release finalizer is present
    fn holds_release(&self) -> bool {
        self.finalizers().iter().any(|f| f == RELEASE_FINALIZER)
    }
}

/// The object's uid, required to tag region resources
pub(crate) fn require_uid<K: ManagedResource>(obj: &K) -> Result<String> {
    obj.uid().ok_or_else(|| {
        Error::internal_with_context(
            "owner",
            format!("{} {} has no uid", K::kind(&()), obj.name_any()),
        )
    })
}
