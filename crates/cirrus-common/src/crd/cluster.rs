//! ComputeCluster Custom Resource Definition
//!
//! A ComputeCluster is a set of workload pools, each a group of identically
//! configured servers in a region. Servers, security groups, and the network
//! are owned by a region identity created for the cluster.

use std::collections::BTreeSet;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    field_error, validate_dns_identifier, AllowedAddressPair, ClusterPhase, Condition,
    ControlState, FirewallRule, HealthStatus, ImageSpec, MachineStatus,
};

/// Specification for a ComputeCluster
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "compute.cirrus.dev",
    version = "v1alpha1",
    kind = "ComputeCluster",
    plural = "computeclusters",
    shortname = "cc",
    status = "ComputeClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Region","type":"string","jsonPath":".spec.regionId"}"#,
    printcolumn = r#"{"name":"Health","type":"string","jsonPath":".status.health"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ComputeClusterSpec {
    /// Organization owning the cluster
    pub organization_id: String,

    /// Project the cluster is billed to
    pub project_id: String,

    /// Region the cluster's servers run in
    pub region_id: String,

    /// Workload pools, unique by name
    #[serde(default)]
    pub workload_pools: Vec<WorkloadPoolSpec>,

    /// Controller-owned references and eviction coordination
    #[serde(default)]
    pub control: ControlState,
}

/// A group of identically configured servers
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadPoolSpec {
    /// Pool name; server names are derived from it
    pub name: String,

    /// Number of servers
    pub replicas: u32,

    /// Region flavor servers run on
    pub flavor_id: String,

    /// Image servers boot from
    pub image: ImageSpec,

    /// Root disk size; not reconciled against existing servers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_size_gib: Option<u32>,

    /// Firewall rules; a non-empty list creates a pool security group
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub firewall: Vec<FirewallRule>,

    /// Allocate a public IP per server
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub public_ip: bool,

    /// Extra addresses servers may send from
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_address_pairs: Vec<AllowedAddressPair>,

    /// Base64 cloud-init payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
}

impl WorkloadPoolSpec {
    fn validate(&self, resource: &str, index: usize) -> Result<(), crate::Error> {
        let path = format!("spec.workloadPools[{}]", index);

        validate_dns_identifier(&self.name)
            .map_err(|e| field_error(resource, format!("{}.name", path), e))?;

        if self.flavor_id.is_empty() {
            return Err(field_error(
                resource,
                format!("{}.flavorId", path),
                "flavor cannot be empty".to_string(),
            ));
        }

        self.image
            .validate()
            .map_err(|e| field_error(resource, format!("{}.image", path), e))?;

        for (i, rule) in self.firewall.iter().enumerate() {
            rule.validate()
                .map_err(|e| field_error(resource, format!("{}.firewall[{}]", path, i), e))?;
        }

        Ok(())
    }
}

impl ComputeClusterSpec {
    /// Validate the cluster specification
    ///
    /// Pool names must be unique DNS labels; every pool needs a flavor and
    /// exactly one image reference.
    pub fn validate(&self, resource: &str) -> Result<(), crate::Error> {
        for (field, value) in [
            ("spec.organizationId", &self.organization_id),
            ("spec.projectId", &self.project_id),
            ("spec.regionId", &self.region_id),
        ] {
            if value.is_empty() {
                return Err(field_error(
                    resource,
                    field.to_string(),
                    "cannot be empty".to_string(),
                ));
            }
        }

        let mut seen = BTreeSet::new();
        for (i, pool) in self.workload_pools.iter().enumerate() {
            pool.validate(resource, i)?;
            if !seen.insert(pool.name.as_str()) {
                return Err(field_error(
                    resource,
                    format!("spec.workloadPools[{}].name", i),
                    format!("duplicate pool name {}", pool.name),
                ));
            }
        }

        Ok(())
    }

    /// Look up a pool by name
    pub fn pool(&self, name: &str) -> Option<&WorkloadPoolSpec> {
        self.workload_pools.iter().find(|p| p.name == name)
    }

    /// Mutable lookup of a pool by name
    pub fn pool_mut(&mut self, name: &str) -> Option<&mut WorkloadPoolSpec> {
        self.workload_pools.iter_mut().find(|p| p.name == name)
    }

    /// Total servers across all pools
    pub fn total_replicas(&self) -> u32 {
        self.workload_pools.iter().map(|p| p.replicas).sum()
    }
}

/// Observed state of a workload pool
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadPoolStatus {
    /// Pool name
    pub name: String,

    /// Servers observed for the pool
    #[serde(default)]
    pub replicas: u32,

    /// Per-machine state, ordered by hostname
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub machines: Vec<MachineStatus>,
}

/// Status for a ComputeCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComputeClusterStatus {
    /// The generation of the spec that was last processed by the controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Current phase of the cluster lifecycle
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Human-readable message about current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Conditions representing the cluster state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Worst health across all machines
    #[serde(default)]
    pub health: HealthStatus,

    /// Per-pool machine state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workload_pools: Vec<WorkloadPoolStatus>,

    /// SSH key for the cluster's servers, copied from the region identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_private_key: Option<String>,
}

impl ComputeClusterStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: ClusterPhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Set the phase and return self for chaining
    pub fn phase(mut self, phase: ClusterPhase) -> Self {
        self.phase = phase;
        self
    }

    /// Set the message and return self for chaining
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Add a condition, replacing any existing one of the same type
    pub fn condition(mut self, condition: Condition) -> Self {
        self.conditions.retain(|c| c.type_ != condition.type_);
        self.conditions.push(condition);
        self
    }
}
