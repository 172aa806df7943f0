//! Custom Resource Definitions for Cirrus
//!
//! `ComputeCluster` and `ComputeInstance` plus the shared types they embed.

mod cluster;
mod instance;
mod types;

pub use cluster::{
    ComputeCluster, ComputeClusterSpec, ComputeClusterStatus, WorkloadPoolSpec,
    WorkloadPoolStatus,
};
pub use instance::{ComputeInstance, ComputeInstanceSpec, ComputeInstanceStatus};
pub use types::{
    validate_dns_identifier, AllowedAddressPair, ClusterPhase, Condition, ConditionStatus,
    ControlState, FirewallDirection, FirewallProtocol, FirewallRule, HealthStatus, ImageSelector,
    ImageSpec, MachineStatus, ProvisioningStatus,
};
