//! Reconciliation engine for compute clusters and instances
//!
//! Each pass resolves the object's region identity and network, converges
//! security groups and servers towards the declared pools, and records what
//! it observed in status. Passes are idempotent: against a converged backend
//! they issue no mutations. Quota is tracked as an allocation in the
//! identity service, reserved before an object is created and resized when
//! its pools change.

#![deny(missing_docs)]

pub mod allocation;
pub mod context;
pub mod controller;
pub mod eviction;
pub mod pool;
pub mod provisioner;
pub mod resolver;
pub mod resource;
pub mod saga;
pub mod security_group;
pub mod server;
pub mod service;
pub mod status;

#[cfg(test)]
mod testing;

pub use context::{Context, ContextBuilder, ReconcileSettings, YieldTracker};
pub use controller::{
    error_policy_cluster, error_policy_instance, reconcile_cluster, reconcile_instance,
};
pub use resource::ManagedResource;
pub use service::{ComputeService, CreateClusterRequest, CreateInstanceRequest};
