//! ComputeInstance Custom Resource Definition
//!
//! A single server with the same lifecycle as a cluster. The instance may be
//! attached to a caller-supplied network; otherwise one is created inside its
//! region identity.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::cluster::WorkloadPoolSpec;
use super::types::{
    field_error, validate_dns_identifier, AllowedAddressPair, ClusterPhase, Condition,
    ControlState, FirewallRule, HealthStatus, ImageSpec, MachineStatus,
};

/// Specification for a ComputeInstance
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "compute.cirrus.dev",
    version = "v1alpha1",
    kind = "ComputeInstance",
    plural = "computeinstances",
    shortname = "ci",
    status = "ComputeInstanceStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Flavor","type":"string","jsonPath":".spec.flavorId"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ComputeInstanceSpec {
    /// Organization owning the instance
    pub organization_id: String,

    /// Project the instance is billed to
    pub project_id: String,

    /// Region the server runs in
    pub region_id: String,

    /// Region flavor
    pub flavor_id: String,

    /// Image the server boots from
    pub image: ImageSpec,

    /// Root disk size; not reconciled against an existing server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_size_gib: Option<u32>,

    /// Firewall rules; a non-empty list creates a security group
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub firewall: Vec<FirewallRule>,

    /// Allocate a public IP
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub public_ip: bool,

    /// Extra addresses the server may send from
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_address_pairs: Vec<AllowedAddressPair>,

    /// Base64 cloud-init payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,

    /// Controller-owned references
    #[serde(default)]
    pub control: ControlState,
}

impl ComputeInstanceSpec {
    /// Validate the instance specification
    pub fn validate(&self, resource: &str) -> Result<(), crate::Error> {
        validate_dns_identifier(resource)
            .map_err(|e| field_error(resource, "metadata.name".to_string(), e))?;

        for (field, value) in [
            ("spec.organizationId", &self.organization_id),
            ("spec.projectId", &self.project_id),
            ("spec.regionId", &self.region_id),
            ("spec.flavorId", &self.flavor_id),
        ] {
            if value.is_empty() {
                return Err(field_error(
                    resource,
                    field.to_string(),
                    "cannot be empty".to_string(),
                ));
            }
        }

        self.image
            .validate()
            .map_err(|e| field_error(resource, "spec.image".to_string(), e))?;

        for (i, rule) in self.firewall.iter().enumerate() {
            rule.validate()
                .map_err(|e| field_error(resource, format!("spec.firewall[{}]", i), e))?;
        }

        Ok(())
    }

    /// The instance expressed as a one-server pool named `name`
    pub fn as_pool(&self, name: &str) -> WorkloadPoolSpec {
        WorkloadPoolSpec {
            name: name.to_string(),
            replicas: 1,
            flavor_id: self.flavor_id.clone(),
            image: self.image.clone(),
            disk_size_gib: self.disk_size_gib,
            firewall: self.firewall.clone(),
            public_ip: self.public_ip,
            allowed_address_pairs: self.allowed_address_pairs.clone(),
            user_data: self.user_data.clone(),
        }
    }
}

/// Status for a ComputeInstance
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComputeInstanceStatus {
    /// The generation of the spec that was last processed by the controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Current lifecycle phase
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Human-readable message about current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Conditions representing the instance state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Health of the server
    #[serde(default)]
    pub health: HealthStatus,

    /// The server, once it exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine: Option<MachineStatus>,

    /// SSH key for the server, copied from the region identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_private_key: Option<String>,
}
