//! Shared types used across the compute CRDs

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Provisioning state of a backend resource
///
/// Mirrors the region service's vocabulary. Parsing is strict so that callers
/// can tell an unrecognized status apart from a known one.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProvisioningStatus {
    /// Backend has not reported a state yet
    #[default]
    Unknown,
    /// Resource is being created or updated
    Provisioning,
    /// Resource is ready
    Provisioned,
    /// Resource is being deleted
    Deprovisioning,
    /// Backend gave up on the resource
    Error,
}

impl ProvisioningStatus {
    /// Whether the resource has not reached a terminal state yet
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Unknown | Self::Provisioning)
    }
}

impl FromStr for ProvisioningStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "unknown" => Ok(Self::Unknown),
            "provisioning" => Ok(Self::Provisioning),
            "provisioned" => Ok(Self::Provisioned),
            "deprovisioning" => Ok(Self::Deprovisioning),
            "error" => Ok(Self::Error),
            other => Err(format!("unrecognized provisioning status: {}", other)),
        }
    }
}

impl fmt::Display for ProvisioningStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Provisioning => write!(f, "provisioning"),
            Self::Provisioned => write!(f, "provisioned"),
            Self::Deprovisioning => write!(f, "deprovisioning"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Health of a machine or of an aggregate
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// No health information
    #[default]
    Unknown,
    /// Everything is working
    Healthy,
    /// Partially working
    Degraded,
    /// Not working
    Error,
}

impl HealthStatus {
    /// Parse a backend health string, mapping anything unknown to `Unknown`
    pub fn from_backend(s: &str) -> Self {
        match s {
            "healthy" => Self::Healthy,
            "degraded" => Self::Degraded,
            "error" => Self::Error,
            _ => Self::Unknown,
        }
    }

    fn severity(&self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Unknown => 1,
            Self::Degraded => 2,
            Self::Error => 3,
        }
    }

    /// The worse of two health values
    pub fn worst(self, other: Self) -> Self {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

/// Lifecycle phase of a cluster or instance
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ClusterPhase {
    /// No identity has been requested yet
    #[default]
    Pending,
    /// Waiting on identity/network provisioning
    ResolvingDependencies,
    /// Servers or security groups are converging
    Reconciling,
    /// Last pass found nothing to do
    Stable,
    /// Machines are being evicted; ordinary reconciliation is paused
    Evicting,
    /// Resources are being released
    Deleting,
    /// Last pass failed
    Failed,
}

impl fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::ResolvingDependencies => write!(f, "ResolvingDependencies"),
            Self::Reconciling => write!(f, "Reconciling"),
            Self::Stable => write!(f, "Stable"),
            Self::Evicting => write!(f, "Evicting"),
            Self::Deleting => write!(f, "Deleting"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Available)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// Out-of-band coordination state persisted alongside the spec
///
/// These fields change together with replica counts during eviction, so they
/// live in the spec where a single conditional write covers both.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ControlState {
    /// Region identity the resource's infrastructure lives in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_id: Option<String>,

    /// Region network servers attach to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<String>,

    /// Quota allocation held in the identity service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation_id: Option<String>,

    /// Server IDs an in-flight eviction is deleting
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub eviction_hint: Vec<String>,

    /// Halts ordinary server reconciliation while set
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub paused: bool,
}

impl ControlState {
    /// Whether an eviction currently owns the resource
    pub fn eviction_in_flight(&self) -> bool {
        self.paused || !self.eviction_hint.is_empty()
    }
}

/// Traffic direction a firewall rule applies to
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "lowercase")]
pub enum FirewallDirection {
    /// Inbound traffic
    Ingress,
    /// Outbound traffic
    Egress,
}

/// IP protocol a firewall rule matches
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "lowercase")]
pub enum FirewallProtocol {
    /// TCP
    Tcp,
    /// UDP
    Udp,
    /// ICMP (ports ignored by the backend)
    Icmp,
    /// Any protocol
    Any,
}

/// A firewall rule on a workload pool
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FirewallRule {
    /// Traffic direction
    pub direction: FirewallDirection,

    /// Protocol to match
    pub protocol: FirewallProtocol,

    /// Port, or the start of a range when `port_max` is set
    pub port: u16,

    /// Inclusive end of a port range
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_max: Option<u16>,

    /// CIDR prefixes the rule admits
    pub prefixes: Vec<String>,
}

impl FirewallRule {
    /// Validate port ordering and prefix syntax
    pub fn validate(&self) -> Result<(), String> {
        if let Some(max) = self.port_max {
            if max < self.port {
                return Err(format!(
                    "port range end {} is below start {}",
                    max, self.port
                ));
            }
        }
        if self.prefixes.is_empty() {
            return Err("firewall rule must list at least one prefix".to_string());
        }
        for prefix in &self.prefixes {
            prefix
                .parse::<IpNetwork>()
                .map_err(|e| format!("invalid prefix {}: {}", prefix, e))?;
        }
        Ok(())
    }
}

/// An additional address a server's port may use
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct AllowedAddressPair {
    /// Permitted CIDR
    pub cidr: String,

    /// Permitted MAC address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
}

/// Image selection by attributes
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImageSelector {
    /// Operating system distribution (e.g. "ubuntu")
    pub distro: String,

    /// Distribution version (e.g. "24.04")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Image reference: an explicit ID or a selector, exactly one
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    /// Explicit image ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Attribute selector resolved against the region's images
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<ImageSelector>,
}

impl ImageSpec {
    /// Reference an image by ID
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            selector: None,
        }
    }

    /// Validate that exactly one of `id` and `selector` is set
    pub fn validate(&self) -> Result<(), String> {
        match (&self.id, &self.selector) {
            (Some(id), None) if !id.is_empty() => Ok(()),
            (None, Some(_)) => Ok(()),
            (Some(_), Some(_)) => Err("image id and selector are mutually exclusive".to_string()),
            _ => Err("image requires an id or a selector".to_string()),
        }
    }
}

/// Observed state of one machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// Server name
    pub hostname: String,

    /// Backend server ID
    pub id: String,

    /// Image the server was built from
    pub image_id: String,

    /// Flavor the server runs on
    pub flavor_id: String,

    /// Address on the cluster network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_ip: Option<String>,

    /// Public address, when allocated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,

    /// Backend provisioning state
    #[serde(default)]
    pub provisioning_status: ProvisioningStatus,

    /// Backend health
    #[serde(default)]
    pub health_status: HealthStatus,
}

/// Validate a DNS-style identifier (lowercase alphanumeric with hyphens)
///
/// Used for pool and resource names, which end up in server and security
/// group names on the backend.
pub fn validate_dns_identifier(s: &str) -> Result<(), String> {
    if s.is_empty() {
        return Err("identifier cannot be empty".to_string());
    }
    if s.len() > 63 {
        return Err(format!("identifier longer than 63 characters: {}", s));
    }

    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => {
            return Err(format!(
                "identifier must start with lowercase letter: {}",
                s
            ))
        }
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return Err(format!(
            "identifier must be lowercase alphanumeric with hyphens: {}",
            s
        ));
    }

    if s.ends_with('-') {
        return Err(format!("identifier cannot end with hyphen: {}", s));
    }

    Ok(())
}

/// Map a validation message onto a field-scoped error
pub(crate) fn field_error(resource: &str, field: String, message: String) -> Error {
    Error::validation_for_field(resource, field, message)
}
