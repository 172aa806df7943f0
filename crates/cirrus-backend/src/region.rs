//! Region service: identities, networks, security groups, servers, catalogue

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use cirrus_common::crd::{
    AllowedAddressPair, FirewallDirection, FirewallProtocol, HealthStatus, ProvisioningStatus,
};
use cirrus_common::{Error, Result};

use crate::http::RestClient;
use crate::scope::{DeleteOutcome, IdentityScope, ProjectScope};
use crate::tags::{Owner, Tag};

/// Metadata common to all region resources
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetadata {
    /// Backend ID
    pub id: String,
    /// Resource name
    pub name: String,
    /// Name/value tags
    #[serde(default)]
    pub tags: Vec<Tag>,
    /// Raw provisioning status string
    #[serde(default)]
    pub provisioning_status: String,
    /// Raw health status string
    #[serde(default)]
    pub health_status: String,
    /// When the backend created the resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<DateTime<Utc>>,
}

impl ResourceMetadata {
    /// Parsed provisioning status; the raw string on failure
    pub fn provisioning(&self) -> std::result::Result<ProvisioningStatus, String> {
        self.provisioning_status
            .parse()
            .map_err(|_| self.provisioning_status.clone())
    }

    /// Parsed health; unrecognized values read as unknown
    pub fn health(&self) -> HealthStatus {
        HealthStatus::from_backend(&self.health_status)
    }

    /// Whether the backend is already tearing the resource down
    pub fn is_deprovisioning(&self) -> bool {
        matches!(self.provisioning(), Ok(ProvisioningStatus::Deprovisioning))
    }
}

/// Request body for identity creation
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IdentityWrite {
    /// Identity name
    pub name: String,
    /// Ownership tags
    pub tags: Vec<Tag>,
    /// Region the identity is created in
    pub region_id: String,
}

/// A region identity: the tenancy boundary owning networks, groups, and servers
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Resource metadata
    pub metadata: ResourceMetadata,
    /// Region the identity lives in
    pub region_id: String,
    /// SSH key injected into servers created under the identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_private_key: Option<String>,
}

/// Request body for network creation
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkWrite {
    /// Network name
    pub name: String,
    /// Ownership tags
    pub tags: Vec<Tag>,
    /// IPv4 prefix; the backend picks one when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    /// DNS servers handed out by DHCP
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_nameservers: Vec<String>,
}

/// A network within an identity
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    /// Resource metadata
    pub metadata: ResourceMetadata,
    /// Allocated prefix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

/// Port matcher of a security group rule
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "camelCase")]
pub enum PortSpec {
    /// A single port
    Number(u16),
    /// An inclusive port range
    Range {
        /// First port
        start: u16,
        /// Last port
        end: u16,
    },
}

/// One security group rule: a single prefix with a port matcher
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "camelCase")]
pub struct SecurityGroupRule {
    /// Traffic direction
    pub direction: FirewallDirection,
    /// Protocol
    pub protocol: FirewallProtocol,
    /// Ports
    pub port: PortSpec,
    /// CIDR prefix
    pub prefix: String,
}

/// Request body for security group creation and update
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityGroupWrite {
    /// Group name
    pub name: String,
    /// Ownership tags
    pub tags: Vec<Tag>,
    /// Rules
    pub rules: Vec<SecurityGroupRule>,
}

/// A security group within an identity
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityGroup {
    /// Resource metadata
    pub metadata: ResourceMetadata,
    /// Rules
    #[serde(default)]
    pub rules: Vec<SecurityGroupRule>,
}

/// A network attachment of a server
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerNetwork {
    /// Network ID
    pub id: String,
    /// Extra addresses the port may use
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_address_pairs: Vec<AllowedAddressPair>,
}

/// Desired configuration of a server
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerSpec {
    /// Flavor ID
    pub flavor_id: String,
    /// Image ID
    pub image_id: String,
    /// Network attachments
    #[serde(default)]
    pub networks: Vec<ServerNetwork>,
    /// Allocate a public IP
    #[serde(default)]
    pub public_ip: bool,
    /// Security group IDs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_groups: Vec<String>,
    /// Base64 cloud-init payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
    /// Root disk size
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_size_gib: Option<u32>,
}

/// Observed addressing of a server
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    /// Address on the attached network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_ip: Option<String>,
    /// Public address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
}

/// Request body for server creation and update
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerWrite {
    /// Server name
    pub name: String,
    /// Ownership tags
    pub tags: Vec<Tag>,
    /// Configuration
    pub spec: ServerSpec,
}

/// A server within an identity
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    /// Resource metadata
    pub metadata: ResourceMetadata,
    /// Configuration
    pub spec: ServerSpec,
    /// Addressing
    #[serde(default)]
    pub status: ServerStatus,
}

/// GPU attached to a flavor
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FlavorGpu {
    /// GPU vendor
    pub vendor: String,
    /// GPU model
    pub model: String,
    /// Physical GPUs per server
    pub count: u32,
}

/// A server size offered by the region
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Flavor {
    /// Flavor ID
    pub id: String,
    /// Flavor name
    pub name: String,
    /// Virtual CPUs
    pub cpus: u32,
    /// Memory in GiB
    pub memory_gib: u32,
    /// GPU, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<FlavorGpu>,
}

impl Flavor {
    /// GPUs per server, zero when the flavor has none
    pub fn gpu_count(&self) -> u32 {
        self.gpu.as_ref().map(|g| g.count).unwrap_or(0)
    }
}

/// Operating system of an image
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImageOs {
    /// Distribution (e.g. "ubuntu")
    pub distro: String,
    /// Distribution version (e.g. "24.04")
    pub version: String,
}

/// A bootable image offered by the region
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    /// Image ID
    pub id: String,
    /// Image name
    pub name: String,
    /// Upload time
    pub created: DateTime<Utc>,
    /// Operating system
    pub os: ImageOs,
}

/// Operations on the region service
#[cfg_attr(feature = "mock", mockall::automock)]
#[async_trait]
pub trait RegionApi: Send + Sync {
    /// Create an identity (201)
    async fn create_identity(&self, scope: &ProjectScope, request: &IdentityWrite)
        -> Result<Identity>;

    /// Read an identity; `None` on 404
    async fn get_identity(&self, scope: &ProjectScope, id: &str) -> Result<Option<Identity>>;

    /// Delete an identity and everything it owns
    async fn delete_identity(&self, scope: &ProjectScope, id: &str) -> Result<DeleteOutcome>;

    /// Create a network (201)
    async fn create_network(&self, scope: &IdentityScope, request: &NetworkWrite)
        -> Result<Network>;

    /// Read a network; `None` on 404
    async fn get_network(&self, scope: &IdentityScope, id: &str) -> Result<Option<Network>>;

    /// Security groups tagged as owned by `owner`
    async fn list_security_groups(
        &self,
        scope: &IdentityScope,
        owner: &Owner,
    ) -> Result<Vec<SecurityGroup>>;

    /// Create a security group (201)
    async fn create_security_group(
        &self,
        scope: &IdentityScope,
        request: &SecurityGroupWrite,
    ) -> Result<SecurityGroup>;

    /// Replace a security group's rules (200/202)
    async fn update_security_group(
        &self,
        scope: &IdentityScope,
        id: &str,
        request: &SecurityGroupWrite,
    ) -> Result<SecurityGroup>;

    /// Delete a security group
    async fn delete_security_group(&self, scope: &IdentityScope, id: &str)
        -> Result<DeleteOutcome>;

    /// Servers tagged as owned by `owner`
    async fn list_servers(&self, scope: &IdentityScope, owner: &Owner) -> Result<Vec<Server>>;

    /// Create a server (201)
    async fn create_server(&self, scope: &IdentityScope, request: &ServerWrite) -> Result<Server>;

    /// Update a server in place (200/202)
    async fn update_server(
        &self,
        scope: &IdentityScope,
        id: &str,
        request: &ServerWrite,
    ) -> Result<Server>;

    /// Delete a server
    async fn delete_server(&self, scope: &IdentityScope, id: &str) -> Result<DeleteOutcome>;

    /// Flavors offered in a region
    async fn list_flavors(&self, organization_id: &str, region_id: &str) -> Result<Vec<Flavor>>;

    /// Images offered in a region
    async fn list_images(&self, organization_id: &str, region_id: &str) -> Result<Vec<Image>>;
}

/// HTTP implementation of [`RegionApi`]
#[derive(Clone)]
pub struct HttpRegionClient {
    rest: RestClient,
}

impl HttpRegionClient {
    /// Create a client against `base_url`
    pub fn new(
        http: reqwest::Client,
        base_url: &str,
        token: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            rest: RestClient::new(http, base_url, token, cancel),
        }
    }

    /// Fetch a resource whose accepted update came back without a body
    async fn reread<T: DeserializeOwned>(&self, operation: &str, path: &str) -> Result<T> {
        self.rest
            .get(operation, path)
            .await?
            .ok_or_else(|| Error::backend_status(operation, 404))
    }

    fn catalogue_path(organization_id: &str, region_id: &str, kind: &str) -> String {
        format!(
            "/api/v1/organizations/{}/regions/{}/{}",
            organization_id, region_id, kind
        )
    }
}

fn tag_query(owner: &Owner) -> [(&'static str, String); 1] {
    [("tag", owner.tag().selector())]
}

#[async_trait]
impl RegionApi for HttpRegionClient {
    async fn create_identity(
        &self,
        scope: &ProjectScope,
        request: &IdentityWrite,
    ) -> Result<Identity> {
        let path = format!("{}/identities", scope.path());
        self.rest.create("create identity", &path, request).await
    }

    async fn get_identity(&self, scope: &ProjectScope, id: &str) -> Result<Option<Identity>> {
        let path = format!("{}/identities/{}", scope.path(), id);
        self.rest.get("get identity", &path).await
    }

    async fn delete_identity(&self, scope: &ProjectScope, id: &str) -> Result<DeleteOutcome> {
        let path = format!("{}/identities/{}", scope.path(), id);
        self.rest.delete("delete identity", &path).await
    }

    async fn create_network(
        &self,
        scope: &IdentityScope,
        request: &NetworkWrite,
    ) -> Result<Network> {
        let path = format!("{}/networks", scope.path());
        self.rest.create("create network", &path, request).await
    }

    async fn get_network(&self, scope: &IdentityScope, id: &str) -> Result<Option<Network>> {
        let path = format!("{}/networks/{}", scope.path(), id);
        self.rest.get("get network", &path).await
    }

    async fn list_security_groups(
        &self,
        scope: &IdentityScope,
        owner: &Owner,
    ) -> Result<Vec<SecurityGroup>> {
        let path = format!("{}/securitygroups", scope.path());
        self.rest
            .list("list security groups", &path, &tag_query(owner))
            .await
    }

    async fn create_security_group(
        &self,
        scope: &IdentityScope,
        request: &SecurityGroupWrite,
    ) -> Result<SecurityGroup> {
        let path = format!("{}/securitygroups", scope.path());
        self.rest
            .create("create security group", &path, request)
            .await
    }

    async fn update_security_group(
        &self,
        scope: &IdentityScope,
        id: &str,
        request: &SecurityGroupWrite,
    ) -> Result<SecurityGroup> {
        let path = format!("{}/securitygroups/{}", scope.path(), id);
        match self
            .rest
            .update("update security group", &path, request)
            .await?
        {
            Some(group) => Ok(group),
            None => self.reread("update security group", &path).await,
        }
    }

    async fn delete_security_group(
        &self,
        scope: &IdentityScope,
        id: &str,
    ) -> Result<DeleteOutcome> {
        let path = format!("{}/securitygroups/{}", scope.path(), id);
        self.rest.delete("delete security group", &path).await
    }

    async fn list_servers(&self, scope: &IdentityScope, owner: &Owner) -> Result<Vec<Server>> {
        let path = format!("{}/servers", scope.path());
        self.rest
            .list("list servers", &path, &tag_query(owner))
            .await
    }

    async fn create_server(&self, scope: &IdentityScope, request: &ServerWrite) -> Result<Server> {
        let path = format!("{}/servers", scope.path());
        self.rest.create("create server", &path, request).await
    }

    async fn update_server(
        &self,
        scope: &IdentityScope,
        id: &str,
        request: &ServerWrite,
    ) -> Result<Server> {
        let path = format!("{}/servers/{}", scope.path(), id);
        match self.rest.update("update server", &path, request).await? {
            Some(server) => Ok(server),
            None => self.reread("update server", &path).await,
        }
    }

    async fn delete_server(&self, scope: &IdentityScope, id: &str) -> Result<DeleteOutcome> {
        let path = format!("{}/servers/{}", scope.path(), id);
        self.rest.delete("delete server", &path).await
    }

    async fn list_flavors(&self, organization_id: &str, region_id: &str) -> Result<Vec<Flavor>> {
        let path = Self::catalogue_path(organization_id, region_id, "flavors");
        self.rest.list("list flavors", &path, &[]).await
    }

    async fn list_images(&self, organization_id: &str, region_id: &str) -> Result<Vec<Image>> {
        let path = Self::catalogue_path(organization_id, region_id, "images");
        self.rest.list("list images", &path, &[]).await
    }
}
