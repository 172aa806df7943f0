//! Identity service: quota allocations

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use cirrus_common::Result;

use crate::http::RestClient;
use crate::scope::{DeleteOutcome, ProjectScope};

/// Quota kind counting clusters
pub const KIND_CLUSTERS: &str = "clusters";
/// Quota kind counting servers
pub const KIND_SERVERS: &str = "servers";
/// Quota kind counting GPUs
pub const KIND_GPUS: &str = "gpus";

/// Usage of one quota kind
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceAllocation {
    /// Quota kind (`clusters`, `servers`, `gpus`)
    pub kind: String,
    /// Amount in use
    pub committed: u32,
    /// Amount held for pending use
    pub reserved: u32,
}

/// Request body for allocation creation and update
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AllocationWrite {
    /// Kind of the object holding the allocation
    pub kind: String,
    /// ID of the object holding the allocation
    pub id: String,
    /// Per-kind usage
    pub allocations: Vec<ResourceAllocation>,
}

impl AllocationWrite {
    /// Committed amount for a quota kind, zero when absent
    pub fn committed(&self, kind: &str) -> u32 {
        self.allocations
            .iter()
            .find(|a| a.kind == kind)
            .map(|a| a.committed)
            .unwrap_or(0)
    }
}

/// A quota allocation held in the identity service
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    /// Allocation ID
    pub id: String,
    /// Allocation contents
    #[serde(flatten)]
    pub spec: AllocationWrite,
}

/// Operations on the identity service
#[cfg_attr(feature = "mock", mockall::automock)]
#[async_trait]
pub trait IdentityApi: Send + Sync {
    /// Create an allocation (201)
    async fn create_allocation(
        &self,
        scope: &ProjectScope,
        request: &AllocationWrite,
    ) -> Result<Allocation>;

    /// Replace an allocation (200/202)
    async fn update_allocation(
        &self,
        scope: &ProjectScope,
        id: &str,
        request: &AllocationWrite,
    ) -> Result<Allocation>;

    /// Delete an allocation
    async fn delete_allocation(&self, scope: &ProjectScope, id: &str) -> Result<DeleteOutcome>;
}

/// HTTP implementation of [`IdentityApi`]
#[derive(Clone)]
pub struct HttpIdentityClient {
    rest: RestClient,
}

impl HttpIdentityClient {
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
}

#[async_trait]
impl IdentityApi for HttpIdentityClient {
    async fn create_allocation(
        &self,
        scope: &ProjectScope,
        request: &AllocationWrite,
    ) -> Result<Allocation> {
        let path = format!("{}/allocations", scope.path());
        self.rest.create("create allocation", &path, request).await
    }

    async fn update_allocation(
        &self,
        scope: &ProjectScope,
        id: &str,
        request: &AllocationWrite,
    ) -> Result<Allocation> {
        let path = format!("{}/allocations/{}", scope.path(), id);
        let updated = self.rest.update("update allocation", &path, request).await?;
        // An accepted update without a body holds what was sent
        Ok(updated.unwrap_or_else(|| Allocation {
            id: id.to_string(),
            spec: request.clone(),
        }))
    }

    async fn delete_allocation(&self, scope: &ProjectScope, id: &str) -> Result<DeleteOutcome> {
        let path = format!("{}/allocations/{}", scope.path(), id);
        self.rest.delete("delete allocation", &path).await
    }
}
