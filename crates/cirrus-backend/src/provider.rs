//! Per-pass acquisition of backend clients
//!
//! Clients are bound to the pass's cancellation token, so each reconcile
//! acquires a fresh pair. The bearer token is re-read from disk on every
//! acquisition when configured as a file, picking up rotated credentials.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use cirrus_common::{Error, Result};

use crate::identity::{HttpIdentityClient, IdentityApi};
use crate::region::{HttpRegionClient, RegionApi};

/// Clients for both backends, valid for one pass
#[derive(Clone)]
pub struct Backends {
    /// Region service
    pub region: Arc<dyn RegionApi>,
    /// Identity service
    pub identity: Arc<dyn IdentityApi>,
}

/// Source of backend clients
#[async_trait]
pub trait BackendProvider: Send + Sync {
    /// Clients whose requests abort when `cancel` fires
    async fn acquire(&self, cancel: CancellationToken) -> Result<Backends>;
}

/// Where the bearer token comes from
#[derive(Clone, Debug)]
pub enum TokenSource {
    /// A literal token
    Static(String),
    /// A file holding the token, re-read on each acquisition
    File(PathBuf),
}

impl TokenSource {
    async fn resolve(&self) -> Result<String> {
        match self {
            Self::Static(token) => Ok(token.clone()),
            Self::File(path) => {
                let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
                    Error::internal_with_context(
                        "token",
                        format!("failed to read {}: {}", path.display(), e),
                    )
                })?;
                Ok(raw.trim().to_string())
            }
        }
    }
}

/// Connection settings for both backends
#[derive(Clone, Debug)]
pub struct BackendConfig {
    /// Region service base URL
    pub region_url: String,
    /// Identity service base URL
    pub identity_url: String,
    /// Bearer token
    pub token: TokenSource,
    /// Per-request timeout
    pub request_timeout: Duration,
}

/// [`BackendProvider`] handing out HTTP clients
pub struct HttpBackendProvider {
    http: reqwest::Client,
    config: BackendConfig,
}

impl HttpBackendProvider {
    /// Build the shared connection pool
    pub fn new(config: BackendConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::internal_with_context("http", e.to_string()))?;
        Ok(Self { http, config })
    }
}

#[async_trait]
impl BackendProvider for HttpBackendProvider {
    async fn acquire(&self, cancel: CancellationToken) -> Result<Backends> {
        let token = self.config.token.resolve().await?;
        Ok(Backends {
            region: Arc::new(HttpRegionClient::new(
                self.http.clone(),
                &self.config.region_url,
                token.clone(),
                cancel.clone(),
            )),
            identity: Arc::new(HttpIdentityClient::new(
                self.http.clone(),
                &self.config.identity_url,
                token,
                cancel,
            )),
        })
    }
}
