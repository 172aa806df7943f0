//! Authenticated JSON transport with the backends' status-code contract
//!
//! | Call   | Success        | Absent            | Otherwise       |
//! |--------|----------------|-------------------|-----------------|
//! | get    | 200            | 404 → `None`      | `BackendStatus` |
//! | list   | 200            |                   | `BackendStatus` |
//! | create | 201            |                   | `BackendStatus` |
//! | update | 200, 202       |                   | `BackendStatus` |
//! | delete | 202 → Accepted | 404 → NotFound    | `BackendStatus` |
//!
//! Every request races the pass's cancellation token.

use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use cirrus_common::{Error, Result};

use crate::scope::DeleteOutcome;

/// A JSON REST client bound to one base URL, bearer token, and cancellation token
#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    cancel: CancellationToken,
}

impl RestClient {
    /// Create a client; `base_url` may carry a trailing slash
    pub fn new(
        http: reqwest::Client,
        base_url: &str,
        token: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
            cancel,
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
    }

    async fn execute(&self, operation: &str, request: RequestBuilder) -> Result<Response> {
        let sent = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::cancelled(operation)),
            response = request.send() => response,
        };
        let response = sent.map_err(|e| Error::transport(operation, e.to_string()))?;

        debug!(
            operation = %operation,
            status = response.status().as_u16(),
            "backend response"
        );
        Ok(response)
    }

    async fn decode<T: DeserializeOwned>(&self, operation: &str, response: Response) -> Result<T> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::cancelled(operation)),
            body = response.json::<T>() => {
                body.map_err(|e| Error::transport(operation, format!("invalid response body: {}", e)))
            }
        }
    }

    /// Like [`Self::decode`] but an empty body yields `None`
    async fn decode_optional<T: DeserializeOwned>(
        &self,
        operation: &str,
        response: Response,
    ) -> Result<Option<T>> {
        let body = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::cancelled(operation)),
            body = response.bytes() => body
                .map_err(|e| Error::transport(operation, format!("failed to read body: {}", e)))?,
        };
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| Error::transport(operation, format!("invalid response body: {}", e)))
    }

    /// GET a single resource; 404 yields `None`
    pub async fn get<T: DeserializeOwned>(&self, operation: &str, path: &str) -> Result<Option<T>> {
        let response = self
            .execute(operation, self.request(Method::GET, path))
            .await?;
        match response.status() {
            StatusCode::OK => Ok(Some(self.decode(operation, response).await?)),
            StatusCode::NOT_FOUND => Ok(None),
            code => Err(Error::backend_status(operation, code.as_u16())),
        }
    }

    /// GET a collection with optional query parameters
    pub async fn list<T: DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>> {
        let response = self
            .execute(operation, self.request(Method::GET, path).query(query))
            .await?;
        match response.status() {
            StatusCode::OK => self.decode(operation, response).await,
            code => Err(Error::backend_status(operation, code.as_u16())),
        }
    }

    /// POST a new resource; only 201 is success
    pub async fn create<B, T>(&self, operation: &str, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .execute(operation, self.request(Method::POST, path).json(body))
            .await?;
        match response.status() {
            StatusCode::CREATED => self.decode(operation, response).await,
            code => Err(Error::backend_status(operation, code.as_u16())),
        }
    }

    /// PUT a resource; 200 and 202 are success
    ///
    /// A 202 may carry no body, in which case the result is `None`.
    pub async fn update<B, T>(&self, operation: &str, path: &str, body: &B) -> Result<Option<T>>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .execute(operation, self.request(Method::PUT, path).json(body))
            .await?;
        match response.status() {
            StatusCode::OK => Ok(Some(self.decode(operation, response).await?)),
            StatusCode::ACCEPTED => self.decode_optional(operation, response).await,
            code => Err(Error::backend_status(operation, code.as_u16())),
        }
    }

    /// DELETE a resource
    pub async fn delete(&self, operation: &str, path: &str) -> Result<DeleteOutcome> {
        let response = self
            .execute(operation, self.request(Method::DELETE, path))
            .await?;
        match response.status() {
            StatusCode::ACCEPTED => Ok(DeleteOutcome::Accepted),
            StatusCode::NOT_FOUND => Ok(DeleteOutcome::NotFound),
            code => Err(Error::backend_status(operation, code.as_u16())),
        }
    }
}
