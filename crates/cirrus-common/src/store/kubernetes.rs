//! Kubernetes binding of the object store
//!
//! Objects are custom resources. The API server enforces the version check
//! on replace and reports a stale `resourceVersion` as HTTP 409.

use std::marker::PhantomData;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::debug;

use super::{ObjectKey, ObjectStore, StoredObject};
use crate::{Error, Result, FIELD_MANAGER};

/// Object store backed by the Kubernetes API
pub struct KubeStore<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeStore<K> {
    /// Create a store using the given client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }
}

impl<K> Clone for KubeStore<K> {
    fn clone(&self) -> Self {
        Self::new(self.client.clone())
    }
}

impl<K: StoredObject> KubeStore<K> {
    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn post_params() -> PostParams {
        PostParams {
            dry_run: false,
            field_manager: Some(FIELD_MANAGER.to_string()),
        }
    }

    fn key_of(obj: &K) -> Result<ObjectKey> {
        let namespace = obj.namespace().ok_or_else(|| {
            Error::validation_for_field(obj.name_any(), "metadata.namespace", "namespace is required")
        })?;
        Ok(ObjectKey::new(namespace, obj.name_any()))
    }
}

/// Map API errors onto the store's error vocabulary
fn map_kube_error(key: &ObjectKey, kind: &str, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(ref resp) if resp.code == 409 => {
            Error::conflict(key.to_string(), resp.message.clone())
        }
        kube::Error::Api(ref resp) if resp.code == 404 => Error::not_found(kind, key.to_string()),
        other => Error::from(other),
    }
}

#[async_trait]
impl<K: StoredObject> ObjectStore<K> for KubeStore<K> {
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>> {
        self.api(&key.namespace)
            .get_opt(&key.name)
            .await
            .map_err(|e| map_kube_error(key, &K::kind(&()), e))
    }

    async fn list(&self, namespace: &str) -> Result<Vec<K>> {
        let list = self.api(namespace).list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let key = Self::key_of(obj)?;
        self.api(&key.namespace)
            .create(&Self::post_params(), obj)
            .await
            .map_err(|e| map_kube_error(&key, &K::kind(&()), e))
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        let key = Self::key_of(obj)?;
        self.api(&key.namespace)
            .replace(&key.name, &Self::post_params(), obj)
            .await
            .map_err(|e| map_kube_error(&key, &K::kind(&()), e))
    }

    async fn replace_status(&self, obj: &K) -> Result<K> {
        let key = Self::key_of(obj)?;
        let body = serde_json::to_vec(obj)?;
        self.api(&key.namespace)
            .replace_status(&key.name, &Self::post_params(), body)
            .await
            .map_err(|e| map_kube_error(&key, &K::kind(&()), e))
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        match self
            .api(&key.namespace)
            .delete(&key.name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(object = %key, "delete of absent object");
                Ok(())
            }
            Err(e) => Err(map_kube_error(key, &K::kind(&()), e)),
        }
    }
}
