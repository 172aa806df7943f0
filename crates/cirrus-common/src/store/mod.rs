//! Versioned object storage
//!
//! The engine persists clusters and instances through [`ObjectStore`]. Every
//! replace is conditional on `metadata.resourceVersion`; a stale version fails
//! with [`Error::Conflict`]. [`modify`] and [`modify_status`] wrap the
//! read-mutate-write cycle and re-run it when a conflict is reported.
//!
//! Two bindings exist: [`KubeStore`] against the Kubernetes API and
//! [`MemoryStore`] for tests and local runs.

mod kubernetes;
mod memory;

use std::fmt;
use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use self::kubernetes::KubeStore;
pub use self::memory::MemoryStore;
use crate::retry::{retry_on_conflict, RetryConfig};
use crate::{Error, Result};

/// Bounds every persisted object type satisfies
pub trait StoredObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<T> StoredObject for T where
    T: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Namespaced name of a stored object
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    /// Namespace
    pub namespace: String,
    /// Name
    pub name: String,
}

impl ObjectKey {
    /// Create a key
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of an existing object
    pub fn of<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace().unwrap_or_default(),
            name: obj.name_any(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Versioned storage with optimistic concurrency
#[async_trait]
pub trait ObjectStore<K: StoredObject>: Send + Sync {
    /// Fetch an object; `None` when absent
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>>;

    /// List all objects in a namespace
    async fn list(&self, namespace: &str) -> Result<Vec<K>>;

    /// Create an object; an existing name is a conflict
    async fn create(&self, obj: &K) -> Result<K>;

    /// Replace spec and metadata, conditional on the object's version
    async fn replace(&self, obj: &K) -> Result<K>;

    /// Replace the status subresource, conditional on the object's version
    async fn replace_status(&self, obj: &K) -> Result<K>;

    /// Request deletion; finalizers hold the object until they are removed
    async fn delete(&self, key: &ObjectKey) -> Result<()>;
}

fn missing<K: StoredObject>(key: &ObjectKey) -> Error {
    Error::not_found(K::kind(&()).to_string(), key.to_string())
}

/// Re-read `key`, apply `mutate`, and write back, retrying on conflict
///
/// `mutate` runs once per attempt against the freshest copy, so it must be
/// safe to apply repeatedly.
pub async fn modify<K, S, F>(store: &S, key: &ObjectKey, mutate: F) -> Result<K>
where
    K: StoredObject,
    S: ObjectStore<K> + ?Sized,
    F: Fn(&mut K) -> Result<()> + Send + Sync,
{
    let mutate = &mutate;
    retry_on_conflict(&RetryConfig::default(), "modify", || async move {
        let mut obj = store.get(key).await?.ok_or_else(|| missing::<K>(key))?;
        mutate(&mut obj)?;
        store.replace(&obj).await
    })
    .await
}

/// Like [`modify`] but writes through the status subresource
pub async fn modify_status<K, S, F>(store: &S, key: &ObjectKey, mutate: F) -> Result<K>
where
    K: StoredObject,
    S: ObjectStore<K> + ?Sized,
    F: Fn(&mut K) + Send + Sync,
{
    let mutate = &mutate;
    retry_on_conflict(&RetryConfig::default(), "modify_status", || async move {
        let mut obj = store.get(key).await?.ok_or_else(|| missing::<K>(key))?;
        mutate(&mut obj);
        store.replace_status(&obj).await
    })
    .await
}
