//! In-memory binding of the object store
//!
//! Mirrors the API server semantics the engine depends on: monotonically
//! increasing resource versions, conditional replace, separate status
//! writes, generation bumps on spec change, and finalizer-held deletion.

use std::collections::BTreeMap;
use std::marker::PhantomData;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use parking_lot::Mutex;
use serde_json::Value;

use super::{ObjectKey, ObjectStore, StoredObject};
use crate::{Error, Result};

struct State {
    objects: BTreeMap<ObjectKey, Value>,
    version: u64,
}

impl State {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

/// Object store held in process memory
///
/// Objects are kept in their serialized form so that spec and status can be
/// swapped independently regardless of the concrete type.
pub struct MemoryStore<K> {
    state: Mutex<State>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Default for MemoryStore<K> {
    fn default() -> Self {
        Self {
            state: Mutex::new(State {
                objects: BTreeMap::new(),
                version: 0,
            }),
            _kind: PhantomData,
        }
    }
}

impl<K: StoredObject> MemoryStore<K> {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn key_of(obj: &K) -> Result<ObjectKey> {
        let namespace = obj.namespace().ok_or_else(|| {
            Error::validation_for_field(obj.name_any(), "metadata.namespace", "namespace is required")
        })?;
        Ok(ObjectKey::new(namespace, obj.name_any()))
    }

    fn decode(value: &Value) -> Result<K> {
        serde_json::from_value(value.clone())
            .map_err(|e| Error::serialization_for_kind(K::kind(&()).to_string(), e.to_string()))
    }

    fn check_version(key: &ObjectKey, incoming: &K, stored: &K) -> Result<()> {
        match incoming.resource_version() {
            Some(v) if Some(&v) != stored.resource_version().as_ref() => Err(Error::conflict(
                key.to_string(),
                format!(
                    "resource version {} is stale (current {})",
                    v,
                    stored.resource_version().unwrap_or_default()
                ),
            )),
            _ => Ok(()),
        }
    }
}

fn field(value: &Value, name: &str) -> Value {
    value.get(name).cloned().unwrap_or(Value::Null)
}

fn set_field(value: &mut Value, name: &str, field: Value) {
    if let Some(map) = value.as_object_mut() {
        if field.is_null() {
            map.remove(name);
        } else {
            map.insert(name.to_string(), field);
        }
    }
}

#[async_trait]
impl<K: StoredObject> ObjectStore<K> for MemoryStore<K> {
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>> {
        let state = self.state.lock();
        state.objects.get(key).map(Self::decode).transpose()
    }

    async fn list(&self, namespace: &str) -> Result<Vec<K>> {
        let state = self.state.lock();
        state
            .objects
            .iter()
            .filter(|(k, _)| k.namespace == namespace)
            .map(|(_, v)| Self::decode(v))
            .collect()
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let key = Self::key_of(obj)?;
        let mut state = self.state.lock();
        if state.objects.contains_key(&key) {
            return Err(Error::conflict(key.to_string(), "already exists"));
        }

        let mut created = obj.clone();
        let version = state.next_version();
        let meta = created.meta_mut();
        meta.resource_version = Some(version);
        meta.uid = Some(uuid::Uuid::new_v4().to_string());
        meta.generation = Some(1);
        meta.creation_timestamp = Some(Time(Utc::now()));
        meta.deletion_timestamp = None;

        state.objects.insert(key, serde_json::to_value(&created)?);
        Ok(created)
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        let key = Self::key_of(obj)?;
        let mut state = self.state.lock();
        let stored_value = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::not_found(K::kind(&()).to_string(), key.to_string()))?;
        let stored = Self::decode(&stored_value)?;
        Self::check_version(&key, obj, &stored)?;

        let mut incoming = obj.clone();
        let spec_changed = field(&serde_json::to_value(obj)?, "spec") != field(&stored_value, "spec");
        let version = state.next_version();
        {
            let meta = incoming.meta_mut();
            let stored_meta = stored.meta();
            meta.resource_version = Some(version);
            meta.uid = stored_meta.uid.clone();
            meta.creation_timestamp = stored_meta.creation_timestamp.clone();
            meta.deletion_timestamp = stored_meta.deletion_timestamp.clone();
            let generation = stored_meta.generation.unwrap_or(1);
            meta.generation = Some(if spec_changed { generation + 1 } else { generation });
        }

        let mut value = serde_json::to_value(&incoming)?;
        set_field(&mut value, "status", field(&stored_value, "status"));
        let replaced = Self::decode(&value)?;

        if replaced.meta().deletion_timestamp.is_some() && replaced.finalizers().is_empty() {
            state.objects.remove(&key);
        } else {
            state.objects.insert(key, value);
        }
        Ok(replaced)
    }

    async fn replace_status(&self, obj: &K) -> Result<K> {
        let key = Self::key_of(obj)?;
        let mut state = self.state.lock();
        let mut stored_value = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::not_found(K::kind(&()).to_string(), key.to_string()))?;
        let stored = Self::decode(&stored_value)?;
        Self::check_version(&key, obj, &stored)?;

        let version = state.next_version();
        set_field(
            &mut stored_value,
            "status",
            field(&serde_json::to_value(obj)?, "status"),
        );
        let mut updated = Self::decode(&stored_value)?;
        updated.meta_mut().resource_version = Some(version);

        state.objects.insert(key, serde_json::to_value(&updated)?);
        Ok(updated)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        let mut state = self.state.lock();
        let Some(stored_value) = state.objects.get(key).cloned() else {
            return Ok(());
        };
        let mut stored = Self::decode(&stored_value)?;

        if stored.finalizers().is_empty() {
            state.objects.remove(key);
            return Ok(());
        }

        if stored.meta().deletion_timestamp.is_none() {
            let version = state.next_version();
            let meta = stored.meta_mut();
            meta.deletion_timestamp = Some(Time(Utc::now()));
            meta.resource_version = Some(version);
            state.objects.insert(key.clone(), serde_json::to_value(&stored)?);
        }
        Ok(())
    }
}
