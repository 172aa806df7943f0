//! Synchronous mutations of clusters and instances
//!
//! Creation reserves quota before the object exists: the allocation is
//! created first and deleted again if the object cannot be stored. Updates
//! resize the allocation first, then write the new spec with the
//! controller-owned state carried over; a failed write puts the allocation
//! back. Deletion only marks the object; the finalizer keeps it until the
//! reconciler has released everything.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use kube::Resource;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use cirrus_backend::{AllocationWrite, BackendProvider, Backends, IdentityApi, ProjectScope};
use cirrus_common::crd::{
    validate_dns_identifier, ComputeCluster, ComputeClusterSpec, ComputeInstance,
    ComputeInstanceSpec, ControlState, WorkloadPoolSpec,
};
use cirrus_common::store::{modify, ObjectKey, ObjectStore};
use cirrus_common::{Error, Result, RELEASE_FINALIZER};

use crate::allocation::{compute_allocation, sync_allocation};
use crate::eviction::evict_machines;
use crate::resource::ManagedResource;
use crate::saga::Saga;

/// Request to create a cluster
#[derive(Clone, Debug)]
pub struct CreateClusterRequest {
    /// Namespace to create the cluster in
    pub namespace: String,
    /// Cluster name
    pub name: String,
    /// Desired state; any control state is ignored
    pub spec: ComputeClusterSpec,
}

/// Request to create an instance
#[derive(Clone, Debug)]
pub struct CreateInstanceRequest {
    /// Namespace to create the instance in
    pub namespace: String,
    /// Instance name
    pub name: String,
    /// Desired state; any control state is ignored
    pub spec: ComputeInstanceSpec,
    /// Existing network to attach to instead of creating one
    pub network_id: Option<String>,
}

struct Creation<K: ManagedResource> {
    identity: Arc<dyn IdentityApi>,
    store: Arc<dyn ObjectStore<K>>,
    scope: ProjectScope,
    request: AllocationWrite,
    object: K,
    allocation_id: Option<String>,
    created: Option<K>,
}

fn create_allocation<K: ManagedResource>(ctx: &mut Creation<K>) -> BoxFuture<'_, Result<()>> {
    async move {
        let allocation = ctx
            .identity
            .create_allocation(&ctx.scope, &ctx.request)
            .await?;
        info!(allocation = %allocation.id, "allocation created");
        ctx.allocation_id = Some(allocation.id);
        Ok(())
    }
    .boxed()
}

fn delete_allocation<K: ManagedResource>(ctx: &mut Creation<K>) -> BoxFuture<'_, Result<()>> {
    async move {
        if let Some(id) = &ctx.allocation_id {
            warn!(allocation = %id, "releasing allocation of object that was not created");
            ctx.identity.delete_allocation(&ctx.scope, id).await?;
        }
        Ok(())
    }
    .boxed()
}

fn store_object<K: ManagedResource>(ctx: &mut Creation<K>) -> BoxFuture<'_, Result<()>> {
    async move {
        let mut object = ctx.object.clone();
        object.control_mut().allocation_id = ctx.allocation_id.clone();
        object
            .meta_mut()
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(RELEASE_FINALIZER.to_string());
        ctx.created = Some(ctx.store.create(&object).await?);
        Ok(())
    }
    .boxed()
}

struct Resize<K: ManagedResource, F> {
    backends: Backends,
    store: Arc<dyn ObjectStore<K>>,
    key: ObjectKey,
    current: K,
    pools: Vec<WorkloadPoolSpec>,
    apply: F,
    allocation_id: Option<String>,
    updated: Option<K>,
}

fn resize_allocation<K, F>(ctx: &mut Resize<K, F>) -> BoxFuture<'_, Result<()>>
where
    K: ManagedResource,
    F: Fn(&mut K) -> Result<()> + Send + Sync,
{
    async move {
        let id = sync_allocation(&ctx.backends, &ctx.current, &ctx.pools).await?;
        ctx.allocation_id = Some(id);
        Ok(())
    }
    .boxed()
}

fn restore_allocation<K, F>(ctx: &mut Resize<K, F>) -> BoxFuture<'_, Result<()>>
where
    K: ManagedResource,
    F: Fn(&mut K) -> Result<()> + Send + Sync,
{
    async move {
        let Some(id) = &ctx.allocation_id else {
            return Ok(());
        };
        warn!(allocation = %id, "spec not written, restoring allocation");
        if ctx.current.control().allocation_id.is_some() {
            sync_allocation(&ctx.backends, &ctx.current, &ctx.current.pools()).await?;
        } else {
            ctx.backends
                .identity
                .delete_allocation(&ctx.current.scope(), id)
                .await?;
        }
        Ok(())
    }
    .boxed()
}

fn write_spec<K, F>(ctx: &mut Resize<K, F>) -> BoxFuture<'_, Result<()>>
where
    K: ManagedResource,
    F: Fn(&mut K) -> Result<()> + Send + Sync,
{
    async move {
        let key = &ctx.key;
        let apply = &ctx.apply;
        let allocation_id = &ctx.allocation_id;
        let updated = modify(ctx.store.as_ref(), key, |obj: &mut K| {
            ensure_mutable(key, obj)?;
            let mut control = obj.control().clone();
            apply(obj)?;
            if allocation_id.is_some() {
                control.allocation_id = allocation_id.clone();
            }
            *obj.control_mut() = control;
            Ok(())
        })
        .await?;
        ctx.updated = Some(updated);
        Ok(())
    }
    .boxed()
}

fn ensure_mutable<K: ManagedResource>(key: &ObjectKey, obj: &K) -> Result<()> {
    if obj.is_deleting() {
        return Err(Error::conflict(key.to_string(), "object is being deleted"));
    }
    if obj.control().eviction_in_flight() {
        return Err(Error::conflict(key.to_string(), "an eviction is in progress"));
    }
    Ok(())
}

fn ensure_same_placement(
    key: &ObjectKey,
    current: [&str; 3],
    requested: [&str; 3],
) -> Result<()> {
    const FIELDS: [&str; 3] = ["spec.organizationId", "spec.projectId", "spec.regionId"];
    for ((field, have), want) in FIELDS.iter().zip(current).zip(requested) {
        if have != want {
            return Err(Error::validation_for_field(
                key.to_string(),
                *field,
                "field is immutable",
            ));
        }
    }
    Ok(())
}

/// Entry point for user-driven mutations
pub struct ComputeService {
    clusters: Arc<dyn ObjectStore<ComputeCluster>>,
    instances: Arc<dyn ObjectStore<ComputeInstance>>,
    backends: Arc<dyn BackendProvider>,
}

impl ComputeService {
    /// Create a service over the given stores and backends
    pub fn new(
        clusters: Arc<dyn ObjectStore<ComputeCluster>>,
        instances: Arc<dyn ObjectStore<ComputeInstance>>,
        backends: Arc<dyn BackendProvider>,
    ) -> Self {
        Self {
            clusters,
            instances,
            backends,
        }
    }

    async fn acquire(&self) -> Result<Backends> {
        self.backends.acquire(CancellationToken::new()).await
    }

    async fn create<K: ManagedResource>(
        &self,
        store: &Arc<dyn ObjectStore<K>>,
        object: K,
    ) -> Result<K> {
        let key = ObjectKey::of(&object);
        if store.get(&key).await?.is_some() {
            return Err(Error::conflict(key.to_string(), "already exists"));
        }

        let backends = self.acquire().await?;
        let request =
            compute_allocation(backends.region.as_ref(), &object, &object.pools()).await?;

        let saga = Saga::new("create")
            .compensated_step(
                "create allocation",
                create_allocation::<K>,
                delete_allocation::<K>,
            )
            .step("store object", store_object::<K>);
        let mut ctx = Creation {
            identity: backends.identity.clone(),
            store: store.clone(),
            scope: object.scope(),
            request,
            object,
            allocation_id: None,
            created: None,
        };
        saga.run(&mut ctx).await?;

        let created = ctx
            .created
            .ok_or_else(|| Error::internal_with_context("create", "saga finished without an object"))?;
        info!(object = %key, "created");
        Ok(created)
    }

    async fn update<K, F>(&self, store: &Arc<dyn ObjectStore<K>>, key: &ObjectKey, apply: F) -> Result<K>
    where
        K: ManagedResource,
        F: Fn(&mut K) -> Result<()> + Send + Sync,
    {
        let current = store
            .get(key)
            .await?
            .ok_or_else(|| Error::not_found(K::kind(&()).to_string(), key.to_string()))?;
        ensure_mutable(key, &current)?;
        let mut desired = current.clone();
        apply(&mut desired)?;

        let saga = Saga::new("update")
            .compensated_step(
                "resize allocation",
                resize_allocation::<K, F>,
                restore_allocation::<K, F>,
            )
            .step("write spec", write_spec::<K, F>);
        let mut ctx = Resize {
            backends: self.acquire().await?,
            store: store.clone(),
            key: key.clone(),
            pools: desired.pools(),
            current,
            apply,
            allocation_id: None,
            updated: None,
        };
        saga.run(&mut ctx).await?;

        ctx.updated
            .ok_or_else(|| Error::internal_with_context("update", "saga finished without an object"))
    }

    async fn delete<K: ManagedResource>(
        &self,
        store: &Arc<dyn ObjectStore<K>>,
        key: &ObjectKey,
    ) -> Result<()> {
        if store.get(key).await?.is_none() {
            return Err(Error::not_found(K::kind(&()).to_string(), key.to_string()));
        }
        store.delete(key).await?;
        info!(object = %key, "deletion requested");
        Ok(())
    }

    /// Create a cluster holding quota for all its pools
    #[instrument(skip(self, request), fields(cluster = %request.name, namespace = %request.namespace))]
    pub async fn create_cluster(&self, request: CreateClusterRequest) -> Result<ComputeCluster> {
        validate_dns_identifier(&request.name)
            .map_err(|e| Error::validation_for_field(request.name.as_str(), "metadata.name", e))?;
        let mut spec = request.spec;
        spec.validate(&request.name)?;
        spec.control = ControlState::default();

        let mut cluster = ComputeCluster::new(&request.name, spec);
        cluster.metadata.namespace = Some(request.namespace);
        self.create(&self.clusters, cluster).await
    }

    /// Replace a cluster's spec and resize its allocation
    ///
    /// Organization, project, and region cannot change.
    #[instrument(skip(self, spec), fields(cluster = %key))]
    pub async fn update_cluster(
        &self,
        key: &ObjectKey,
        spec: ComputeClusterSpec,
    ) -> Result<ComputeCluster> {
        spec.validate(&key.name)?;
        self.update(&self.clusters, key, |cluster: &mut ComputeCluster| {
            ensure_same_placement(
                key,
                [
                    cluster.spec.organization_id.as_str(),
                    cluster.spec.project_id.as_str(),
                    cluster.spec.region_id.as_str(),
                ],
                [
                    spec.organization_id.as_str(),
                    spec.project_id.as_str(),
                    spec.region_id.as_str(),
                ],
            )?;
            cluster.spec = spec.clone();
            Ok(())
        })
        .await
    }

    /// Mark a cluster for deletion
    #[instrument(skip(self), fields(cluster = %key))]
    pub async fn delete_cluster(&self, key: &ObjectKey) -> Result<()> {
        self.delete(&self.clusters, key).await
    }

    /// Delete specific machines and shrink their pools accordingly
    pub async fn evict_cluster_machines(
        &self,
        key: &ObjectKey,
        machine_ids: &[String],
    ) -> Result<ComputeCluster> {
        let backends = self.acquire().await?;
        evict_machines(self.clusters.as_ref(), &backends, key, machine_ids).await
    }

    /// Create an instance holding quota for one server
    #[instrument(skip(self, request), fields(instance = %request.name, namespace = %request.namespace))]
    pub async fn create_instance(
        &self,
        request: CreateInstanceRequest,
    ) -> Result<ComputeInstance> {
        let mut spec = request.spec;
        spec.validate(&request.name)?;
        spec.control = ControlState {
            network_id: request.network_id,
            ..ControlState::default()
        };

        let mut instance = ComputeInstance::new(&request.name, spec);
        instance.metadata.namespace = Some(request.namespace);
        self.create(&self.instances, instance).await
    }

    /// Replace an instance's spec
    #[instrument(skip(self, spec), fields(instance = %key))]
    pub async fn update_instance(
        &self,
        key: &ObjectKey,
        spec: ComputeInstanceSpec,
    ) -> Result<ComputeInstance> {
        spec.validate(&key.name)?;
        self.update(&self.instances, key, |instance: &mut ComputeInstance| {
            ensure_same_placement(
                key,
                [
                    instance.spec.organization_id.as_str(),
                    instance.spec.project_id.as_str(),
                    instance.spec.region_id.as_str(),
                ],
                [
                    spec.organization_id.as_str(),
                    spec.project_id.as_str(),
                    spec.region_id.as_str(),
                ],
            )?;
            instance.spec = spec.clone();
            Ok(())
        })
        .await
    }

    /// Mark an instance for deletion
    #[instrument(skip(self), fields(instance = %key))]
    pub async fn delete_instance(&self, key: &ObjectKey) -> Result<()> {
        self.delete(&self.instances, key).await
    }
}
