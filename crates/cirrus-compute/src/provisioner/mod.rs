//! One reconcile pass over a cluster or instance
//!
//! [`provision`] sequences dependency resolution, security groups, and
//! servers, then records what it saw. The status always reflects the server
//! list read at the start of the pass, whatever happened afterwards.
//! [`deprovision`] releases the identity and allocation and drops the
//! finalizer once both are gone.

mod cluster;
mod instance;

use std::sync::Arc;

use kube::Resource;
use tracing::{debug, info, warn};

use cirrus_backend::region::Identity;
use cirrus_backend::scope::IdentityScope;
use cirrus_backend::{Backends, Owner};
use cirrus_common::crd::{ClusterPhase, WorkloadPoolSpec};
use cirrus_common::store::{modify, modify_status, ObjectKey, ObjectStore};
use cirrus_common::{Error, Result, RELEASE_FINALIZER};

use crate::pool::resolve_pools;
use crate::resolver::{release, resolve};
use crate::resource::{ManagedResource, Observation, StatusReport};
use crate::security_group::{
    apply_deletes, apply_writes, plan_security_groups, SecurityGroupSet,
};
use crate::server::{apply_plan, plan_servers, PlanContext, ServerSet};
use crate::status::{aggregate_health, phase_for, phase_for_resolution, pool_statuses};

/// Write `report` unless it leaves the recorded status unchanged
pub(crate) async fn persist_status<K: ManagedResource>(
    store: &dyn ObjectStore<K>,
    obj: &K,
    report: &StatusReport,
) -> Result<()> {
    let mut updated = obj.clone();
    updated.apply_report(report);
    if updated.status_ref() == obj.status_ref() {
        debug!("status unchanged");
        return Ok(());
    }

    modify_status(store, &ObjectKey::of(obj), |o: &mut K| o.apply_report(report)).await?;
    Ok(())
}

fn observe(set: &ServerSet, pools: &[WorkloadPoolSpec], identity: &Identity) -> Observation {
    let declared: Vec<String> = pools.iter().map(|p| p.name.clone()).collect();
    let pools = pool_statuses(set, &declared);
    Observation {
        health: aggregate_health(&pools),
        pools,
        ssh_private_key: identity.ssh_private_key.clone(),
    }
}

async fn list_servers(
    backends: &Backends,
    scope: &IdentityScope,
    owner: &Owner,
) -> Result<ServerSet> {
    ServerSet::build(backends.region.list_servers(scope, owner).await?)
}

/// Converge security groups and servers; returns the number of mutations
async fn converge<K: ManagedResource>(
    backends: &Backends,
    obj: &K,
    scope: &IdentityScope,
    owner: &Owner,
    network_id: &str,
    set: &ServerSet,
) -> Result<usize> {
    let region = backends.region.as_ref();
    let pools = resolve_pools(
        region,
        &obj.scope().organization_id,
        obj.region_id(),
        &obj.pools(),
    )
    .await?;

    let groups = SecurityGroupSet::build(region.list_security_groups(scope, owner).await?)?;
    let group_plan = plan_security_groups(&groups, &pools, owner, &|pool| {
        obj.security_group_name(pool)
    });
    let group_ids = apply_writes(region, scope, &group_plan).await?;

    let control = obj.control();
    if control.paused {
        return Err(Error::yield_for("eviction in progress"));
    }

    let plan = plan_servers(
        set,
        &pools,
        &PlanContext {
            owner,
            network_id,
            security_groups: &group_ids,
            eviction_hint: &control.eviction_hint,
        },
    );
    let server_changes = apply_plan(region, scope, &plan).await?;
    apply_deletes(region, scope, &group_plan).await?;

    Ok(server_changes + group_plan.changes())
}

/// Drive `obj` one step towards its spec
///
/// Returns the number of backend mutations issued. Yields while
/// dependencies settle, after a rebuild, and while an eviction holds the
/// object.
pub async fn provision<K: ManagedResource>(
    backends: &Backends,
    store: &Arc<dyn ObjectStore<K>>,
    obj: &K,
) -> Result<usize> {
    let generation = obj.meta().generation;

    let deps = match resolve(&backends.region, store, obj).await {
        Ok(deps) => deps,
        Err(e) => {
            let (phase, message) = phase_for_resolution(&e);
            let mut report = StatusReport::phase(phase, message);
            report.observed_generation = generation;
            if let Err(write) = persist_status(store.as_ref(), obj, &report).await {
                warn!(error = %write, "failed to record status");
            }
            return Err(e);
        }
    };

    let owner = obj.owner()?;
    let scope = obj.scope().identity(deps.identity.metadata.id.as_str());

    let set = match list_servers(backends, &scope, &owner).await {
        Ok(set) => set,
        Err(e) => {
            let mut report = StatusReport::phase(ClusterPhase::Failed, Some(e.to_string()));
            report.observed_generation = generation;
            if let Err(write) = persist_status(store.as_ref(), obj, &report).await {
                warn!(error = %write, "failed to record status");
            }
            return Err(e);
        }
    };

    let outcome = converge(backends, obj, &scope, &owner, &deps.network_id, &set).await;

    let (phase, message) = phase_for(&outcome, obj.control().paused);
    let report = StatusReport {
        phase,
        message,
        observation: Some(observe(&set, &obj.pools(), &deps.identity)),
        observed_generation: generation,
    };
    persist_status(store.as_ref(), obj, &report).await?;

    if let Ok(changes) = &outcome {
        info!(changes, servers = set.len(), "pass complete");
    }
    outcome
}

/// Release everything `obj` holds and remove its finalizer
///
/// Yields while the identity is being deleted.
pub async fn deprovision<K: ManagedResource>(
    backends: &Backends,
    store: &Arc<dyn ObjectStore<K>>,
    obj: &K,
) -> Result<()> {
    let project = obj.scope();
    let control = obj.control();

    // Machine state is informational here; a listing failure must not block deletion
    let mut observation = None;
    if let Some(identity_id) = &control.identity_id {
        if let Some(identity) = backends.region.get_identity(&project, identity_id).await? {
            let scope = project.identity(identity_id.as_str());
            match list_servers(backends, &scope, &obj.owner()?).await {
                Ok(set) => observation = Some(observe(&set, &obj.pools(), &identity)),
                Err(e) => warn!(error = %e, "could not observe servers during deletion"),
            }
        }
    }

    let report = StatusReport {
        phase: ClusterPhase::Deleting,
        message: Some("releasing resources".to_string()),
        observation,
        observed_generation: obj.meta().generation,
    };
    persist_status(store.as_ref(), obj, &report).await?;

    release(backends.region.as_ref(), obj).await?;

    if let Some(allocation_id) = &control.allocation_id {
        // Accepted and already-gone both release the quota
        let outcome = backends
            .identity
            .delete_allocation(&project, allocation_id)
            .await?;
        debug!(allocation = %allocation_id, ?outcome, "allocation released");
    }

    modify(store.as_ref(), &ObjectKey::of(obj), |o: &mut K| {
        let control = o.control_mut();
        control.identity_id = None;
        control.network_id = None;
        control.allocation_id = None;
        control.eviction_hint.clear();
        control.paused = false;
        if let Some(finalizers) = o.meta_mut().finalizers.as_mut() {
            finalizers.retain(|f| f != RELEASE_FINALIZER);
        }
        Ok(())
    })
    .await?;

    info!("released");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::ResourceExt;

    use crate::testing::{cluster, instance, pool_spec, FakeIdentity, FakeRegion};
    use cirrus_backend::tags::pool_of;
    use cirrus_common::crd::{ComputeCluster, ComputeInstance, ImageSpec};
    use cirrus_common::store::MemoryStore;

    struct Harness<K: ManagedResource> {
        region: Arc<FakeRegion>,
        identity: Arc<FakeIdentity>,
        store: Arc<dyn ObjectStore<K>>,
        key: ObjectKey,
    }

    impl<K: ManagedResource> Harness<K> {
        async fn new(mut obj: K) -> Self {
            obj.meta_mut().finalizers = Some(vec![RELEASE_FINALIZER.to_string()]);
            let store: Arc<dyn ObjectStore<K>> = Arc::new(MemoryStore::<K>::new());
            let created = store.create(&obj).await.unwrap();
            Self {
                region: Arc::new(FakeRegion::new()),
                identity: Arc::new(FakeIdentity::new()),
                store,
                key: ObjectKey::of(&created),
            }
        }

        fn backends(&self) -> Backends {
            Backends {
                region: self.region.clone(),
                identity: self.identity.clone(),
            }
        }

        async fn current(&self) -> Option<K> {
            self.store.get(&self.key).await.unwrap()
        }

        async fn pass(&self) -> Result<usize> {
            let obj = self.current().await.unwrap();
            provision(&self.backends(), &self.store, &obj).await
        }

        async fn delete_pass(&self) -> Result<()> {
            let obj = self.current().await.unwrap();
            deprovision(&self.backends(), &self.store, &obj).await
        }

        /// Run passes until identity and network exist
        async fn settle_dependencies(&self) {
            for _ in 0..2 {
                let err = self.pass().await.unwrap_err();
                assert!(err.is_yield(), "unexpected error {err:?}");
            }
            self.region.clear_calls();
        }
    }

    fn one_pool_cluster() -> ComputeCluster {
        cluster("c1", vec![pool_spec("pool", 2)])
    }

    fn created_servers(region: &FakeRegion) -> Vec<(String, String)> {
        let mut servers: Vec<(String, String)> = region
            .servers()
            .into_iter()
            .map(|s| (s.metadata.name, s.spec.flavor_id))
            .collect();
        servers.sort();
        servers
    }

    #[tokio::test]
    async fn flavor_change_rebuilds_across_passes() {
        let h = Harness::new(one_pool_cluster()).await;
        h.settle_dependencies().await;

        // Pass 1 creates both servers
        assert_eq!(h.pass().await.unwrap(), 2);
        assert_eq!(
            h.region.calls(),
            vec!["create_server pool-0", "create_server pool-1"]
        );
        assert_eq!(
            created_servers(&h.region),
            vec![
                ("pool-0".to_string(), "f1".to_string()),
                ("pool-1".to_string(), "f1".to_string())
            ]
        );

        // Pass 2 has nothing to do
        h.region.clear_calls();
        assert_eq!(h.pass().await.unwrap(), 0);
        assert!(h.region.calls().is_empty());

        modify(h.store.as_ref(), &h.key, |c: &mut ComputeCluster| {
            c.spec.workload_pools[0].flavor_id = "f2".to_string();
            Ok(())
        })
        .await
        .unwrap();

        // Pass 3 deletes both and yields
        h.region.clear_calls();
        let err = h.pass().await.unwrap_err();
        assert!(err.is_yield());
        let mut calls = h.region.calls();
        calls.sort();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|c| c.starts_with("delete_server")));

        // Pass 4 recreates them with the new flavor
        h.region.clear_calls();
        assert_eq!(h.pass().await.unwrap(), 2);
        assert_eq!(
            created_servers(&h.region),
            vec![
                ("pool-0".to_string(), "f2".to_string()),
                ("pool-1".to_string(), "f2".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn status_tracks_the_observed_servers() {
        let h = Harness::new(one_pool_cluster()).await;

        h.pass().await.unwrap_err();
        let status = h.current().await.unwrap().status.unwrap();
        assert_eq!(status.phase, ClusterPhase::ResolvingDependencies);

        h.pass().await.unwrap_err();
        h.pass().await.unwrap();
        let status = h.current().await.unwrap().status.unwrap();
        assert_eq!(status.phase, ClusterPhase::Reconciling);
        assert!(status.workload_pools[0].machines.is_empty());

        h.pass().await.unwrap();
        let current = h.current().await.unwrap();
        let status = current.status.unwrap();
        assert_eq!(status.phase, ClusterPhase::Stable);
        assert_eq!(status.workload_pools[0].replicas, 2);
        assert_eq!(status.ssh_private_key.as_deref(), Some("ssh-key"));
        assert_eq!(status.observed_generation, current.metadata.generation);
    }

    #[tokio::test]
    async fn converged_pass_writes_nothing() {
        let h = Harness::new(one_pool_cluster()).await;
        h.settle_dependencies().await;
        h.pass().await.unwrap();
        h.pass().await.unwrap();

        let before = h.current().await.unwrap().resource_version();
        h.region.clear_calls();
        assert_eq!(h.pass().await.unwrap(), 0);

        assert!(h.region.calls().is_empty());
        assert_eq!(h.current().await.unwrap().resource_version(), before);
    }

    #[tokio::test]
    async fn firewall_rules_get_a_group_referenced_by_servers() {
        let mut c = one_pool_cluster();
        c.spec.workload_pools[0].firewall = vec![crate::testing::ssh_rule()];
        let h = Harness::new(c).await;
        h.settle_dependencies().await;

        h.pass().await.unwrap();
        assert_eq!(h.region.calls()[0], "create_security_group c1-pool");

        let groups = h.region.security_groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(pool_of(&groups[0].metadata.tags), Some("pool"));
        for server in h.region.servers() {
            assert_eq!(server.spec.security_groups, vec![groups[0].metadata.id.clone()]);
        }
    }

    #[tokio::test]
    async fn paused_cluster_skips_servers() {
        let h = Harness::new(one_pool_cluster()).await;
        h.settle_dependencies().await;
        modify(h.store.as_ref(), &h.key, |c: &mut ComputeCluster| {
            c.spec.control.paused = true;
            Ok(())
        })
        .await
        .unwrap();

        let err = h.pass().await.unwrap_err();
        assert!(err.is_yield());
        assert!(h.region.calls().is_empty());
        let status = h.current().await.unwrap().status.unwrap();
        assert_eq!(status.phase, ClusterPhase::Evicting);
    }

    #[tokio::test]
    async fn backend_failure_is_recorded_as_failed() {
        let h = Harness::new(one_pool_cluster()).await;
        h.settle_dependencies().await;
        h.region.fail_on("create_server pool-0", 503);

        let err = h.pass().await.unwrap_err();
        assert!(matches!(err, Error::BackendStatus { code: 503, .. }));
        let status = h.current().await.unwrap().status.unwrap();
        assert_eq!(status.phase, ClusterPhase::Failed);
        assert!(status.message.unwrap().contains("503"));
    }

    #[tokio::test]
    async fn deletion_releases_identity_then_allocation_then_finalizer() {
        let h = Harness::new(one_pool_cluster()).await;
        modify(h.store.as_ref(), &h.key, |c: &mut ComputeCluster| {
            c.spec.control.allocation_id = Some("alloc-1".to_string());
            Ok(())
        })
        .await
        .unwrap();
        h.settle_dependencies().await;
        h.pass().await.unwrap();
        h.store.delete(&h.key).await.unwrap();

        let err = h.delete_pass().await.unwrap_err();
        assert!(err.is_yield());
        let status = h.current().await.unwrap().status.unwrap();
        assert_eq!(status.phase, ClusterPhase::Deleting);

        h.delete_pass().await.unwrap();
        assert!(h.current().await.is_none());
        assert_eq!(h.identity.calls(), vec!["delete_allocation alloc-1"]);
    }

    #[tokio::test]
    async fn instance_runs_one_server_named_after_it() {
        let h = Harness::<ComputeInstance>::new(instance("vm1", ImageSpec::by_id("i1"))).await;
        h.settle_dependencies().await;

        assert_eq!(h.pass().await.unwrap(), 1);
        assert_eq!(h.region.calls(), vec!["create_server vm1-0"]);

        h.pass().await.unwrap();
        let status = h.current().await.unwrap().status.unwrap();
        assert_eq!(status.phase, ClusterPhase::Stable);
        assert_eq!(status.machine.map(|m| m.hostname).as_deref(), Some("vm1-0"));
    }
}
