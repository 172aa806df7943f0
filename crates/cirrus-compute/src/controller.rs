//! kube-runtime reconcile entry points
//!
//! Each pass runs under a deadline with its own child cancellation token.
//! A yield is not a failure: it requeues the object after a delay that grows
//! with consecutive yields. Failures go to the error policy, which has
//! already been recorded in status by the provisioner.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use cirrus_common::crd::{ComputeCluster, ComputeInstance};
use cirrus_common::store::{modify, ObjectKey, ObjectStore};
use cirrus_common::{Error, Result, RELEASE_FINALIZER};

use crate::context::Context;
use crate::provisioner::{deprovision, provision};
use crate::resource::ManagedResource;

/// Reconcile a ComputeCluster
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any(), namespace = %cluster.namespace().unwrap_or_default()))]
pub async fn reconcile_cluster(cluster: Arc<ComputeCluster>, ctx: Arc<Context>) -> Result<Action> {
    reconcile(cluster.as_ref(), &ctx.clusters, &ctx).await
}

/// Reconcile a ComputeInstance
#[instrument(skip(instance, ctx), fields(instance = %instance.name_any(), namespace = %instance.namespace().unwrap_or_default()))]
pub async fn reconcile_instance(
    instance: Arc<ComputeInstance>,
    ctx: Arc<Context>,
) -> Result<Action> {
    reconcile(instance.as_ref(), &ctx.instances, &ctx).await
}

/// Requeue policy for a failed cluster pass
pub fn error_policy_cluster(cluster: Arc<ComputeCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    error_policy(cluster.as_ref(), error, &ctx)
}

/// Requeue policy for a failed instance pass
pub fn error_policy_instance(
    instance: Arc<ComputeInstance>,
    error: &Error,
    ctx: Arc<Context>,
) -> Action {
    error_policy(instance.as_ref(), error, &ctx)
}

fn tracker_key<K: ManagedResource>(obj: &K) -> String {
    format!("{}/{}", K::kind(&()), ObjectKey::of(obj))
}

fn error_policy<K: ManagedResource>(obj: &K, error: &Error, ctx: &Context) -> Action {
    error!(
        ?error,
        object = %ObjectKey::of(obj),
        kind = %K::kind(&()),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(ctx.settings.error_requeue)
    } else {
        Action::requeue(ctx.settings.validation_requeue)
    }
}

async fn reconcile<K: ManagedResource>(
    obj: &K,
    store: &Arc<dyn ObjectStore<K>>,
    ctx: &Context,
) -> Result<Action> {
    let key = tracker_key(obj);
    let cancel = ctx.shutdown.child_token();

    let outcome = match tokio::time::timeout(
        ctx.settings.pass_timeout,
        run_pass(obj, store, ctx, cancel.clone()),
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(_) => {
            cancel.cancel();
            Err(Error::cancelled("reconcile pass deadline"))
        }
    };

    match outcome {
        Ok(0) => {
            ctx.yields.reset(&key);
            Ok(Action::requeue(ctx.settings.resync_interval))
        }
        Ok(changes) => {
            ctx.yields.reset(&key);
            debug!(changes, "re-observing after changes");
            Ok(Action::requeue(ctx.settings.yield_backoff.initial_delay))
        }
        Err(e) if e.is_yield() => {
            let delay = ctx.yields.next_delay(&key, &ctx.settings.yield_backoff);
            debug!(reason = %e, delay_ms = delay.as_millis() as u64, "yielding");
            Ok(Action::requeue(delay))
        }
        Err(e) => Err(e),
    }
}

/// One pass; returns the number of backend mutations
async fn run_pass<K: ManagedResource>(
    obj: &K,
    store: &Arc<dyn ObjectStore<K>>,
    ctx: &Context,
    cancel: CancellationToken,
) -> Result<usize> {
    if obj.is_deleting() {
        if !obj.holds_release() {
            return Ok(0);
        }
        let backends = ctx.backends.acquire(cancel).await?;
        deprovision(&backends, store, obj).await?;
        return Ok(0);
    }

    if !obj.holds_release() {
        info!("adding release finalizer");
        modify(store.as_ref(), &ObjectKey::of(obj), |o: &mut K| {
            let finalizers = o.meta_mut().finalizers.get_or_insert_with(Vec::new);
            if !finalizers.iter().any(|f| f == RELEASE_FINALIZER) {
                finalizers.push(RELEASE_FINALIZER.to_string());
            }
            Ok(())
        })
        .await?;
    }

    let backends = ctx.backends.acquire(cancel).await?;
    match provision(&backends, store, obj).await {
        Err(e) if !e.is_yield() => {
            warn!(error = %e, "pass failed");
            Err(e)
        }
        outcome => outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::context::ReconcileSettings;
    use crate::testing::{cluster, pool_spec, StaticBackends};
    use cirrus_common::crd::ClusterPhase;
    use cirrus_common::retry::RetryConfig;
    use cirrus_common::store::MemoryStore;

    struct Harness {
        backends: Arc<StaticBackends>,
        ctx: Arc<Context>,
        key: ObjectKey,
    }

    impl Harness {
        async fn new() -> Self {
            let backends = Arc::new(StaticBackends::new());
            let clusters: Arc<dyn ObjectStore<ComputeCluster>> =
                Arc::new(MemoryStore::<ComputeCluster>::new());
            let created = clusters
                .create(&cluster("c1", vec![pool_spec("web", 1)]))
                .await
                .unwrap();

            let ctx = Context::builder(backends.clone())
                .cluster_store(clusters)
                .settings(ReconcileSettings {
                    yield_backoff: RetryConfig::for_yield(
                        Duration::from_secs(1),
                        Duration::from_secs(30),
                    ),
                    ..ReconcileSettings::default()
                })
                .build();

            Self {
                backends,
                ctx: Arc::new(ctx),
                key: ObjectKey::of(&created),
            }
        }

        async fn current(&self) -> Option<ComputeCluster> {
            self.ctx.clusters.get(&self.key).await.unwrap()
        }

        async fn reconcile(&self) -> Result<Action> {
            let obj = self.current().await.unwrap();
            reconcile_cluster(Arc::new(obj), self.ctx.clone()).await
        }
    }

    #[tokio::test]
    async fn first_pass_adds_finalizer_and_yields() {
        let h = Harness::new().await;

        let action = h.reconcile().await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(1)));

        let current = h.current().await.unwrap();
        assert!(current.holds_release());
        assert!(current.spec.control.identity_id.is_some());
    }

    #[tokio::test]
    async fn consecutive_yields_back_off_and_reset_on_success() {
        let h = Harness::new().await;

        // identity, then network
        h.reconcile().await.unwrap();
        let second = h.reconcile().await.unwrap();
        assert_eq!(second, Action::requeue(Duration::from_secs(2)));

        // servers created, then converged
        h.reconcile().await.unwrap();
        let settled = h.reconcile().await.unwrap();
        assert_eq!(settled, Action::requeue(ReconcileSettings::default().resync_interval));

        let key = tracker_key(&h.current().await.unwrap());
        assert_eq!(h.ctx.yields.count(&key), 0);
        assert_eq!(
            h.current().await.unwrap().status.unwrap().phase,
            ClusterPhase::Stable
        );
    }

    #[tokio::test]
    async fn failures_surface_to_the_error_policy() {
        let h = Harness::new().await;
        h.reconcile().await.unwrap();
        h.reconcile().await.unwrap();
        h.backends.region.fail_on("create_server web-0", 500);

        let err = h.reconcile().await.unwrap_err();
        assert!(matches!(err, Error::BackendStatus { code: 500, .. }));

        let obj = Arc::new(h.current().await.unwrap());
        let action = error_policy_cluster(obj, &err, h.ctx.clone());
        assert_eq!(action, Action::requeue(ReconcileSettings::default().error_requeue));
    }

    #[tokio::test]
    async fn deletion_runs_to_completion() {
        let h = Harness::new().await;
        for _ in 0..4 {
            h.reconcile().await.unwrap();
        }
        h.ctx.clusters.delete(&h.key).await.unwrap();

        // identity deletion accepted, then confirmed
        h.reconcile().await.unwrap();
        h.reconcile().await.unwrap();

        assert!(h.current().await.is_none());
    }

    #[test]
    fn validation_errors_requeue_slowly() {
        let ctx = Context::builder(Arc::new(StaticBackends::new())).build();
        let action = error_policy_cluster(
            Arc::new(cluster("c1", vec![])),
            &Error::validation("bad"),
            Arc::new(ctx),
        );
        assert_eq!(action, Action::requeue(ReconcileSettings::default().validation_requeue));
    }
}
