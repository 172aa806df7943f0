//! Controller wiring
//!
//! One kube-runtime `Controller` per kind. The runtime guarantees a single
//! in-flight reconcile per object; `workers` bounds how many objects of a
//! kind are reconciled at once.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use cirrus_common::crd::{ComputeCluster, ComputeInstance};
use cirrus_compute::{
    error_policy_cluster, error_policy_instance, reconcile_cluster, reconcile_instance, Context,
};

/// Server-side watch timeout, below the client's read timeout
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Build the cluster and instance controllers
///
/// Both stop when the process receives SIGTERM or Ctrl+C.
pub fn build_controllers(
    client: Client,
    ctx: Arc<Context>,
    workers: u16,
) -> Vec<Pin<Box<dyn Future<Output = ()> + Send>>> {
    let watcher = || WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS);
    let config = || ControllerConfig::default().concurrency(workers);

    let clusters: Api<ComputeCluster> = Api::all(client.clone());
    let cluster_ctrl = Controller::new(clusters, watcher())
        .with_config(config())
        .shutdown_on_signal()
        .run(reconcile_cluster, error_policy_cluster, ctx.clone())
        .for_each(log_reconcile_result("ComputeCluster"));

    let instances: Api<ComputeInstance> = Api::all(client);
    let instance_ctrl = Controller::new(instances, watcher())
        .with_config(config())
        .shutdown_on_signal()
        .run(reconcile_instance, error_policy_instance, ctx)
        .for_each(log_reconcile_result("ComputeInstance"));

    tracing::info!(workers, "starting controllers");
    tracing::info!("- ComputeCluster controller");
    tracing::info!("- ComputeInstance controller");

    vec![Box::pin(cluster_ctrl), Box::pin(instance_ctrl)]
}

/// Log the outcome of each reconcile emitted by a controller stream
fn log_reconcile_result<R, A, E>(
    kind: &'static str,
) -> impl Fn(Result<(R, A), E>) -> std::future::Ready<()>
where
    R: std::fmt::Display,
    A: std::fmt::Debug,
    E: std::fmt::Debug,
{
    move |result| {
        match result {
            Ok((object, action)) => {
                tracing::debug!(%object, ?action, kind, "reconciled")
            }
            Err(e) => tracing::warn!(error = ?e, kind, "reconcile failed"),
        }
        std::future::ready(())
    }
}
