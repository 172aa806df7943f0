//! Cirrus operator: reconciles ComputeCluster and ComputeInstance objects
//! against the region and identity services

mod config;
mod controller_runner;

use std::sync::Arc;

use clap::Parser;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;

use cirrus_backend::HttpBackendProvider;
use cirrus_common::crd::{ComputeCluster, ComputeInstance};
use cirrus_common::telemetry::init_telemetry;
use cirrus_compute::Context;

use config::OperatorConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = OperatorConfig::parse();

    if config.crd {
        print_crds()?;
        return Ok(());
    }

    init_telemetry(config.telemetry())?;

    let backend = config.backend()?;
    let settings = config.settings()?;
    tracing::info!(
        region = %backend.region_url,
        identity = %backend.identity_url,
        workers = config.concurrency(),
        "starting cirrus operator"
    );

    let provider = HttpBackendProvider::new(backend)
        .map_err(|e| anyhow::anyhow!("failed to build backend clients: {}", e))?;
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create kube client: {}", e))?;

    if config.install_crds {
        ensure_crds_installed(&client).await?;
    }

    let shutdown = CancellationToken::new();
    let ctx = Arc::new(
        Context::builder(Arc::new(provider))
            .kube_client(client.clone())
            .settings(settings)
            .shutdown(shutdown.clone())
            .build(),
    );

    let controllers = controller_runner::build_controllers(client, ctx, config.concurrency());
    futures::future::join_all(controllers).await;

    // Controllers have drained; abort anything still bound to the token
    shutdown.cancel();
    tracing::info!("shutting down");
    Ok(())
}

fn print_crds() -> anyhow::Result<()> {
    for crd in [ComputeCluster::crd(), ComputeInstance::crd()] {
        let yaml = serde_yaml::to_string(&crd)
            .map_err(|e| anyhow::anyhow!("failed to serialize CRD: {}", e))?;
        println!("---\n{yaml}");
    }
    Ok(())
}

/// Apply both CRDs with server-side apply so they track the operator version
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply("cirrus-operator").force();

    for (name, crd) in [
        (ComputeCluster::crd_name(), ComputeCluster::crd()),
        (ComputeInstance::crd_name(), ComputeInstance::crd()),
    ] {
        tracing::info!(crd = name, "installing CRD");
        crds.patch(name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("failed to install {}: {}", name, e))?;
    }
    Ok(())
}
