//! Identity and network resolution
//!
//! A resource needs a provisioned region identity and a network inside it
//! before servers can exist. Each missing dependency is created, its ID is
//! persisted into the control state, and the pass yields; the next pass
//! waits until the backend reports it provisioned.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use cirrus_backend::region::{Identity, IdentityWrite, NetworkWrite, ResourceMetadata};
use cirrus_backend::scope::{DeleteOutcome, ProjectScope};
use cirrus_backend::tags::ownership;
use cirrus_backend::RegionApi;
use cirrus_common::crd::ProvisioningStatus;
use cirrus_common::store::{modify, ObjectKey, ObjectStore};
use cirrus_common::{Error, Result};

use crate::resource::ManagedResource;
use crate::saga::Saga;

/// Dependencies of a resource, ready for use
#[derive(Clone, Debug)]
pub struct Dependencies {
    /// Provisioned region identity
    pub identity: Identity,
    /// Network servers attach to
    pub network_id: String,
}

/// Map a dependency's provisioning status onto continue, yield, or failure
fn settle(kind: &str, metadata: &ResourceMetadata) -> Result<()> {
    match metadata.provisioning() {
        Ok(ProvisioningStatus::Provisioned) => Ok(()),
        Ok(status) if status.is_pending() => Err(Error::yield_for(format!(
            "{} {} is {}",
            kind, metadata.id, status
        ))),
        Ok(status) => Err(Error::dependency_status(
            kind,
            metadata.id.as_str(),
            status.to_string(),
        )),
        Err(raw) => Err(Error::dependency_status(kind, metadata.id.as_str(), raw)),
    }
}

struct IdentityCreation<K: ManagedResource> {
    region: Arc<dyn RegionApi>,
    store: Arc<dyn ObjectStore<K>>,
    key: ObjectKey,
    scope: ProjectScope,
    request: IdentityWrite,
    created: Option<String>,
}

fn create_identity<K: ManagedResource>(
    ctx: &mut IdentityCreation<K>,
) -> BoxFuture<'_, Result<()>> {
    async move {
        let identity = ctx.region.create_identity(&ctx.scope, &ctx.request).await?;
        info!(identity = %identity.metadata.id, "created region identity");
        ctx.created = Some(identity.metadata.id);
        Ok(())
    }
    .boxed()
}

fn delete_identity<K: ManagedResource>(
    ctx: &mut IdentityCreation<K>,
) -> BoxFuture<'_, Result<()>> {
    async move {
        if let Some(id) = &ctx.created {
            warn!(identity = %id, "removing orphaned region identity");
            ctx.region.delete_identity(&ctx.scope, id).await?;
        }
        Ok(())
    }
    .boxed()
}

fn record_identity<K: ManagedResource>(
    ctx: &mut IdentityCreation<K>,
) -> BoxFuture<'_, Result<()>> {
    async move {
        let id = ctx
            .created
            .clone()
            .ok_or_else(|| Error::internal_with_context("resolver", "identity was not created"))?;
        modify(ctx.store.as_ref(), &ctx.key, |obj: &mut K| {
            obj.control_mut().identity_id = Some(id.clone());
            Ok(())
        })
        .await?;
        Ok(())
    }
    .boxed()
}

/// Resolve the identity and network of `obj`
///
/// Yields after creating either dependency and while either is still
/// provisioning. A recorded reference the backend no longer knows is a
/// consistency error.
pub async fn resolve<K: ManagedResource>(
    region: &Arc<dyn RegionApi>,
    store: &Arc<dyn ObjectStore<K>>,
    obj: &K,
) -> Result<Dependencies> {
    let owner = obj.owner()?;
    let scope = obj.scope();
    let key = ObjectKey::of(obj);
    let control = obj.control();

    let Some(identity_id) = control.identity_id.clone() else {
        let saga = Saga::new("create identity")
            .compensated_step("create identity", create_identity::<K>, delete_identity::<K>)
            .step("record identity", record_identity::<K>);
        let mut ctx = IdentityCreation {
            region: region.clone(),
            store: store.clone(),
            key,
            scope,
            request: IdentityWrite {
                name: obj.name_any(),
                tags: ownership(&owner, None),
                region_id: obj.region_id().to_string(),
            },
            created: None,
        };
        saga.run(&mut ctx).await?;
        return Err(Error::yield_for("identity created"));
    };

    let identity = region
        .get_identity(&scope, &identity_id)
        .await?
        .ok_or_else(|| {
            Error::consistency(key.to_string(), format!("identity {} not found", identity_id))
        })?;
    settle("identity", &identity.metadata)?;
    debug!(identity = %identity_id, "identity provisioned");

    let identity_scope = scope.identity(identity_id.as_str());

    let Some(network_id) = control.network_id.clone() else {
        let network = region
            .create_network(
                &identity_scope,
                &NetworkWrite {
                    name: obj.name_any(),
                    tags: ownership(&owner, None),
                    prefix: None,
                    dns_nameservers: Vec::new(),
                },
            )
            .await?;
        info!(network = %network.metadata.id, "created network");

        let network_id = network.metadata.id;
        modify(store.as_ref(), &key, |o: &mut K| {
            o.control_mut().network_id = Some(network_id.clone());
            Ok(())
        })
        .await?;
        return Err(Error::yield_for("network created"));
    };

    match region.get_network(&identity_scope, &network_id).await? {
        Some(network) => settle("network", &network.metadata)?,
        None if K::EXTERNAL_NETWORK_ALLOWED => {
            debug!(network = %network_id, "using network outside the identity");
        }
        None => {
            return Err(Error::consistency(
                key.to_string(),
                format!("network {} not found", network_id),
            ))
        }
    }

    Ok(Dependencies {
        identity,
        network_id,
    })
}

/// Release the identity of `obj`, and with it everything the identity owns
///
/// Yields while the backend is still deleting it.
pub async fn release<K: ManagedResource>(region: &dyn RegionApi, obj: &K) -> Result<()> {
    let Some(identity_id) = &obj.control().identity_id else {
        return Ok(());
    };

    match region.delete_identity(&obj.scope(), identity_id).await? {
        DeleteOutcome::Accepted => Err(Error::yield_for(format!(
            "identity {} deletion registered, not complete",
            identity_id
        ))),
        DeleteOutcome::NotFound => {
            info!(identity = %identity_id, "identity released");
            Ok(())
        }
    }
}
