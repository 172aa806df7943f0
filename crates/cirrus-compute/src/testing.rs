//! In-process backends and fixtures for engine tests
//!
//! [`FakeRegion`] and [`FakeIdentity`] keep their state behind a mutex and
//! log every mutating call as `"operation target"`, where the target is the
//! request name for creates and the ID otherwise. Reads are not logged so
//! tests can assert that a converged pass issues no calls at all.
//! [`FlakyStore`] fails chosen writes to exercise compensation paths.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use cirrus_backend::identity::{Allocation, AllocationWrite, IdentityApi};
use cirrus_backend::region::{
    Flavor, FlavorGpu, Identity, IdentityWrite, Image, ImageOs, Network, NetworkWrite,
    RegionApi, ResourceMetadata, SecurityGroup, SecurityGroupRule, SecurityGroupWrite, Server,
    ServerNetwork, ServerSpec, ServerStatus, ServerWrite,
};
use cirrus_backend::scope::{DeleteOutcome, IdentityScope, ProjectScope};
use cirrus_backend::tags::{ownership, Owner};
use cirrus_backend::{BackendProvider, Backends};
use cirrus_common::crd::{
    ComputeCluster, ComputeClusterSpec, ComputeInstance, ComputeInstanceSpec, ControlState,
    FirewallDirection, FirewallProtocol, FirewallRule, ImageSpec, WorkloadPoolSpec,
};
use cirrus_common::store::{MemoryStore, ObjectKey, ObjectStore, StoredObject};
use cirrus_common::{Error, Result};

/// uid owning the servers built by [`server`]
pub const OWNER_UID: &str = "uid-1";

fn metadata(id: &str, name: &str, tags: Vec<cirrus_backend::tags::Tag>) -> ResourceMetadata {
    ResourceMetadata {
        id: id.to_string(),
        name: name.to_string(),
        tags,
        provisioning_status: "provisioned".to_string(),
        health_status: "healthy".to_string(),
        creation_time: None,
    }
}

/// A healthy server in `pool` owned by the [`OWNER_UID`] cluster
pub fn server(id: &str, name: &str, pool: &str, flavor: &str, image: &str) -> Server {
    let owner = Owner::Cluster(OWNER_UID.to_string());
    let mut s = server_for(&owner, id, name, pool);
    s.spec.flavor_id = flavor.to_string();
    s.spec.image_id = image.to_string();
    s
}

/// A healthy `f1`/`i1` server in `pool` owned by `owner`
pub fn server_for(owner: &Owner, id: &str, name: &str, pool: &str) -> Server {
    Server {
        metadata: metadata(id, name, ownership(owner, Some(pool))),
        spec: ServerSpec {
            flavor_id: "f1".to_string(),
            image_id: "i1".to_string(),
            networks: vec![ServerNetwork {
                id: "net-1".to_string(),
                allowed_address_pairs: vec![],
            }],
            ..Default::default()
        },
        status: ServerStatus {
            private_ip: Some(format!("10.0.0.{}", name.len())),
            public_ip: None,
        },
    }
}

/// A security group owned by the [`OWNER_UID`] cluster
pub fn security_group(id: &str, pool: &str, rules: Vec<SecurityGroupRule>) -> SecurityGroup {
    let owner = Owner::Cluster(OWNER_UID.to_string());
    SecurityGroup {
        metadata: metadata(id, &format!("c1-{}", pool), ownership(&owner, Some(pool))),
        rules,
    }
}

/// Inbound SSH from anywhere
pub fn ssh_rule() -> FirewallRule {
    FirewallRule {
        direction: FirewallDirection::Ingress,
        protocol: FirewallProtocol::Tcp,
        port: 22,
        port_max: None,
        prefixes: vec!["0.0.0.0/0".to_string()],
    }
}

/// A pool of `f1` servers booting image `i1`
pub fn pool_spec(name: &str, replicas: u32) -> WorkloadPoolSpec {
    WorkloadPoolSpec {
        name: name.to_string(),
        replicas,
        flavor_id: "f1".to_string(),
        image: ImageSpec::by_id("i1"),
        disk_size_gib: None,
        firewall: vec![],
        public_ip: false,
        allowed_address_pairs: vec![],
        user_data: None,
    }
}

/// A cluster in namespace `tenant` without finalizers
pub fn cluster(name: &str, pools: Vec<WorkloadPoolSpec>) -> ComputeCluster {
    let mut c = ComputeCluster::new(
        name,
        ComputeClusterSpec {
            organization_id: "org".to_string(),
            project_id: "proj".to_string(),
            region_id: "r1".to_string(),
            workload_pools: pools,
            control: ControlState::default(),
        },
    );
    c.metadata.namespace = Some("tenant".to_string());
    c
}

/// An `f1` instance in namespace `tenant` without finalizers
pub fn instance(name: &str, image: ImageSpec) -> ComputeInstance {
    let mut i = ComputeInstance::new(
        name,
        ComputeInstanceSpec {
            organization_id: "org".to_string(),
            project_id: "proj".to_string(),
            region_id: "r1".to_string(),
            flavor_id: "f1".to_string(),
            image,
            disk_size_gib: None,
            firewall: vec![],
            public_ip: false,
            allowed_address_pairs: vec![],
            user_data: None,
            control: ControlState::default(),
        },
    );
    i.metadata.namespace = Some("tenant".to_string());
    i
}

fn flavor(id: &str, gpus: u32) -> Flavor {
    Flavor {
        id: id.to_string(),
        name: id.to_string(),
        cpus: 4,
        memory_gib: 16,
        gpu: (gpus > 0).then(|| FlavorGpu {
            vendor: "nvidia".to_string(),
            model: "h100".to_string(),
            count: gpus,
        }),
    }
}

fn image(id: &str, distro: &str, version: &str, day: u32) -> Image {
    Image {
        id: id.to_string(),
        name: id.to_string(),
        created: Utc
            .with_ymd_and_hms(2026, 1, day, 0, 0, 0)
            .single()
            .unwrap_or_else(Utc::now),
        os: ImageOs {
            distro: distro.to_string(),
            version: version.to_string(),
        },
    }
}

#[derive(Default)]
struct RegionState {
    identities: BTreeMap<String, Identity>,
    networks: BTreeMap<String, Network>,
    groups: BTreeMap<String, SecurityGroup>,
    servers: BTreeMap<String, Server>,
    calls: Vec<String>,
    failures: BTreeMap<String, u16>,
    next_id: u32,
}

impl RegionState {
    /// Log a mutation, failing it if a failure was injected for it
    fn record(&mut self, call: String) -> Result<()> {
        let failure = self.failures.get(&call).copied();
        self.calls.push(call.clone());
        match failure {
            Some(code) => Err(Error::backend_status(call, code)),
            None => Ok(()),
        }
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }
}

/// In-memory [`RegionApi`]
///
/// New identities, networks, groups, and servers come up provisioned.
/// Identity deletion is accepted once and reports not-found afterwards.
#[derive(Default)]
pub struct FakeRegion {
    state: Mutex<RegionState>,
}

impl FakeRegion {
    /// An empty region
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a server
    pub fn insert_server(&self, server: Server) {
        self.state
            .lock()
            .servers
            .insert(server.metadata.id.clone(), server);
    }

    /// Every server, ordered by ID
    pub fn servers(&self) -> Vec<Server> {
        self.state.lock().servers.values().cloned().collect()
    }

    /// Seed a security group
    pub fn insert_security_group(&self, group: SecurityGroup) {
        self.state
            .lock()
            .groups
            .insert(group.metadata.id.clone(), group);
    }

    /// Every security group, ordered by ID
    pub fn security_groups(&self) -> Vec<SecurityGroup> {
        self.state.lock().groups.values().cloned().collect()
    }

    /// IDs of existing identities
    pub fn identity_ids(&self) -> Vec<String> {
        self.state.lock().identities.keys().cloned().collect()
    }

    /// Overwrite the provisioning status of every identity
    pub fn set_identity_status(&self, status: &str) {
        for identity in self.state.lock().identities.values_mut() {
            identity.metadata.provisioning_status = status.to_string();
        }
    }

    /// Overwrite the provisioning status of one server
    pub fn set_server_status(&self, id: &str, status: &str) {
        if let Some(server) = self.state.lock().servers.get_mut(id) {
            server.metadata.provisioning_status = status.to_string();
        }
    }

    /// Fail `call` (as it appears in [`Self::calls`]) with `code`
    pub fn fail_on(&self, call: &str, code: u16) {
        self.state.lock().failures.insert(call.to_string(), code);
    }

    /// Mutations issued so far
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    /// Forget logged mutations
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }
}

#[async_trait]
impl RegionApi for FakeRegion {
    async fn create_identity(
        &self,
        _scope: &ProjectScope,
        request: &IdentityWrite,
    ) -> Result<Identity> {
        let mut state = self.state.lock();
        state.record(format!("create_identity {}", request.name))?;
        let id = state.next_id("id");
        let identity = Identity {
            metadata: metadata(&id, &request.name, request.tags.clone()),
            region_id: request.region_id.clone(),
            ssh_private_key: Some("ssh-key".to_string()),
        };
        state.identities.insert(id, identity.clone());
        Ok(identity)
    }

    async fn get_identity(&self, _scope: &ProjectScope, id: &str) -> Result<Option<Identity>> {
        Ok(self.state.lock().identities.get(id).cloned())
    }

    async fn delete_identity(&self, _scope: &ProjectScope, id: &str) -> Result<DeleteOutcome> {
        let mut state = self.state.lock();
        state.record(format!("delete_identity {}", id))?;
        Ok(match state.identities.remove(id) {
            Some(_) => DeleteOutcome::Accepted,
            None => DeleteOutcome::NotFound,
        })
    }

    async fn create_network(
        &self,
        _scope: &IdentityScope,
        request: &NetworkWrite,
    ) -> Result<Network> {
        let mut state = self.state.lock();
        state.record(format!("create_network {}", request.name))?;
        let id = state.next_id("net");
        let network = Network {
            metadata: metadata(&id, &request.name, request.tags.clone()),
            prefix: Some("10.0.0.0/24".to_string()),
        };
        state.networks.insert(id, network.clone());
        Ok(network)
    }

    async fn get_network(&self, _scope: &IdentityScope, id: &str) -> Result<Option<Network>> {
        Ok(self.state.lock().networks.get(id).cloned())
    }

    async fn list_security_groups(
        &self,
        _scope: &IdentityScope,
        owner: &Owner,
    ) -> Result<Vec<SecurityGroup>> {
        Ok(self
            .state
            .lock()
            .groups
            .values()
            .filter(|g| owner.owns(&g.metadata.tags))
            .cloned()
            .collect())
    }

    async fn create_security_group(
        &self,
        _scope: &IdentityScope,
        request: &SecurityGroupWrite,
    ) -> Result<SecurityGroup> {
        let mut state = self.state.lock();
        state.record(format!("create_security_group {}", request.name))?;
        let id = state.next_id("sg");
        let group = SecurityGroup {
            metadata: metadata(&id, &request.name, request.tags.clone()),
            rules: request.rules.clone(),
        };
        state.groups.insert(id, group.clone());
        Ok(group)
    }

    async fn update_security_group(
        &self,
        _scope: &IdentityScope,
        id: &str,
        request: &SecurityGroupWrite,
    ) -> Result<SecurityGroup> {
        let mut state = self.state.lock();
        state.record(format!("update_security_group {}", id))?;
        let group = state
            .groups
            .get_mut(id)
            .ok_or_else(|| Error::backend_status("update security group", 404))?;
        group.rules = request.rules.clone();
        Ok(group.clone())
    }

    async fn delete_security_group(
        &self,
        _scope: &IdentityScope,
        id: &str,
    ) -> Result<DeleteOutcome> {
        let mut state = self.state.lock();
        state.record(format!("delete_security_group {}", id))?;
        Ok(match state.groups.remove(id) {
            Some(_) => DeleteOutcome::Accepted,
            None => DeleteOutcome::NotFound,
        })
    }

    async fn list_servers(&self, _scope: &IdentityScope, owner: &Owner) -> Result<Vec<Server>> {
        Ok(self
            .state
            .lock()
            .servers
            .values()
            .filter(|s| owner.owns(&s.metadata.tags))
            .cloned()
            .collect())
    }

    async fn create_server(&self, _scope: &IdentityScope, request: &ServerWrite) -> Result<Server> {
        let mut state = self.state.lock();
        state.record(format!("create_server {}", request.name))?;
        let id = state.next_id("srv");
        let server = Server {
            metadata: metadata(&id, &request.name, request.tags.clone()),
            spec: request.spec.clone(),
            status: ServerStatus::default(),
        };
        state.servers.insert(id, server.clone());
        Ok(server)
    }

    async fn update_server(
        &self,
        _scope: &IdentityScope,
        id: &str,
        request: &ServerWrite,
    ) -> Result<Server> {
        let mut state = self.state.lock();
        state.record(format!("update_server {}", id))?;
        let server = state
            .servers
            .get_mut(id)
            .ok_or_else(|| Error::backend_status("update server", 404))?;
        server.spec = request.spec.clone();
        Ok(server.clone())
    }

    async fn delete_server(&self, _scope: &IdentityScope, id: &str) -> Result<DeleteOutcome> {
        let mut state = self.state.lock();
        state.record(format!("delete_server {}", id))?;
        Ok(match state.servers.remove(id) {
            Some(_) => DeleteOutcome::Accepted,
            None => DeleteOutcome::NotFound,
        })
    }

    async fn list_flavors(&self, _organization_id: &str, _region_id: &str) -> Result<Vec<Flavor>> {
        Ok(vec![flavor("f1", 0), flavor("f2", 0), flavor("gpu-2x", 2)])
    }

    async fn list_images(&self, _organization_id: &str, _region_id: &str) -> Result<Vec<Image>> {
        Ok(vec![
            image("i1", "ubuntu", "22.04", 1),
            image("i2", "ubuntu", "24.04", 2),
            image("i3", "ubuntu", "24.04", 3),
        ])
    }
}

#[derive(Default)]
struct IdentityState {
    allocations: BTreeMap<String, AllocationWrite>,
    calls: Vec<String>,
    failures: BTreeSet<String>,
    next_id: u32,
}

/// In-memory [`IdentityApi`]
///
/// Updating an unknown allocation creates it, so tests can seed an
/// allocation ID on the object without creating it first.
#[derive(Default)]
pub struct FakeIdentity {
    state: Mutex<IdentityState>,
}

impl FakeIdentity {
    /// No allocations
    pub fn new() -> Self {
        Self::default()
    }

    /// Contents of an allocation
    pub fn allocation(&self, id: &str) -> Option<AllocationWrite> {
        self.state.lock().allocations.get(id).cloned()
    }

    /// Number of allocations held
    pub fn allocation_count(&self) -> usize {
        self.state.lock().allocations.len()
    }

    /// Fail `call` with a 500
    pub fn fail_on(&self, call: &str) {
        self.state.lock().failures.insert(call.to_string());
    }

    /// Mutations issued so far
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }
}

impl IdentityState {
    fn record(&mut self, call: String) -> Result<()> {
        let failed = self.failures.contains(&call);
        self.calls.push(call.clone());
        if failed {
            return Err(Error::backend_status(call, 500));
        }
        Ok(())
    }
}

#[async_trait]
impl IdentityApi for FakeIdentity {
    async fn create_allocation(
        &self,
        _scope: &ProjectScope,
        request: &AllocationWrite,
    ) -> Result<Allocation> {
        let mut state = self.state.lock();
        state.record(format!("create_allocation {}", request.id))?;
        state.next_id += 1;
        let id = format!("alloc-{}", state.next_id);
        state.allocations.insert(id.clone(), request.clone());
        Ok(Allocation {
            id,
            spec: request.clone(),
        })
    }

    async fn update_allocation(
        &self,
        _scope: &ProjectScope,
        id: &str,
        request: &AllocationWrite,
    ) -> Result<Allocation> {
        let mut state = self.state.lock();
        state.record(format!("update_allocation {}", id))?;
        state.allocations.insert(id.to_string(), request.clone());
        Ok(Allocation {
            id: id.to_string(),
            spec: request.clone(),
        })
    }

    async fn delete_allocation(&self, _scope: &ProjectScope, id: &str) -> Result<DeleteOutcome> {
        let mut state = self.state.lock();
        state.record(format!("delete_allocation {}", id))?;
        Ok(match state.allocations.remove(id) {
            Some(_) => DeleteOutcome::Accepted,
            None => DeleteOutcome::NotFound,
        })
    }
}

/// [`BackendProvider`] handing out the same fakes on every acquisition
#[derive(Default)]
pub struct StaticBackends {
    /// Region fake
    pub region: Arc<FakeRegion>,
    /// Identity fake
    pub identity: Arc<FakeIdentity>,
}

impl StaticBackends {
    /// Fresh fakes
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BackendProvider for StaticBackends {
    async fn acquire(&self, _cancel: CancellationToken) -> Result<Backends> {
        Ok(Backends {
            region: self.region.clone(),
            identity: self.identity.clone(),
        })
    }
}

#[derive(Default)]
struct Faults {
    fail_create: bool,
    replaces: u32,
    fail_replace: Option<u32>,
}

/// [`MemoryStore`] that fails selected writes with an internal error
///
/// Injected failures are not conflicts, so [`cirrus_common::store::modify`]
/// does not retry them.
pub struct FlakyStore<K: StoredObject> {
    inner: MemoryStore<K>,
    faults: Mutex<Faults>,
}

impl<K: StoredObject> Default for FlakyStore<K> {
    fn default() -> Self {
        Self {
            inner: MemoryStore::new(),
            faults: Mutex::new(Faults::default()),
        }
    }
}

impl<K: StoredObject> FlakyStore<K> {
    /// Empty store with no faults armed
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every create
    pub fn fail_creates(&self) {
        self.faults.lock().fail_create = true;
    }

    /// Fail the `n`th replace from now, counting from 1
    pub fn fail_replace(&self, n: u32) {
        let mut faults = self.faults.lock();
        faults.replaces = 0;
        faults.fail_replace = Some(n);
    }
}

#[async_trait]
impl<K: StoredObject> ObjectStore<K> for FlakyStore<K> {
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>> {
        self.inner.get(key).await
    }

    async fn list(&self, namespace: &str) -> Result<Vec<K>> {
        self.inner.list(namespace).await
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let failed = self.faults.lock().fail_create;
        if failed {
            return Err(Error::internal_with_context("store", "create rejected"));
        }
        self.inner.create(obj).await
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        let failed = {
            let mut faults = self.faults.lock();
            faults.replaces += 1;
            faults.fail_replace == Some(faults.replaces)
        };
        if failed {
            return Err(Error::internal_with_context("store", "replace rejected"));
        }
        self.inner.replace(obj).await
    }

    async fn replace_status(&self, obj: &K) -> Result<K> {
        self.inner.replace_status(obj).await
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        self.inner.delete(key).await
    }
}
