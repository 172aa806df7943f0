//! Server reconciliation
//!
//! The backend list for an owner is indexed into a [`ServerSet`] by pool and
//! name. [`plan_servers`] compares it to the desired pools and yields the
//! deletes, in-place updates, and creates that converge them; [`apply_plan`]
//! issues them in that order.
//!
//! Servers being deprovisioned or named in the eviction hint are *leaving*:
//! they are never counted towards a pool's replicas and never acted on. A
//! pool with N replicas and counted servers C gets the lowest free indices
//! when `|C| < N` and loses its highest indices when `|C| > N`, so eviction
//! holes are refilled before the name range grows.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use cirrus_backend::region::{RegionApi, Server, ServerNetwork, ServerSpec, ServerWrite};
use cirrus_backend::scope::IdentityScope;
use cirrus_backend::tags::{ownership, pool_of, Owner};
use cirrus_common::crd::AllowedAddressPair;
use cirrus_common::{Error, Result};

use crate::pool::{parse_index, server_name, DesiredPool};

/// Current servers indexed by pool and name
#[derive(Clone, Debug, Default)]
pub struct ServerSet {
    pools: BTreeMap<String, BTreeMap<String, Server>>,
}

impl ServerSet {
    /// Index a backend listing
    ///
    /// A server without a pool tag, or two servers sharing a name within a
    /// pool, is a consistency error.
    pub fn build(servers: Vec<Server>) -> Result<Self> {
        let mut pools: BTreeMap<String, BTreeMap<String, Server>> = BTreeMap::new();

        for server in servers {
            let pool = pool_of(&server.metadata.tags)
                .ok_or_else(|| {
                    Error::consistency(
                        format!("server {}", server.metadata.id),
                        "missing pool tag",
                    )
                })?
                .to_string();

            let members = pools.entry(pool.clone()).or_default();
            if members.contains_key(&server.metadata.name) {
                return Err(Error::consistency(
                    format!("pool {}", pool),
                    format!("duplicate server name {}", server.metadata.name),
                ));
            }
            members.insert(server.metadata.name.clone(), server);
        }

        Ok(Self { pools })
    }

    /// Servers of `pool` by name
    pub fn pool(&self, pool: &str) -> Option<&BTreeMap<String, Server>> {
        self.pools.get(pool)
    }

    /// Names of pools with at least one server
    pub fn pool_names(&self) -> impl Iterator<Item = &str> {
        self.pools.keys().map(String::as_str)
    }

    /// Pool and server with backend ID `id`
    pub fn find_by_id(&self, id: &str) -> Option<(&str, &Server)> {
        self.pools.iter().find_map(|(pool, servers)| {
            servers
                .values()
                .find(|s| s.metadata.id == id)
                .map(|s| (pool.as_str(), s))
        })
    }

    /// Total number of servers
    pub fn len(&self) -> usize {
        self.pools.values().map(BTreeMap::len).sum()
    }

    /// Whether there are no servers
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Why a server is being deleted
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteReason {
    /// The pool has more servers than replicas
    ScaleDown,
    /// Flavor or image changed; the slot is recreated on a later pass
    Rebuild,
    /// The name is not `{pool}-{i}`
    NonCanonical,
    /// The pool is no longer declared
    Undeclared,
}

/// A server to delete
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Deletion {
    /// Backend ID
    pub id: String,
    /// Server name
    pub name: String,
    /// Why
    pub reason: DeleteReason,
}

/// A server to update in place
#[derive(Clone, Debug, PartialEq)]
pub struct Update {
    /// Backend ID
    pub id: String,
    /// Full replacement request
    pub request: ServerWrite,
}

/// Backend mutations converging one pass
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ServerPlan {
    /// Servers to delete
    pub deletes: Vec<Deletion>,
    /// Servers to update in place
    pub updates: Vec<Update>,
    /// Servers to create
    pub creates: Vec<ServerWrite>,
    /// Names whose creation waits for a leaving server to go away
    pub deferred: Vec<String>,
}

impl ServerPlan {
    /// Number of backend mutations
    pub fn changes(&self) -> usize {
        self.deletes.len() + self.updates.len() + self.creates.len()
    }

    /// Whether a later pass must finish the work
    ///
    /// A rebuild recreates its slot only once the old server is gone.
    pub fn needs_followup(&self) -> bool {
        !self.deferred.is_empty()
            || self
                .deletes
                .iter()
                .any(|d| d.reason == DeleteReason::Rebuild)
    }
}

/// Inputs shared by every pool in a pass
pub struct PlanContext<'a> {
    /// Owner tagged onto created servers
    pub owner: &'a Owner,
    /// Network every server attaches to
    pub network_id: &'a str,
    /// Security group ID per pool
    pub security_groups: &'a BTreeMap<String, String>,
    /// Server IDs an eviction is removing
    pub eviction_hint: &'a [String],
}

impl PlanContext<'_> {
    fn is_leaving(&self, server: &Server) -> bool {
        server.metadata.is_deprovisioning()
            || self.eviction_hint.iter().any(|id| *id == server.metadata.id)
    }

    fn desired_spec(&self, pool: &DesiredPool) -> ServerSpec {
        let template = &pool.template;
        ServerSpec {
            flavor_id: template.flavor_id.clone(),
            image_id: template.image_id.clone(),
            networks: vec![ServerNetwork {
                id: self.network_id.to_string(),
                allowed_address_pairs: template.allowed_address_pairs.clone(),
            }],
            public_ip: template.public_ip,
            security_groups: self
                .security_groups
                .get(&pool.name)
                .cloned()
                .into_iter()
                .collect(),
            user_data: template.user_data.clone(),
            disk_size_gib: template.disk_size_gib,
        }
    }
}

/// Whether `current` must be replaced rather than updated to reach `desired`
fn needs_rebuild(current: &ServerSpec, desired: &ServerSpec) -> bool {
    current.flavor_id != desired.flavor_id || current.image_id != desired.image_id
}

/// Whether the mutable parts of `current` differ from `desired`
///
/// Disk size is fixed at creation and never compared.
fn needs_update(current: &ServerSpec, desired: &ServerSpec) -> bool {
    fn networks(spec: &ServerSpec) -> BTreeMap<&str, BTreeSet<&AllowedAddressPair>> {
        spec.networks
            .iter()
            .map(|n| (n.id.as_str(), n.allowed_address_pairs.iter().collect()))
            .collect()
    }
    fn groups(spec: &ServerSpec) -> BTreeSet<&str> {
        spec.security_groups.iter().map(String::as_str).collect()
    }

    current.public_ip != desired.public_ip
        || current.user_data != desired.user_data
        || networks(current) != networks(desired)
        || groups(current) != groups(desired)
}

/// Compute the mutations converging `set` on `pools`
pub fn plan_servers(set: &ServerSet, pools: &[DesiredPool], ctx: &PlanContext<'_>) -> ServerPlan {
    let mut plan = ServerPlan::default();

    for pool in pools {
        let servers = set.pool(&pool.name);
        plan_pool(&mut plan, pool, servers, ctx);
    }

    for (name, servers) in &set.pools {
        if pools.iter().any(|p| &p.name == name) {
            continue;
        }
        for server in servers.values().filter(|s| !ctx.is_leaving(s)) {
            plan.deletes.push(Deletion {
                id: server.metadata.id.clone(),
                name: server.metadata.name.clone(),
                reason: DeleteReason::Undeclared,
            });
        }
    }

    plan
}

fn plan_pool(
    plan: &mut ServerPlan,
    pool: &DesiredPool,
    servers: Option<&BTreeMap<String, Server>>,
    ctx: &PlanContext<'_>,
) {
    let mut counted: BTreeMap<u32, &Server> = BTreeMap::new();
    let mut held: BTreeSet<&str> = BTreeSet::new();

    for server in servers.into_iter().flat_map(BTreeMap::values) {
        if ctx.is_leaving(server) {
            held.insert(server.metadata.name.as_str());
            continue;
        }
        match parse_index(&pool.name, &server.metadata.name) {
            Some(index) => {
                counted.insert(index, server);
            }
            None => plan.deletes.push(Deletion {
                id: server.metadata.id.clone(),
                name: server.metadata.name.clone(),
                reason: DeleteReason::NonCanonical,
            }),
        }
    }

    let desired = pool.replicas as usize;

    // Excess servers go from the top of the index range
    while counted.len() > desired {
        let Some((_, server)) = counted.pop_last() else {
            break;
        };
        plan.deletes.push(Deletion {
            id: server.metadata.id.clone(),
            name: server.metadata.name.clone(),
            reason: DeleteReason::ScaleDown,
        });
    }

    let spec = ctx.desired_spec(pool);

    for server in counted.values() {
        if needs_rebuild(&server.spec, &spec) {
            plan.deletes.push(Deletion {
                id: server.metadata.id.clone(),
                name: server.metadata.name.clone(),
                reason: DeleteReason::Rebuild,
            });
        } else if needs_update(&server.spec, &spec) {
            plan.updates.push(Update {
                id: server.metadata.id.clone(),
                request: ServerWrite {
                    name: server.metadata.name.clone(),
                    tags: server.metadata.tags.clone(),
                    spec: ServerSpec {
                        disk_size_gib: server.spec.disk_size_gib,
                        ..spec.clone()
                    },
                },
            });
        }
    }

    let missing = desired.saturating_sub(counted.len());
    let free = (0u32..)
        .filter(|i| !counted.contains_key(i))
        .take(missing);

    for index in free {
        let name = server_name(&pool.name, index);
        if held.contains(name.as_str()) {
            plan.deferred.push(name);
            continue;
        }
        plan.creates.push(ServerWrite {
            name,
            tags: ownership(ctx.owner, Some(&pool.name)),
            spec: spec.clone(),
        });
    }
}

/// Issue a plan's mutations: deletes, then updates, then creates
///
/// Returns the number of mutations issued. Yields afterwards when a rebuild
/// or a deferred create leaves work for a later pass.
pub async fn apply_plan(
    region: &dyn RegionApi,
    scope: &IdentityScope,
    plan: &ServerPlan,
) -> Result<usize> {
    for deletion in &plan.deletes {
        info!(server = %deletion.name, id = %deletion.id, reason = ?deletion.reason, "deleting server");
        // A server already gone counts as deleted
        region.delete_server(scope, &deletion.id).await?;
    }

    for update in &plan.updates {
        info!(server = %update.request.name, id = %update.id, "updating server");
        region.update_server(scope, &update.id, &update.request).await?;
    }

    for create in &plan.creates {
        info!(server = %create.name, flavor = %create.spec.flavor_id, "creating server");
        region.create_server(scope, create).await?;
    }

    if plan.needs_followup() {
        debug!(deferred = ?plan.deferred, "server reconciliation incomplete");
        return Err(Error::yield_for(if plan.deferred.is_empty() {
            "waiting for rebuilt servers to be deleted".to_string()
        } else {
            format!("waiting for {} to be released", plan.deferred.join(", "))
        }));
    }

    Ok(plan.changes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ServerTemplate;
    use crate::testing::{server, FakeRegion, OWNER_UID};
    use cirrus_backend::scope::ProjectScope;

    fn owner() -> Owner {
        Owner::Cluster(OWNER_UID.to_string())
    }

    fn desired(name: &str, replicas: u32) -> DesiredPool {
        DesiredPool {
            name: name.to_string(),
            replicas,
            template: ServerTemplate {
                flavor_id: "f1".to_string(),
                image_id: "i1".to_string(),
                public_ip: false,
                allowed_address_pairs: vec![],
                user_data: None,
                disk_size_gib: None,
            },
            firewall: vec![],
        }
    }

    fn plan(servers: Vec<Server>, pools: &[DesiredPool], hint: &[String]) -> ServerPlan {
        let set = ServerSet::build(servers).unwrap();
        let owner = owner();
        let groups = BTreeMap::new();
        plan_servers(
            &set,
            pools,
            &PlanContext {
                owner: &owner,
                network_id: "net-1",
                security_groups: &groups,
                eviction_hint: hint,
            },
        )
    }

    fn names(creates: &[ServerWrite]) -> Vec<&str> {
        creates.iter().map(|c| c.name.as_str()).collect()
    }

    fn deleted(plan: &ServerPlan) -> Vec<&str> {
        plan.deletes.iter().map(|d| d.name.as_str()).collect()
    }

    mod server_set {
        use super::*;

        #[test]
        fn missing_pool_tag_is_inconsistent() {
            let mut s = server("s1", "web-0", "web", "f1", "i1");
            s.metadata.tags.retain(|t| t.name != cirrus_backend::tags::POOL_TAG);
            assert!(matches!(
                ServerSet::build(vec![s]),
                Err(Error::Consistency { .. })
            ));
        }

        #[test]
        fn duplicate_names_are_inconsistent() {
            let result = ServerSet::build(vec![
                server("s1", "web-0", "web", "f1", "i1"),
                server("s2", "web-0", "web", "f1", "i1"),
            ]);
            assert!(matches!(result, Err(Error::Consistency { .. })));
        }

        #[test]
        fn lookup_by_id() {
            let set = ServerSet::build(vec![
                server("s1", "web-0", "web", "f1", "i1"),
                server("s2", "db-0", "db", "f1", "i1"),
            ])
            .unwrap();
            assert_eq!(set.len(), 2);
            assert_eq!(set.find_by_id("s2").map(|(p, _)| p), Some("db"));
            assert!(set.find_by_id("s3").is_none());
        }
    }

    mod diff {
        use super::*;

        #[test]
        fn scale_up_fills_the_lowest_free_indices() {
            let p = plan(
                vec![
                    server("s0", "web-0", "web", "f1", "i1"),
                    server("s2", "web-2", "web", "f1", "i1"),
                ],
                &[desired("web", 5)],
                &[],
            );
            assert_eq!(names(&p.creates), vec!["web-1", "web-3", "web-4"]);
            assert!(p.deletes.is_empty());
        }

        #[test]
        fn scale_down_removes_the_highest_indices() {
            let servers = (0..5)
                .map(|i| server(&format!("s{i}"), &format!("web-{i}"), "web", "f1", "i1"))
                .collect();
            let p = plan(servers, &[desired("web", 2)], &[]);
            assert_eq!(deleted(&p), vec!["web-4", "web-3", "web-2"]);
            assert!(p.creates.is_empty());
            assert!(p.deletes.iter().all(|d| d.reason == DeleteReason::ScaleDown));
        }

        #[test]
        fn converged_pool_needs_nothing() {
            let p = plan(
                vec![
                    server("s0", "web-0", "web", "f1", "i1"),
                    server("s1", "web-1", "web", "f1", "i1"),
                ],
                &[desired("web", 2)],
                &[],
            );
            assert_eq!(p.changes(), 0);
            assert!(!p.needs_followup());
        }

        #[test]
        fn undeclared_pools_and_stray_names_are_deleted() {
            let p = plan(
                vec![
                    server("s0", "web-0", "web", "f1", "i1"),
                    server("s1", "web-01", "web", "f1", "i1"),
                    server("s2", "db-0", "db", "f1", "i1"),
                ],
                &[desired("web", 1)],
                &[],
            );
            let reasons: Vec<(&str, DeleteReason)> = p
                .deletes
                .iter()
                .map(|d| (d.name.as_str(), d.reason))
                .collect();
            assert_eq!(
                reasons,
                vec![
                    ("web-01", DeleteReason::NonCanonical),
                    ("db-0", DeleteReason::Undeclared),
                ]
            );
        }

        #[test]
        fn create_requests_carry_the_pool_configuration() {
            let mut pool = desired("web", 1);
            pool.template.public_ip = true;
            pool.template.disk_size_gib = Some(80);
            pool.template.allowed_address_pairs = vec![AllowedAddressPair {
                cidr: "10.1.0.0/24".to_string(),
                mac_address: None,
            }];

            let set = ServerSet::default();
            let owner = owner();
            let groups = BTreeMap::from([("web".to_string(), "sg-1".to_string())]);
            let p = plan_servers(
                &set,
                &[pool],
                &PlanContext {
                    owner: &owner,
                    network_id: "net-1",
                    security_groups: &groups,
                    eviction_hint: &[],
                },
            );

            let create = &p.creates[0];
            assert_eq!(create.spec.security_groups, vec!["sg-1"]);
            assert_eq!(create.spec.networks[0].id, "net-1");
            assert_eq!(create.spec.networks[0].allowed_address_pairs.len(), 1);
            assert_eq!(create.spec.disk_size_gib, Some(80));
            assert!(create.spec.public_ip);
            assert!(owner.owns(&create.tags));
            assert_eq!(pool_of(&create.tags), Some("web"));
        }
    }

    mod leaving {
        use super::*;

        #[test]
        fn evicted_servers_are_not_counted_or_replaced() {
            let servers: Vec<Server> = (0..5)
                .map(|i| server(&format!("s{i}"), &format!("web-{i}"), "web", "f1", "i1"))
                .collect();
            let hint = vec!["s1".to_string(), "s3".to_string()];

            let p = plan(servers, &[desired("web", 3)], &hint);
            assert_eq!(p.changes(), 0);
        }

        #[test]
        fn slot_held_by_a_deprovisioning_server_is_deferred() {
            let mut leaving = server("s1", "web-1", "web", "f1", "i1");
            leaving.metadata.provisioning_status = "deprovisioning".to_string();

            let p = plan(
                vec![server("s0", "web-0", "web", "f1", "i1"), leaving],
                &[desired("web", 3)],
                &[],
            );
            assert_eq!(names(&p.creates), vec!["web-2"]);
            assert_eq!(p.deferred, vec!["web-1"]);
            assert!(p.needs_followup());
        }
    }

    mod rebuild {
        use super::*;

        #[test]
        fn flavor_change_deletes_and_keeps_the_slot() {
            let p = plan(
                vec![
                    server("s0", "web-0", "web", "f0", "i1"),
                    server("s1", "web-1", "web", "f1", "i1"),
                ],
                &[desired("web", 2)],
                &[],
            );
            assert_eq!(deleted(&p), vec!["web-0"]);
            assert_eq!(p.deletes[0].reason, DeleteReason::Rebuild);
            assert!(p.creates.is_empty());
            assert!(p.needs_followup());
        }

        #[test]
        fn networking_change_updates_in_place() {
            let mut pool = desired("web", 1);
            pool.template.public_ip = true;
            pool.template.user_data = Some("I2Nsb3VkLWNvbmZpZw==".to_string());

            let mut existing = server("s0", "web-0", "web", "f1", "i1");
            existing.spec.disk_size_gib = Some(40);

            let p = plan(vec![existing], &[pool], &[]);
            assert!(p.deletes.is_empty());
            assert_eq!(p.updates.len(), 1);
            let update = &p.updates[0];
            assert_eq!(update.id, "s0");
            assert!(update.request.spec.public_ip);
            assert_eq!(update.request.spec.disk_size_gib, Some(40));
        }

        #[test]
        fn disk_size_alone_changes_nothing() {
            let mut pool = desired("web", 1);
            pool.template.disk_size_gib = Some(200);
            let p = plan(vec![server("s0", "web-0", "web", "f1", "i1")], &[pool], &[]);
            assert_eq!(p.changes(), 0);
        }

        #[test]
        fn address_pair_order_is_ignored() {
            let a = AllowedAddressPair {
                cidr: "10.1.0.0/24".to_string(),
                mac_address: None,
            };
            let b = AllowedAddressPair {
                cidr: "10.2.0.0/24".to_string(),
                mac_address: None,
            };
            let mut pool = desired("web", 1);
            pool.template.allowed_address_pairs = vec![a.clone(), b.clone()];

            let mut existing = server("s0", "web-0", "web", "f1", "i1");
            existing.spec.networks[0].allowed_address_pairs = vec![b, a];

            let p = plan(vec![existing], &[pool], &[]);
            assert_eq!(p.changes(), 0);
        }
    }

    mod apply {
        use super::*;

        fn scope() -> IdentityScope {
            ProjectScope::new("org", "proj").identity("id-1")
        }

        #[tokio::test]
        async fn deletes_run_before_updates_and_creates() {
            let region = FakeRegion::new();
            let mut existing = server("s0", "web-0", "web", "f1", "i1");
            existing.spec.public_ip = true;
            region.insert_server(existing);
            region.insert_server(server("sx", "web-x", "web", "f1", "i1"));

            let p = plan(region.servers(), &[desired("web", 2)], &[]);
            let applied = apply_plan(&region, &scope(), &p).await.unwrap();

            assert_eq!(applied, 3);
            assert_eq!(
                region.calls(),
                vec!["delete_server sx", "update_server s0", "create_server web-1"]
            );
        }

        #[tokio::test]
        async fn rebuild_yields_after_deleting() {
            let region = FakeRegion::new();
            region.insert_server(server("s0", "web-0", "web", "f0", "i1"));

            let p = plan(region.servers(), &[desired("web", 1)], &[]);
            let err = apply_plan(&region, &scope(), &p).await.unwrap_err();

            assert!(err.is_yield());
            assert_eq!(region.calls(), vec!["delete_server s0"]);
        }

        #[tokio::test]
        async fn failed_delete_surfaces_the_status_code() {
            let region = FakeRegion::new();
            region.insert_server(server("s1", "web-1", "web", "f1", "i1"));
            region.fail_on("delete_server s1", 500);

            let p = plan(region.servers(), &[desired("web", 0)], &[]);
            let err = apply_plan(&region, &scope(), &p).await.unwrap_err();
            assert!(matches!(err, Error::BackendStatus { code: 500, .. }));
        }
    }
}
