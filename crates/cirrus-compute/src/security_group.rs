//! Security group reconciliation
//!
//! Each pool with firewall rules owns exactly one security group, found by
//! its pool tag. Rules compare structurally after expanding every firewall
//! rule into one backend rule per prefix; order and tags are ignored.
//!
//! Creates and updates run before servers are reconciled so new servers can
//! reference their group. Deletes run afterwards, once no server in a
//! removed pool still references the group.

use std::collections::BTreeMap;

use tracing::info;

use cirrus_backend::region::{
    PortSpec, RegionApi, SecurityGroup, SecurityGroupRule, SecurityGroupWrite,
};
use cirrus_backend::scope::IdentityScope;
use cirrus_backend::tags::{ownership, pool_of, Owner};
use cirrus_common::crd::FirewallRule;
use cirrus_common::{Error, Result};

use crate::pool::DesiredPool;

/// Expand firewall rules into sorted, deduplicated backend rules
pub fn expand_rules(rules: &[FirewallRule]) -> Vec<SecurityGroupRule> {
    let mut expanded: Vec<SecurityGroupRule> = rules
        .iter()
        .flat_map(|rule| {
            let port = match rule.port_max {
                Some(end) if end != rule.port => PortSpec::Range {
                    start: rule.port,
                    end,
                },
                _ => PortSpec::Number(rule.port),
            };
            rule.prefixes.iter().map(move |prefix| SecurityGroupRule {
                direction: rule.direction,
                protocol: rule.protocol,
                port,
                prefix: prefix.clone(),
            })
        })
        .collect();
    expanded.sort();
    expanded.dedup();
    expanded
}

/// Existing security groups by pool
#[derive(Clone, Debug, Default)]
pub struct SecurityGroupSet {
    groups: BTreeMap<String, SecurityGroup>,
}

impl SecurityGroupSet {
    /// Index a backend listing; a missing or repeated pool tag is inconsistent
    pub fn build(groups: Vec<SecurityGroup>) -> Result<Self> {
        let mut by_pool = BTreeMap::new();
        for group in groups {
            let pool = pool_of(&group.metadata.tags)
                .ok_or_else(|| {
                    Error::consistency(
                        format!("security group {}", group.metadata.id),
                        "missing pool tag",
                    )
                })?
                .to_string();
            if by_pool.contains_key(&pool) {
                return Err(Error::consistency(
                    format!("pool {}", pool),
                    "more than one security group",
                ));
            }
            by_pool.insert(pool, group);
        }
        Ok(Self { groups: by_pool })
    }

    /// Group owned by `pool`
    pub fn get(&self, pool: &str) -> Option<&SecurityGroup> {
        self.groups.get(pool)
    }
}

/// A group to create or replace
#[derive(Clone, Debug, PartialEq)]
pub struct GroupWrite {
    /// Pool the group belongs to
    pub pool: String,
    /// Existing group ID for updates
    pub id: Option<String>,
    /// Request body
    pub request: SecurityGroupWrite,
}

/// Mutations converging security groups
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SecurityGroupPlan {
    /// Groups to create or update
    pub writes: Vec<GroupWrite>,
    /// IDs of groups whose pool no longer wants one
    pub deletes: Vec<String>,
    /// Group ID per pool for groups that are kept as they are
    pub unchanged: BTreeMap<String, String>,
}

impl SecurityGroupPlan {
    /// Number of backend mutations
    pub fn changes(&self) -> usize {
        self.writes.len() + self.deletes.len()
    }
}

/// Diff the existing groups against the pools' firewall rules
pub fn plan_security_groups(
    current: &SecurityGroupSet,
    pools: &[DesiredPool],
    owner: &Owner,
    group_name: &dyn Fn(&str) -> String,
) -> SecurityGroupPlan {
    let mut plan = SecurityGroupPlan::default();

    for pool in pools.iter().filter(|p| p.wants_security_group()) {
        let rules = expand_rules(&pool.firewall);
        let existing = current.get(&pool.name);

        if let Some(group) = existing {
            let mut have = group.rules.clone();
            have.sort();
            have.dedup();
            if have == rules {
                plan.unchanged
                    .insert(pool.name.clone(), group.metadata.id.clone());
                continue;
            }
        }

        plan.writes.push(GroupWrite {
            pool: pool.name.clone(),
            id: existing.map(|g| g.metadata.id.clone()),
            request: SecurityGroupWrite {
                name: group_name(&pool.name),
                tags: ownership(owner, Some(&pool.name)),
                rules,
            },
        });
    }

    for (pool, group) in &current.groups {
        let wanted = pools
            .iter()
            .any(|p| &p.name == pool && p.wants_security_group());
        if !wanted {
            plan.deletes.push(group.metadata.id.clone());
        }
    }

    plan
}

/// Issue the plan's creates and updates
///
/// Returns the group ID of every pool that has one.
pub async fn apply_writes(
    region: &dyn RegionApi,
    scope: &IdentityScope,
    plan: &SecurityGroupPlan,
) -> Result<BTreeMap<String, String>> {
    let mut groups = plan.unchanged.clone();

    for write in &plan.writes {
        let group = match &write.id {
            Some(id) => {
                info!(group = %write.request.name, id = %id, "updating security group rules");
                region.update_security_group(scope, id, &write.request).await?
            }
            None => {
                info!(group = %write.request.name, "creating security group");
                region.create_security_group(scope, &write.request).await?
            }
        };
        groups.insert(write.pool.clone(), group.metadata.id);
    }

    Ok(groups)
}

/// Issue the plan's deletes; a group already gone counts as deleted
pub async fn apply_deletes(
    region: &dyn RegionApi,
    scope: &IdentityScope,
    plan: &SecurityGroupPlan,
) -> Result<()> {
    for id in &plan.deletes {
        info!(id = %id, "deleting security group");
        region.delete_security_group(scope, id).await?;
    }
    Ok(())
}
