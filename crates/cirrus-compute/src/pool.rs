//! Desired pool shapes and deterministic server naming
//!
//! A pool of N servers owns the names `{pool}-{i}`. Image selectors are
//! resolved once per pass so that every server in a pool compares against
//! the same image ID.

use cirrus_backend::region::{Image, RegionApi};
use cirrus_common::crd::{AllowedAddressPair, FirewallRule, ImageSelector, WorkloadPoolSpec};
use cirrus_common::{Error, Result};

/// Server configuration shared by every member of a pool
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerTemplate {
    /// Flavor ID
    pub flavor_id: String,
    /// Resolved image ID
    pub image_id: String,
    /// Allocate a public IP
    pub public_ip: bool,
    /// Extra addresses, sorted
    pub allowed_address_pairs: Vec<AllowedAddressPair>,
    /// Base64 cloud-init payload
    pub user_data: Option<String>,
    /// Root disk size; sent on create only
    pub disk_size_gib: Option<u32>,
}

/// A workload pool with its image resolved
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DesiredPool {
    /// Pool name
    pub name: String,
    /// Number of servers
    pub replicas: u32,
    /// Server configuration
    pub template: ServerTemplate,
    /// Firewall rules; non-empty means the pool gets a security group
    pub firewall: Vec<FirewallRule>,
}

impl DesiredPool {
    /// Whether the pool needs a security group
    pub fn wants_security_group(&self) -> bool {
        !self.firewall.is_empty()
    }
}

/// Name of server `index` in `pool`
pub fn server_name(pool: &str, index: u32) -> String {
    format!("{}-{}", pool, index)
}

/// Index encoded in `name` if it is a canonical member name of `pool`
///
/// `web-01` and `web-x` are not canonical and return `None`.
pub fn parse_index(pool: &str, name: &str) -> Option<u32> {
    let suffix = name.strip_prefix(pool)?.strip_prefix('-')?;
    let index: u32 = suffix.parse().ok()?;
    (index.to_string() == suffix).then_some(index)
}

/// Newest image matching `selector`
pub fn select_image(images: &[Image], selector: &ImageSelector) -> Option<String> {
    images
        .iter()
        .filter(|image| image.os.distro == selector.distro)
        .filter(|image| {
            selector
                .version
                .as_ref()
                .map_or(true, |v| &image.os.version == v)
        })
        .max_by_key(|image| image.created)
        .map(|image| image.id.clone())
}

/// Resolve image references and normalize each pool into a [`DesiredPool`]
///
/// The region's image list is only fetched when some pool uses a selector.
pub async fn resolve_pools(
    region: &dyn RegionApi,
    organization_id: &str,
    region_id: &str,
    pools: &[WorkloadPoolSpec],
) -> Result<Vec<DesiredPool>> {
    let images = if pools.iter().any(|p| p.image.selector.is_some()) {
        region.list_images(organization_id, region_id).await?
    } else {
        Vec::new()
    };

    pools
        .iter()
        .map(|pool| {
            let image_id = match (&pool.image.id, &pool.image.selector) {
                (Some(id), _) => id.clone(),
                (None, Some(selector)) => select_image(&images, selector).ok_or_else(|| {
                    Error::validation_for_field(
                        pool.name.as_str(),
                        "image.selector",
                        format!(
                            "no image matches distro {} version {}",
                            selector.distro,
                            selector.version.as_deref().unwrap_or("any")
                        ),
                    )
                })?,
                (None, None) => {
                    return Err(Error::validation_for_field(
                        pool.name.as_str(),
                        "image",
                        "image requires an id or a selector",
                    ))
                }
            };

            let mut allowed_address_pairs = pool.allowed_address_pairs.clone();
            allowed_address_pairs.sort();

            Ok(DesiredPool {
                name: pool.name.clone(),
                replicas: pool.replicas,
                template: ServerTemplate {
                    flavor_id: pool.flavor_id.clone(),
                    image_id,
                    public_ip: pool.public_ip,
                    allowed_address_pairs,
                    user_data: pool.user_data.clone(),
                    disk_size_gib: pool.disk_size_gib,
                },
                firewall: pool.firewall.clone(),
            })
        })
        .collect()
}
