//! Ownership tags on region resources
//!
//! Region resources carry name/value tags. The engine marks everything it
//! creates with the owning cluster or instance uid and, for pooled resources,
//! the pool name. This module is the only place tag keys are spelled out.

use serde::{Deserialize, Serialize};

/// Tag key carrying the owning cluster's uid
pub const CLUSTER_ID_TAG: &str = "cirrus.dev/cluster-id";

/// Tag key carrying the owning instance's uid
pub const INSTANCE_ID_TAG: &str = "cirrus.dev/instance-id";

/// Tag key carrying the workload pool name
pub const POOL_TAG: &str = "cirrus.dev/pool";

/// A name/value tag
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tag {
    /// Tag key
    pub name: String,
    /// Tag value
    pub value: String,
}

impl Tag {
    /// Create a tag
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Render as the `name=value` form used in list filters
    pub fn selector(&self) -> String {
        format!("{}={}", self.name, self.value)
    }
}

/// The object a region resource belongs to
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Owner {
    /// A compute cluster, by uid
    Cluster(String),
    /// A compute instance, by uid
    Instance(String),
}

impl Owner {
    /// The owner's uid
    pub fn id(&self) -> &str {
        match self {
            Self::Cluster(id) | Self::Instance(id) => id,
        }
    }

    /// Tag identifying resources owned by this object
    pub fn tag(&self) -> Tag {
        match self {
            Self::Cluster(id) => Tag::new(CLUSTER_ID_TAG, id.as_str()),
            Self::Instance(id) => Tag::new(INSTANCE_ID_TAG, id.as_str()),
        }
    }

    /// Whether `tags` mark a resource as owned by this object
    pub fn owns(&self, tags: &[Tag]) -> bool {
        let tag = self.tag();
        find(tags, &tag.name) == Some(tag.value.as_str())
    }
}

/// Value of the tag named `name`, if present
pub fn find<'a>(tags: &'a [Tag], name: &str) -> Option<&'a str> {
    tags.iter()
        .find(|t| t.name == name)
        .map(|t| t.value.as_str())
}

/// Pool a resource belongs to; an empty value counts as missing
pub fn pool_of(tags: &[Tag]) -> Option<&str> {
    find(tags, POOL_TAG).filter(|v| !v.is_empty())
}

/// Tags for a resource owned by `owner`, optionally scoped to a pool
pub fn ownership(owner: &Owner, pool: Option<&str>) -> Vec<Tag> {
    let mut tags = vec![owner.tag()];
    if let Some(pool) = pool {
        tags.push(Tag::new(POOL_TAG, pool));
    }
    tags
}
