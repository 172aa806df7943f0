//! Request scoping shared by both backends

/// Organization and project a request acts within
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProjectScope {
    /// Organization ID
    pub organization_id: String,
    /// Project ID
    pub project_id: String,
}

impl ProjectScope {
    /// Create a scope
    pub fn new(organization_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            organization_id: organization_id.into(),
            project_id: project_id.into(),
        }
    }

    /// Narrow to resources owned by a region identity
    pub fn identity(&self, identity_id: impl Into<String>) -> IdentityScope {
        IdentityScope {
            organization_id: self.organization_id.clone(),
            project_id: self.project_id.clone(),
            identity_id: identity_id.into(),
        }
    }

    pub(crate) fn path(&self) -> String {
        format!(
            "/api/v1/organizations/{}/projects/{}",
            self.organization_id, self.project_id
        )
    }
}

/// A region identity within a project
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityScope {
    /// Organization ID
    pub organization_id: String,
    /// Project ID
    pub project_id: String,
    /// Region identity ID
    pub identity_id: String,
}

impl IdentityScope {
    pub(crate) fn path(&self) -> String {
        format!(
            "/api/v1/organizations/{}/projects/{}/identities/{}",
            self.organization_id, self.project_id, self.identity_id
        )
    }
}

/// Result of a delete request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Deletion registered; completion is asynchronous
    Accepted,
    /// Nothing to delete
    NotFound,
}
