//! Tenant scoping.
//!
//! Every tenant-facing read and write is filtered by a [`Scope`]. Worker
//! processes serve all organizations, so the claim queries run unscoped and
//! the writes that follow are scoped to the claimed row's organization.

use serde::{Deserialize, Serialize};

use crate::id::OrganizationId;

/// Restricts storage access to the rows a caller may see.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Rows of a single organization.
    Organization(OrganizationId),
    /// Every row, regardless of organization. Reserved for system workers.
    Global,
}

impl Scope {
    pub fn organization(organization_id: OrganizationId) -> Self {
        Self::Organization(organization_id)
    }

    /// The organization filter to bind into a query, `None` when unrestricted.
    ///
    /// Queries use it as `($n::uuid IS NULL OR organization_id = $n)`.
    pub fn organization_filter(&self) -> Option<uuid::Uuid> {
        match self {
            Scope::Organization(id) => Some(*id.as_uuid()),
            Scope::Global => None,
        }
    }

    /// Whether a row owned by `organization_id` is visible in this scope.
    pub fn contains(&self, organization_id: OrganizationId) -> bool {
        match self {
            Scope::Organization(id) => *id == organization_id,
            Scope::Global => true,
        }
    }
}

impl From<OrganizationId> for Scope {
    fn from(value: OrganizationId) -> Self {
        Self::Organization(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn organization_scope_only_contains_its_own_rows() {
        let mine = OrganizationId::new();
        let other = OrganizationId::new();
        let scope = Scope::organization(mine);

        assert!(scope.contains(mine));
        assert!(!scope.contains(other));
        assert_eq!(scope.organization_filter(), Some(*mine.as_uuid()));
    }

    #[test]
    fn global_scope_contains_everything() {
        assert!(Scope::Global.contains(OrganizationId::new()));
        assert_eq!(Scope::Global.organization_filter(), None);
    }
}
