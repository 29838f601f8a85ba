use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::authz::{Grants, PermissionMatrix, RoleId};

// =============================================================================
// ROLE PERMISSIONS (server-of-record payloads)
// =============================================================================

/// Privileges granted on one module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleGrants {
    pub module: String,
    #[serde(default)]
    pub privileges: Vec<String>,
}

/// Body of `GET /api/roles/:role_id/permissions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolePermissionsResponse {
    pub role_id: RoleId,
    #[serde(default)]
    pub modules: Vec<ModuleGrants>,
}

impl RolePermissionsResponse {
    pub fn from_grants(role_id: RoleId, grants: &Grants) -> Self {
        let modules = grants
            .iter()
            .map(|(module, privileges)| ModuleGrants {
                module: module.clone(),
                privileges: privileges.iter().cloned().collect(),
            })
            .collect();
        Self { role_id, modules }
    }

    pub fn grants(&self) -> Grants {
        collect_grants(&self.modules)
    }

    pub fn into_matrix(self, fetched_at: DateTime<Utc>) -> PermissionMatrix {
        let grants = self.grants();
        PermissionMatrix::new(self.role_id, grants, fetched_at)
    }
}

/// Body of `PUT /api/roles/:role_id/permissions`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpdateRolePermissionsRequest {
    pub modules: Vec<ModuleGrants>,
}

impl UpdateRolePermissionsRequest {
    pub fn grants(&self) -> Grants {
        collect_grants(&self.modules)
    }
}

/// Seed file read by `permctl serve`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RoleSeedFile {
    #[serde(default)]
    pub roles: Vec<RolePermissionsResponse>,
}

/// Duplicate module entries are merged.
fn collect_grants(modules: &[ModuleGrants]) -> Grants {
    let mut grants = Grants::new();
    for entry in modules {
        grants
            .entry(entry.module.clone())
            .or_default()
            .extend(entry.privileges.iter().cloned());
    }
    grants
}
