use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Module name -> granted privilege names.
pub type Grants = BTreeMap<String, BTreeSet<String>>;

/// Identifier of a role as assigned by the login flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleId(pub u64);

impl fmt::Display for RoleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for RoleId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// A single `(module, privilege)` grant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PermissionGrant {
    pub module: String,
    pub privilege: String,
}

impl fmt::Display for PermissionGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module, self.privilege)
    }
}

/// Complete grant set for one role at one point in time.
///
/// Never mutated after construction; the store swaps whole matrices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionMatrix {
    role_id: RoleId,
    grants: Grants,
    fetched_at: DateTime<Utc>,
}

impl PermissionMatrix {
    /// Builds a matrix, dropping unknown privileges and modules left with
    /// nothing granted.
    pub fn new(role_id: RoleId, grants: Grants, fetched_at: DateTime<Utc>) -> Self {
        let mut normalized = Grants::new();
        for (module, privileges) in grants {
            let known: BTreeSet<String> = privileges
                .into_iter()
                .filter(|privilege| {
                    let keep = super::is_known_privilege(privilege);
                    if !keep {
                        tracing::warn!(
                            role_id = %role_id,
                            module = %module,
                            privilege = %privilege,
                            "ignoring unknown privilege"
                        );
                    }
                    keep
                })
                .collect();
            if !known.is_empty() {
                normalized.insert(module, known);
            }
        }

        Self {
            role_id,
            grants: normalized,
            fetched_at,
        }
    }

    /// Convenience constructor from `(module, [privileges])` pairs.
    pub fn from_pairs<M, P, I>(role_id: RoleId, pairs: impl IntoIterator<Item = (M, I)>) -> Self
    where
        M: Into<String>,
        P: Into<String>,
        I: IntoIterator<Item = P>,
    {
        let grants = pairs
            .into_iter()
            .map(|(module, privileges)| {
                (
                    module.into(),
                    privileges.into_iter().map(Into::into).collect(),
                )
            })
            .collect();
        Self::new(role_id, grants, crate::utils::utc_now())
    }

    pub fn role_id(&self) -> RoleId {
        self.role_id
    }

    pub fn grants(&self) -> &Grants {
        &self.grants
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    pub fn has_module_access(&self, module: &str) -> bool {
        self.grants
            .get(module)
            .map(|privileges| !privileges.is_empty())
            .unwrap_or(false)
    }

    pub fn has_privilege(&self, module: &str, privilege: &str) -> bool {
        self.grants
            .get(module)
            .map(|privileges| privileges.contains(privilege))
            .unwrap_or(false)
    }

    /// OR semantics; an empty list grants nothing.
    pub fn has_any_privilege<S: AsRef<str>>(&self, module: &str, privileges: &[S]) -> bool {
        privileges
            .iter()
            .any(|privilege| self.has_privilege(module, privilege.as_ref()))
    }

    /// AND semantics; an empty list grants nothing.
    pub fn has_all_privileges<S: AsRef<str>>(&self, module: &str, privileges: &[S]) -> bool {
        !privileges.is_empty()
            && privileges
                .iter()
                .all(|privilege| self.has_privilege(module, privilege.as_ref()))
    }

    /// Modules with at least one granted privilege, in lexicographic order.
    pub fn accessible_modules(&self) -> Vec<String> {
        self.grants.keys().cloned().collect()
    }

    pub fn grant_list(&self) -> Vec<PermissionGrant> {
        self.grants
            .iter()
            .flat_map(|(module, privileges)| {
                privileges.iter().map(move |privilege| PermissionGrant {
                    module: module.clone(),
                    privilege: privilege.clone(),
                })
            })
            .collect()
    }

    /// Value equality of role and grants, ignoring when either was fetched.
    pub fn same_grants(&self, other: &PermissionMatrix) -> bool {
        self.role_id == other.role_id && self.grants == other.grants
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::{modules, privileges, ALL_PRIVILEGES};

    fn sample() -> PermissionMatrix {
        PermissionMatrix::from_pairs(
            RoleId(7),
            vec![
                (modules::CLIENTES, vec![privileges::READ, privileges::CREATE]),
                (modules::CONTRATOS, vec![]),
            ],
        )
    }

    #[test]
    fn test_empty_modules_are_dropped() {
        let matrix = sample();
        assert!(matrix.has_module_access(modules::CLIENTES));
        assert!(!matrix.has_module_access(modules::CONTRATOS));
        assert_eq!(matrix.accessible_modules(), vec![modules::CLIENTES.to_string()]);
    }

    #[test]
    fn test_unknown_privileges_are_dropped() {
        let matrix = PermissionMatrix::from_pairs(RoleId(1), vec![(modules::PAGOS, vec!["EXPORT"])]);
        assert!(!matrix.has_module_access(modules::PAGOS));
        assert!(matrix.grants().is_empty());
    }

    #[test]
    fn test_empty_privilege_lists_never_grant() {
        let matrix = sample();
        let none: [&str; 0] = [];
        assert!(!matrix.has_any_privilege(modules::CLIENTES, &none));
        assert!(!matrix.has_all_privileges(modules::CLIENTES, &none));
    }

    #[test]
    fn test_any_and_all_semantics() {
        let matrix = sample();
        assert!(matrix.has_any_privilege(modules::CLIENTES, &[privileges::DELETE, privileges::READ]));
        assert!(!matrix.has_all_privileges(modules::CLIENTES, &[privileges::DELETE, privileges::READ]));
        assert!(matrix.has_all_privileges(modules::CLIENTES, &[privileges::CREATE, privileges::READ]));
        for module in [modules::CLIENTES, modules::CONTRATOS, modules::ROLES] {
            assert_eq!(
                matrix.has_module_access(module),
                matrix.has_any_privilege(module, &ALL_PRIVILEGES)
            );
        }
    }

    #[test]
    fn test_same_grants_ignores_fetch_time() {
        let a = sample();
        let b = PermissionMatrix::new(a.role_id(), a.grants().clone(), a.fetched_at() + chrono::Duration::seconds(30));
        assert!(a.same_grants(&b));

        let c = PermissionMatrix::from_pairs(RoleId(7), vec![(modules::CLIENTES, vec![privileges::READ])]);
        assert!(!a.same_grants(&c));
    }

    #[test]
    fn test_grant_list_is_flat() {
        let list = sample().grant_list();
        let rendered: Vec<String> = list.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["CLIENTES:CREATE", "CLIENTES:READ"]);
    }
}
