use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use super::PermissionFetcher;
use crate::authz::{Grants, PermissionMatrix, RoleId};
use crate::errors::{PermissionError, PermissionResult};
use crate::utils::utc_now;

#[derive(Debug, Clone)]
enum Failure {
    Once(String),
    Always(String),
}

/// In-memory server-of-record.
///
/// Grants can be edited at any time to play the part of an administrator
/// changing a role, and latency or failures can be injected per call.
#[derive(Debug, Default)]
pub struct MemoryPermissionFetcher {
    roles: RwLock<HashMap<RoleId, Grants>>,
    latency: RwLock<Duration>,
    role_latency: RwLock<HashMap<RoleId, Duration>>,
    failure: Mutex<Option<Failure>>,
    answer_as: Mutex<Option<RoleId>>,
    calls: AtomicUsize,
    calls_by_role: Mutex<HashMap<RoleId, usize>>,
}

impl MemoryPermissionFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_role<M, P, I>(self, role_id: RoleId, pairs: impl IntoIterator<Item = (M, I)>) -> Self
    where
        M: Into<String>,
        P: Into<String>,
        I: IntoIterator<Item = P>,
    {
        self.set_role(role_id, pairs);
        self
    }

    /// Replaces every grant of `role_id`.
    pub fn set_role<M, P, I>(&self, role_id: RoleId, pairs: impl IntoIterator<Item = (M, I)>)
    where
        M: Into<String>,
        P: Into<String>,
        I: IntoIterator<Item = P>,
    {
        let grants: Grants = pairs
            .into_iter()
            .map(|(module, privileges)| {
                (
                    module.into(),
                    privileges.into_iter().map(Into::into).collect(),
                )
            })
            .collect();
        self.set_grants(role_id, grants);
    }

    pub fn set_grants(&self, role_id: RoleId, grants: Grants) {
        self.roles.write().insert(role_id, grants);
    }

    pub fn grant(&self, role_id: RoleId, module: &str, privilege: &str) {
        self.roles
            .write()
            .entry(role_id)
            .or_default()
            .entry(module.to_string())
            .or_default()
            .insert(privilege.to_string());
    }

    pub fn revoke(&self, role_id: RoleId, module: &str, privilege: &str) {
        if let Some(privileges) = self
            .roles
            .write()
            .get_mut(&role_id)
            .and_then(|grants| grants.get_mut(module))
        {
            privileges.remove(privilege);
        }
    }

    pub fn remove_role(&self, role_id: RoleId) {
        self.roles.write().remove(&role_id);
    }

    /// Delay applied to every call.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = latency;
    }

    /// Delay applied to calls for one role, overriding the global one.
    pub fn set_role_latency(&self, role_id: RoleId, latency: Duration) {
        self.role_latency.write().insert(role_id, latency);
    }

    pub fn fail_next(&self, message: impl Into<String>) {
        *self.failure.lock() = Some(Failure::Once(message.into()));
    }

    pub fn fail_always(&self, message: impl Into<String>) {
        *self.failure.lock() = Some(Failure::Always(message.into()));
    }

    pub fn stop_failing(&self) {
        *self.failure.lock() = None;
    }

    /// Makes every response claim to be for `role_id`, as a misbehaving
    /// server would.
    pub fn answer_as(&self, role_id: RoleId) {
        *self.answer_as.lock() = Some(role_id);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, role_id: RoleId) -> usize {
        self.calls_by_role.lock().get(&role_id).copied().unwrap_or(0)
    }

    fn take_failure(&self) -> Option<String> {
        let mut failure = self.failure.lock();
        match failure.clone() {
            Some(Failure::Once(message)) => {
                *failure = None;
                Some(message)
            }
            Some(Failure::Always(message)) => Some(message),
            None => None,
        }
    }
}

#[async_trait]
impl PermissionFetcher for MemoryPermissionFetcher {
    async fn fetch_permissions(&self, role_id: RoleId) -> PermissionResult<PermissionMatrix> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.calls_by_role.lock().entry(role_id).or_default() += 1;

        let latency = self
            .role_latency
            .read()
            .get(&role_id)
            .copied()
            .unwrap_or_else(|| *self.latency.read());
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        // grants are read after the delay so edits made meanwhile are visible
        if let Some(message) = self.take_failure() {
            return Err(PermissionError::fetch(message));
        }

        let grants = self
            .roles
            .read()
            .get(&role_id)
            .cloned()
            .ok_or_else(|| PermissionError::fetch(format!("role {role_id} not found")))?;
        let answered_for = (*self.answer_as.lock()).unwrap_or(role_id);

        Ok(PermissionMatrix::new(answered_for, grants, utc_now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::{modules, privileges};

    #[tokio::test]
    async fn test_edits_are_visible_to_next_fetch() {
        let fetcher = MemoryPermissionFetcher::new().with_role(
            RoleId(7),
            vec![(modules::CLIENTES, vec![privileges::READ, privileges::DELETE])],
        );

        let before = fetcher.fetch_permissions(RoleId(7)).await.unwrap();
        assert!(before.has_privilege(modules::CLIENTES, privileges::DELETE));

        fetcher.revoke(RoleId(7), modules::CLIENTES, privileges::DELETE);
        fetcher.grant(RoleId(7), modules::HORARIOS, privileges::READ);
        let after = fetcher.fetch_permissions(RoleId(7)).await.unwrap();
        assert!(!after.has_privilege(modules::CLIENTES, privileges::DELETE));
        assert!(after.has_privilege(modules::HORARIOS, privileges::READ));
        assert_eq!(fetcher.call_count(), 2);
        assert_eq!(fetcher.calls_for(RoleId(7)), 2);
    }

    #[tokio::test]
    async fn test_fail_next_only_fails_once() {
        let fetcher = MemoryPermissionFetcher::new().with_role(RoleId(1), vec![(modules::PAGOS, vec![privileges::READ])]);
        fetcher.fail_next("boom");

        assert!(fetcher.fetch_permissions(RoleId(1)).await.is_err());
        assert!(fetcher.fetch_permissions(RoleId(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_role_is_a_fetch_failure() {
        let fetcher = MemoryPermissionFetcher::new();
        let err = fetcher.fetch_permissions(RoleId(3)).await.unwrap_err();
        assert_eq!(err, PermissionError::fetch("role 3 not found"));
    }
}
