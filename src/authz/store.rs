use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::oneshot;

use super::listeners::{ListenerGuard, ListenerId, ListenerRegistry, StoreTransition};
use super::matrix::{PermissionGrant, PermissionMatrix, RoleId};
use crate::errors::{PermissionError, PermissionResult};
use crate::fetcher::PermissionFetcher;

const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreStatus {
    Uninitialized,
    Loading,
    Ready,
    Error,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Upper bound for a single fetcher call; exceeding it counts as a fetch failure.
    pub fetch_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }
}

/// Consistent copy of the store state taken under a single read lock.
#[derive(Debug, Clone)]
pub struct StoreView {
    pub status: StoreStatus,
    pub active_role: Option<RoleId>,
    pub matrix: Option<Arc<PermissionMatrix>>,
    pub last_error: Option<String>,
    pub permissions_version: u64,
}

impl StoreView {
    /// The matrix, but only when queries are allowed to see it.
    pub fn ready_matrix(&self) -> Option<&PermissionMatrix> {
        match self.status {
            StoreStatus::Ready => self.matrix.as_deref(),
            _ => None,
        }
    }
}

/// Diagnostic dump returned by [`PermissionStore::debug_permissions`].
#[derive(Debug, Clone, Serialize)]
pub struct PermissionsDebugDump {
    pub status: StoreStatus,
    pub active_role: Option<RoleId>,
    pub last_error: Option<String>,
    pub version: u64,
    pub permissions_version: u64,
    pub in_flight_role: Option<RoleId>,
    pub listener_count: usize,
    pub matrix: Option<PermissionMatrix>,
}

type SharedOutcome = Shared<BoxFuture<'static, PermissionResult<()>>>;

struct InFlight {
    role_id: RoleId,
    seq: u64,
    forced: bool,
    outcome: SharedOutcome,
    /// Every caller whose request this fetch now answers, including callers
    /// of an earlier same-role request it superseded.
    waiters: Vec<oneshot::Sender<PermissionResult<()>>>,
}

/// Answers the callers of a fetch that can no longer commit.
fn resolve_stale(in_flight: InFlight, active: Option<RoleId>) {
    tracing::debug!(role_id = %in_flight.role_id, seq = in_flight.seq, "abandoning in-flight permission fetch");
    let err = PermissionError::stale(in_flight.role_id, active);
    for waiter in in_flight.waiters {
        let _ = waiter.send(Err(err.clone()));
    }
}

struct StoreState {
    status: StoreStatus,
    matrix: Option<Arc<PermissionMatrix>>,
    last_error: Option<String>,
    active_role: Option<RoleId>,
    /// Bumped on every status transition.
    version: u64,
    /// Bumped whenever the installed matrix changes.
    permissions_version: u64,
    /// Sequence number of the newest fetch request; only its result may commit.
    latest_seq: u64,
    in_flight: Option<InFlight>,
}

impl StoreState {
    fn new() -> Self {
        Self {
            status: StoreStatus::Uninitialized,
            matrix: None,
            last_error: None,
            active_role: None,
            version: 0,
            permissions_version: 0,
            latest_seq: 0,
            in_flight: None,
        }
    }

    fn is_ready_for(&self, role_id: RoleId) -> bool {
        self.status == StoreStatus::Ready
            && self.active_role == Some(role_id)
            && self
                .matrix
                .as_ref()
                .map(|matrix| matrix.role_id() == role_id)
                .unwrap_or(false)
    }

    fn transition_to(&mut self, next: StoreStatus) -> Option<StoreTransition> {
        if self.status == next {
            return None;
        }
        let from = self.status;
        self.status = next;
        self.version += 1;
        Some(StoreTransition {
            from,
            to: next,
            version: self.version,
        })
    }

    fn replace_matrix(&mut self, matrix: Option<Arc<PermissionMatrix>>) {
        if self.matrix.is_none() && matrix.is_none() {
            return;
        }
        self.matrix = matrix;
        self.permissions_version += 1;
    }
}

struct StoreInner {
    fetcher: Arc<dyn PermissionFetcher>,
    config: StoreConfig,
    state: RwLock<StoreState>,
    listeners: Arc<ListenerRegistry>,
}

/// Process-wide cache of the current role's permission matrix.
///
/// Queries never block on I/O and deny everything unless the store is
/// `Ready`. Cloning is cheap and every clone shares the same state.
#[derive(Clone)]
pub struct PermissionStore {
    inner: Arc<StoreInner>,
}

impl PermissionStore {
    pub fn new(fetcher: Arc<dyn PermissionFetcher>, config: StoreConfig) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                fetcher,
                config,
                state: RwLock::new(StoreState::new()),
                listeners: Arc::new(ListenerRegistry::default()),
            }),
        }
    }

    /// Loads permissions for `role_id` unless they are already ready.
    ///
    /// Concurrent calls for the same role share one fetch. Failures are
    /// recorded in the store (see [`last_error`](Self::last_error)) and also
    /// returned to the caller.
    pub async fn initialize(&self, role_id: RoleId) -> PermissionResult<()> {
        self.initialize_with(role_id, false).await
    }

    /// Forces a fresh fetch for `role_id`, superseding any normal load in flight.
    pub async fn reload(&self, role_id: RoleId) -> PermissionResult<()> {
        self.initialize_with(role_id, true).await
    }

    pub async fn initialize_with(&self, role_id: RoleId, force_reload: bool) -> PermissionResult<()> {
        let (outcome, transition) = {
            let mut state = self.inner.state.write();
            if !force_reload && state.is_ready_for(role_id) {
                return Ok(());
            }

            let joinable = state
                .in_flight
                .as_ref()
                .filter(|in_flight| in_flight.role_id == role_id && (in_flight.forced || !force_reload))
                .map(|in_flight| in_flight.outcome.clone());

            match joinable {
                Some(outcome) => {
                    tracing::debug!(role_id = %role_id, "joining in-flight permission fetch");
                    (outcome, None)
                }
                None => {
                    state.latest_seq += 1;
                    let seq = state.latest_seq;

                    let (sender, receiver) = oneshot::channel();
                    let mut waiters = vec![sender];
                    if let Some(previous) = state.in_flight.take() {
                        if previous.role_id == role_id {
                            // same role: earlier callers wait for this fetch instead
                            waiters.extend(previous.waiters);
                        } else {
                            resolve_stale(previous, Some(role_id));
                        }
                    }

                    if state.active_role != Some(role_id) {
                        state.replace_matrix(None);
                        state.last_error = None;
                    }
                    state.active_role = Some(role_id);

                    let outcome = receiver
                        .map(|received| {
                            received.unwrap_or_else(|_| {
                                Err(PermissionError::fetch("permission fetch task ended unexpectedly"))
                            })
                        })
                        .boxed()
                        .shared();
                    state.in_flight = Some(InFlight {
                        role_id,
                        seq,
                        forced: force_reload,
                        outcome: outcome.clone(),
                        waiters,
                    });
                    let transition = state.transition_to(StoreStatus::Loading);
                    drop(state);

                    tracing::debug!(role_id = %role_id, seq, force_reload, "fetching permissions");
                    self.spawn_fetch(role_id, seq);
                    (outcome, transition)
                }
            }
        };

        if let Some(transition) = transition {
            self.inner.listeners.notify(&transition);
        }
        outcome.await
    }

    /// The fetch runs detached so that it still commits when every caller
    /// awaiting it has gone away.
    fn spawn_fetch(&self, role_id: RoleId, seq: u64) {
        let store = self.clone();
        tokio::spawn(async move {
            let fetched = AssertUnwindSafe(store.fetch_user_permissions(role_id))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(PermissionError::fetch("permission fetcher panicked")));
            store.commit(role_id, seq, fetched);
        });
    }

    fn commit(&self, role_id: RoleId, seq: u64, fetched: PermissionResult<PermissionMatrix>) {
        let (waiters, outcome, transition) = {
            let mut state = self.inner.state.write();
            let in_flight = match state.in_flight.take() {
                Some(in_flight) if in_flight.seq == seq => in_flight,
                other => {
                    state.in_flight = other;
                    tracing::debug!(
                        role_id = %role_id,
                        seq,
                        latest_seq = state.latest_seq,
                        "discarding superseded permission response"
                    );
                    return;
                }
            };

            let fetched = fetched.and_then(|matrix| {
                if matrix.role_id() == role_id {
                    Ok(matrix)
                } else {
                    Err(PermissionError::fetch(format!(
                        "server answered for role {} instead of role {}",
                        matrix.role_id(),
                        role_id
                    )))
                }
            });

            match fetched {
                Ok(matrix) => {
                    tracing::info!(
                        role_id = %role_id,
                        modules = matrix.grants().len(),
                        "permissions loaded"
                    );
                    state.replace_matrix(Some(Arc::new(matrix)));
                    state.last_error = None;
                    (in_flight.waiters, Ok(()), state.transition_to(StoreStatus::Ready))
                }
                Err(err) => {
                    let stale_available = state
                        .matrix
                        .as_ref()
                        .map(|matrix| matrix.role_id() == role_id)
                        .unwrap_or(false);
                    tracing::warn!(
                        role_id = %role_id,
                        error = %err,
                        stale_available,
                        "permission fetch failed"
                    );
                    state.last_error = Some(err.to_string());
                    let next = if stale_available {
                        StoreStatus::Ready
                    } else {
                        StoreStatus::Error
                    };
                    (in_flight.waiters, Err(err), state.transition_to(next))
                }
            }
        };

        if let Some(transition) = transition {
            self.inner.listeners.notify(&transition);
        }
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    /// Fetches the server's current matrix without touching the store.
    ///
    /// Used for drift detection; subject to the configured fetch timeout.
    pub async fn fetch_user_permissions(&self, role_id: RoleId) -> PermissionResult<PermissionMatrix> {
        let timeout = self.inner.config.fetch_timeout;
        match tokio::time::timeout(timeout, self.inner.fetcher.fetch_permissions(role_id)).await {
            Ok(fetched) => fetched,
            Err(_) => Err(PermissionError::fetch(format!("timed out after {timeout:?}"))),
        }
    }

    /// Back to `Uninitialized`, e.g. on logout. Fetches still in flight can
    /// no longer commit.
    pub fn reset(&self) {
        let transition = {
            let mut state = self.inner.state.write();
            state.latest_seq += 1;
            if let Some(in_flight) = state.in_flight.take() {
                resolve_stale(in_flight, None);
            }
            state.active_role = None;
            state.last_error = None;
            state.replace_matrix(None);
            state.transition_to(StoreStatus::Uninitialized)
        };
        tracing::info!("permission store reset");

        if let Some(transition) = transition {
            self.inner.listeners.notify(&transition);
        }
    }

    pub fn status(&self) -> StoreStatus {
        self.inner.state.read().status
    }

    pub fn is_ready(&self) -> bool {
        self.status() == StoreStatus::Ready
    }

    pub fn is_ready_for(&self, role_id: RoleId) -> bool {
        self.inner.state.read().is_ready_for(role_id)
    }

    pub fn is_loading(&self) -> bool {
        self.status() == StoreStatus::Loading
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.state.read().last_error.clone()
    }

    pub fn active_role(&self) -> Option<RoleId> {
        self.inner.state.read().active_role
    }

    pub fn permissions_version(&self) -> u64 {
        self.inner.state.read().permissions_version
    }

    /// Last installed matrix regardless of status; `None` after a reset or role change.
    pub fn current_matrix(&self) -> Option<Arc<PermissionMatrix>> {
        self.inner.state.read().matrix.clone()
    }

    /// The installed matrix if the store is `Ready` for `role_id`, read under
    /// a single lock so the role check and the grants always agree.
    pub fn ready_matrix_for(&self, role_id: RoleId) -> Option<Arc<PermissionMatrix>> {
        let state = self.inner.state.read();
        if state.is_ready_for(role_id) {
            state.matrix.clone()
        } else {
            None
        }
    }

    pub fn view(&self) -> StoreView {
        let state = self.inner.state.read();
        StoreView {
            status: state.status,
            active_role: state.active_role,
            matrix: state.matrix.clone(),
            last_error: state.last_error.clone(),
            permissions_version: state.permissions_version,
        }
    }

    fn ready_matrix(&self) -> Option<Arc<PermissionMatrix>> {
        let state = self.inner.state.read();
        match state.status {
            StoreStatus::Ready => state.matrix.clone(),
            _ => None,
        }
    }

    pub fn has_module_access(&self, module: &str) -> bool {
        self.ready_matrix()
            .map(|matrix| matrix.has_module_access(module))
            .unwrap_or(false)
    }

    pub fn has_privilege(&self, module: &str, privilege: &str) -> bool {
        self.ready_matrix()
            .map(|matrix| matrix.has_privilege(module, privilege))
            .unwrap_or(false)
    }

    pub fn has_any_privilege<S: AsRef<str>>(&self, module: &str, privileges: &[S]) -> bool {
        self.ready_matrix()
            .map(|matrix| matrix.has_any_privilege(module, privileges))
            .unwrap_or(false)
    }

    pub fn has_all_privileges<S: AsRef<str>>(&self, module: &str, privileges: &[S]) -> bool {
        self.ready_matrix()
            .map(|matrix| matrix.has_all_privileges(module, privileges))
            .unwrap_or(false)
    }

    pub fn accessible_modules(&self) -> Vec<String> {
        self.ready_matrix()
            .map(|matrix| matrix.accessible_modules())
            .unwrap_or_default()
    }

    pub fn user_permissions_list(&self) -> Vec<PermissionGrant> {
        self.ready_matrix()
            .map(|matrix| matrix.grant_list())
            .unwrap_or_default()
    }

    /// Registers `listener` for every status transition. The listener stays
    /// registered for as long as the returned guard lives.
    pub fn add_change_listener<F>(&self, listener: F) -> ListenerGuard
    where
        F: Fn(&StoreTransition) + Send + Sync + 'static,
    {
        let id = self.inner.listeners.add(Arc::new(listener));
        ListenerGuard::new(id, Arc::downgrade(&self.inner.listeners))
    }

    pub fn remove_change_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    pub fn debug_permissions(&self) -> PermissionsDebugDump {
        let state = self.inner.state.read();
        PermissionsDebugDump {
            status: state.status,
            active_role: state.active_role,
            last_error: state.last_error.clone(),
            version: state.version,
            permissions_version: state.permissions_version,
            in_flight_role: state.in_flight.as_ref().map(|in_flight| in_flight.role_id),
            listener_count: self.inner.listeners.len(),
            matrix: state.matrix.as_deref().cloned(),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakPermissionStore {
        WeakPermissionStore {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl std::fmt::Debug for PermissionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionStore")
            .field("status", &self.status())
            .field("active_role", &self.active_role())
            .finish()
    }
}

/// Non-owning store handle held by listeners, so a registered listener does
/// not keep its own store alive.
#[derive(Clone)]
pub(crate) struct WeakPermissionStore {
    inner: Weak<StoreInner>,
}

impl WeakPermissionStore {
    pub(crate) fn upgrade(&self) -> Option<PermissionStore> {
        self.inner.upgrade().map(|inner| PermissionStore { inner })
    }
}
