use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::listeners::ListenerGuard;
use super::matrix::{PermissionGrant, PermissionMatrix, RoleId};
use super::store::{PermissionStore, PermissionsDebugDump, StoreStatus};
use crate::errors::{PermissionError, PermissionResult};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// How often the server-of-record is polled for permission drift.
    pub poll_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// What the login flow knows about the current user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Identity {
    pub authenticated: bool,
    pub role_id: Option<RoleId>,
}

impl Identity {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_role(role_id: RoleId) -> Self {
        Self {
            authenticated: true,
            role_id: Some(role_id),
        }
    }

    pub fn without_role() -> Self {
        Self {
            authenticated: true,
            role_id: None,
        }
    }

    /// The role to load, or why there is none.
    pub fn role(&self) -> PermissionResult<RoleId> {
        if !self.authenticated {
            return Err(PermissionError::NotAuthenticated);
        }
        self.role_id.ok_or(PermissionError::NoRoleAssigned)
    }
}

/// Immutable view handed to consumers whenever something they can see changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PermissionSnapshot {
    pub is_loading: bool,
    pub is_ready: bool,
    pub last_error: Option<String>,
    pub accessible_modules: Vec<String>,
    pub user_permissions: Vec<PermissionGrant>,
    pub version: u64,
}

impl PermissionSnapshot {
    fn capture(store: &PermissionStore, identity: &Identity) -> Self {
        let role_id = match identity.role() {
            Ok(role_id) => role_id,
            Err(err) => {
                return Self {
                    last_error: Some(err.to_string()),
                    ..Self::default()
                }
            }
        };

        let view = store.view();
        let matrix = view
            .ready_matrix()
            .filter(|matrix| matrix.role_id() == role_id);
        Self {
            is_loading: view.status == StoreStatus::Loading,
            is_ready: matrix.is_some(),
            last_error: view.last_error.clone(),
            accessible_modules: matrix.map(|m| m.accessible_modules()).unwrap_or_default(),
            user_permissions: matrix.map(|m| m.grant_list()).unwrap_or_default(),
            version: view.permissions_version,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Subscribed,
    Unsubscribed,
}

struct Lifecycle {
    state: ControllerState,
    subscription: Option<ListenerGuard>,
    poller: Option<JoinHandle<()>>,
    polled_role: Option<RoleId>,
}

/// Binds one consumer (a screen, a request handler) to the shared store.
///
/// Activation subscribes to store transitions, loads the role's
/// permissions and starts polling for drift; deactivation (or drop) undoes
/// all of it. Predicates deny unless the identity is complete and the store
/// is ready for that identity's role.
pub struct PermissionController {
    store: PermissionStore,
    config: ControllerConfig,
    identity: Arc<RwLock<Identity>>,
    lifecycle: Mutex<Lifecycle>,
    snapshot: Arc<watch::Sender<PermissionSnapshot>>,
}

impl PermissionController {
    pub fn new(store: PermissionStore, config: ControllerConfig) -> Self {
        let (sender, _) = watch::channel(PermissionSnapshot::default());
        Self {
            store,
            config,
            identity: Arc::new(RwLock::new(Identity::anonymous())),
            lifecycle: Mutex::new(Lifecycle {
                state: ControllerState::Idle,
                subscription: None,
                poller: None,
                polled_role: None,
            }),
            snapshot: Arc::new(sender),
        }
    }

    /// Activates the controller for `identity`. Calling it again with a
    /// different role re-binds to that role; with the same role it only
    /// costs a fetch if the store is not already ready.
    pub async fn activate(&self, identity: Identity) -> PermissionResult<()> {
        *self.identity.write() = identity;

        let role_id = match identity.role() {
            Ok(role_id) => role_id,
            Err(err) => {
                tracing::debug!(error = %err, "permission controller has no usable identity");
                self.stop_polling();
                self.publish();
                return Err(err);
            }
        };

        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.subscription.is_none() {
                lifecycle.subscription = Some(self.subscribe_to_store());
            }
            lifecycle.state = ControllerState::Subscribed;

            if lifecycle.polled_role != Some(role_id) {
                if let Some(poller) = lifecycle.poller.take() {
                    poller.abort();
                }
                lifecycle.poller = Some(spawn_poller(self.store.clone(), role_id, self.config.poll_interval));
                lifecycle.polled_role = Some(role_id);
            }
        }
        tracing::debug!(role_id = %role_id, "permission controller activated");

        let result = self.store.initialize(role_id).await;
        // a no-op initialize fires no transition
        self.publish();
        result
    }

    /// Unregisters from the store and stops polling. Safe to call at any time.
    pub fn deactivate(&self) {
        let mut lifecycle = self.lifecycle.lock();
        let was_subscribed = lifecycle.subscription.take().is_some();
        if let Some(poller) = lifecycle.poller.take() {
            poller.abort();
        }
        lifecycle.polled_role = None;
        if lifecycle.state == ControllerState::Subscribed {
            lifecycle.state = ControllerState::Unsubscribed;
        }
        if was_subscribed {
            tracing::debug!("permission controller deactivated");
        }
    }

    /// Forces a reload of the current role's permissions.
    pub async fn refresh_permissions(&self) -> PermissionResult<()> {
        let role_id = self.identity.read().role()?;
        let result = self.store.reload(role_id).await;
        self.publish();
        result
    }

    pub fn state(&self) -> ControllerState {
        self.lifecycle.lock().state
    }

    pub fn identity(&self) -> Identity {
        *self.identity.read()
    }

    pub fn store(&self) -> &PermissionStore {
        &self.store
    }

    /// Receiver that observes every distinct snapshot.
    pub fn subscribe(&self) -> watch::Receiver<PermissionSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> PermissionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn is_loading(&self) -> bool {
        self.snapshot.borrow().is_loading
    }

    pub fn is_ready(&self) -> bool {
        self.snapshot.borrow().is_ready
    }

    pub fn last_error(&self) -> Option<String> {
        self.snapshot.borrow().last_error.clone()
    }

    pub fn accessible_modules(&self) -> Vec<String> {
        self.snapshot.borrow().accessible_modules.clone()
    }

    pub fn user_permissions_list(&self) -> Vec<PermissionGrant> {
        self.snapshot.borrow().user_permissions.clone()
    }

    pub fn permissions_version(&self) -> u64 {
        self.snapshot.borrow().version
    }

    /// The store's matrix, provided the identity is complete and the store
    /// is ready for exactly that role.
    fn granted_matrix(&self) -> Option<Arc<PermissionMatrix>> {
        let role_id = self.identity.read().role().ok()?;
        self.store.ready_matrix_for(role_id)
    }

    pub fn has_module_access(&self, module: &str) -> bool {
        self.granted_matrix()
            .map(|matrix| matrix.has_module_access(module))
            .unwrap_or(false)
    }

    pub fn has_privilege(&self, module: &str, privilege: &str) -> bool {
        self.granted_matrix()
            .map(|matrix| matrix.has_privilege(module, privilege))
            .unwrap_or(false)
    }

    pub fn has_any_privilege<S: AsRef<str>>(&self, module: &str, privileges: &[S]) -> bool {
        self.granted_matrix()
            .map(|matrix| matrix.has_any_privilege(module, privileges))
            .unwrap_or(false)
    }

    pub fn has_all_privileges<S: AsRef<str>>(&self, module: &str, privileges: &[S]) -> bool {
        self.granted_matrix()
            .map(|matrix| matrix.has_all_privileges(module, privileges))
            .unwrap_or(false)
    }

    pub fn debug_permissions(&self) -> PermissionsDebugDump {
        let dump = self.store.debug_permissions();
        tracing::debug!(
            status = ?dump.status,
            active_role = ?dump.active_role,
            last_error = ?dump.last_error,
            permissions_version = dump.permissions_version,
            "permission state"
        );
        dump
    }

    fn publish(&self) {
        publish_snapshot(&self.snapshot, &self.store, &self.identity.read());
    }

    fn subscribe_to_store(&self) -> ListenerGuard {
        let store = self.store.downgrade();
        let identity = self.identity.clone();
        let snapshot = self.snapshot.clone();
        self.store.add_change_listener(move |_| {
            if let Some(store) = store.upgrade() {
                publish_snapshot(&snapshot, &store, &identity.read());
            }
        })
    }

    fn stop_polling(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if let Some(poller) = lifecycle.poller.take() {
            poller.abort();
        }
        lifecycle.polled_role = None;
    }
}

impl Drop for PermissionController {
    fn drop(&mut self) {
        self.deactivate();
    }
}

/// Sends only snapshots that differ from the current one.
fn publish_snapshot(sender: &watch::Sender<PermissionSnapshot>, store: &PermissionStore, identity: &Identity) {
    let next = PermissionSnapshot::capture(store, identity);
    sender.send_if_modified(|current| {
        if *current == next {
            false
        } else {
            *current = next;
            true
        }
    });
}

fn spawn_poller(store: PermissionStore, role_id: RoleId, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        // the first check is one full period after activation
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            revalidate(&store, role_id).await;
        }
    })
}

/// Compares the server's matrix with the cached one and reloads on drift.
async fn revalidate(store: &PermissionStore, role_id: RoleId) {
    if store.active_role() != Some(role_id) {
        return;
    }

    let fresh = match store.fetch_user_permissions(role_id).await {
        Ok(fresh) => fresh,
        Err(err) => {
            tracing::debug!(role_id = %role_id, error = %err, "permission revalidation failed");
            return;
        }
    };

    let drifted = match store.current_matrix() {
        Some(cached) => !cached.same_grants(&fresh),
        None => true,
    };
    if !drifted {
        return;
    }

    tracing::info!(role_id = %role_id, "permission drift detected, reloading");
    if let Err(err) = store.reload(role_id).await {
        if !err.is_stale() {
            tracing::warn!(role_id = %role_id, error = %err, "permission reload after drift failed");
        }
    }
}
