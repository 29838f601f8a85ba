//! Process-wide permission store.
//!
//! Lifecycle: [`install`] once at session start, hand clones of [`store`] to
//! controllers, call [`reset_session`] on logout. The installed store lives
//! for the rest of the process; logging in again re-initializes it for the
//! new role.

use std::sync::{Arc, OnceLock};

use super::store::{PermissionStore, StoreConfig};
use crate::errors::{PermissionError, PermissionResult};
use crate::fetcher::PermissionFetcher;

static STORE: OnceLock<PermissionStore> = OnceLock::new();

/// Installs the process-wide store. Fails if one is already installed.
pub fn install(fetcher: Arc<dyn PermissionFetcher>, config: StoreConfig) -> PermissionResult<&'static PermissionStore> {
    let mut installed = false;
    let store = STORE.get_or_init(|| {
        installed = true;
        PermissionStore::new(fetcher, config)
    });

    if installed {
        tracing::debug!("permission store installed");
        Ok(store)
    } else {
        Err(PermissionError::configuration("permission store already installed"))
    }
}

pub fn store() -> Option<&'static PermissionStore> {
    STORE.get()
}

/// Drops the current user's permissions, e.g. on logout.
pub fn reset_session() {
    if let Some(store) = STORE.get() {
        store.reset();
    }
}
