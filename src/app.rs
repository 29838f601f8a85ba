use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use axum::routing::get;
use axum::Router;
use parking_lot::RwLock;
use tower_http::trace::TraceLayer;

use crate::authz::{Grants, RoleId};
use crate::models::permissions::RoleSeedFile;
use crate::routes::{health, permissions};

/// Shared state of the development server-of-record.
#[derive(Clone, Default)]
pub struct AppState {
    pub roles: Arc<RwLock<BTreeMap<RoleId, Grants>>>,
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: RoleSeedFile) -> Self {
        let roles = seed
            .roles
            .into_iter()
            .map(|role| (role.role_id, role.grants()))
            .collect();
        Self {
            roles: Arc::new(RwLock::new(roles)),
        }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read role seed file {}", path.display()))?;
        let seed: RoleSeedFile = serde_json::from_str(&raw)
            .with_context(|| format!("invalid role seed file {}", path.display()))?;
        Ok(Self::from_seed(seed))
    }
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health::health))
        .route(
            "/api/roles/:role_id/permissions",
            get(permissions::get_role_permissions).put(permissions::put_role_permissions),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
