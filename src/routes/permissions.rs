//! Role permission endpoints of the development server-of-record.
//!
//! `GET` is what the permission fetcher polls; `PUT` stands in for an
//! administrator editing a role while sessions using it stay open.

use axum::extract::{Path, State};
use axum::Json;

use crate::app::AppState;
use crate::authz::RoleId;
use crate::errors::{ApiError, ApiResult};
use crate::models::permissions::{RolePermissionsResponse, UpdateRolePermissionsRequest};

pub async fn get_role_permissions(
    State(state): State<AppState>,
    Path(role_id): Path<u64>,
) -> ApiResult<Json<RolePermissionsResponse>> {
    let role_id = RoleId(role_id);
    let roles = state.roles.read();
    let grants = roles
        .get(&role_id)
        .ok_or_else(|| ApiError::not_found(format!("role {role_id}")))?;

    Ok(Json(RolePermissionsResponse::from_grants(role_id, grants)))
}

pub async fn put_role_permissions(
    State(state): State<AppState>,
    Path(role_id): Path<u64>,
    Json(req): Json<UpdateRolePermissionsRequest>,
) -> ApiResult<Json<RolePermissionsResponse>> {
    let role_id = RoleId(role_id);
    if req.modules.iter().any(|entry| entry.module.trim().is_empty()) {
        return Err(ApiError::bad_request("module name must not be empty"));
    }

    let grants = req.grants();
    tracing::info!(role_id = %role_id, modules = grants.len(), "role permissions replaced");
    let response = RolePermissionsResponse::from_grants(role_id, &grants);
    state.roles.write().insert(role_id, grants);

    Ok(Json(response))
}
