use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::authz::RoleId;

pub type PermissionResult<T> = Result<T, PermissionError>;

/// Failures surfaced by the permission store, controller and fetchers.
///
/// `Clone` because a single coalesced fetch hands its outcome to every
/// caller that joined it.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PermissionError {
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("no role assigned to the current user")]
    NoRoleAssigned,
    #[error("failed to fetch permissions: {0}")]
    FetchFailure(String),
    #[error("stale permission response for role {requested} (active role: {active:?})")]
    StaleRoleResponse {
        requested: RoleId,
        active: Option<RoleId>,
    },
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl PermissionError {
    pub fn fetch(message: impl Into<String>) -> Self {
        Self::FetchFailure(message.into())
    }

    pub fn stale(requested: RoleId, active: Option<RoleId>) -> Self {
        Self::StaleRoleResponse { requested, active }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Superseded responses are dropped quietly rather than shown to users.
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::StaleRoleResponse { .. })
    }
}

impl From<reqwest::Error> for PermissionError {
    fn from(value: reqwest::Error) -> Self {
        Self::FetchFailure(value.to_string())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Errors returned by the development server-of-record.
#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match &self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
        };

        let payload = ErrorResponse {
            error: error.to_string(),
            message: self.to_string(),
        };

        (status, Json(payload)).into_response()
    }
}
