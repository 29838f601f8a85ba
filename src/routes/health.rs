use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::app::AppState;
use crate::errors::ApiResult;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub roles: usize,
}

pub async fn health(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    let roles = state.roles.read().len();
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        roles,
    }))
}
