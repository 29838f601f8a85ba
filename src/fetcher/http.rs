use async_trait::async_trait;

use super::PermissionFetcher;
use crate::authz::{PermissionMatrix, RoleId};
use crate::config::PermissionsConfig;
use crate::errors::{PermissionError, PermissionResult};
use crate::models::permissions::RolePermissionsResponse;
use crate::utils::utc_now;

/// Fetches role permissions from the REST server-of-record.
#[derive(Debug, Clone)]
pub struct HttpPermissionFetcher {
    base_url: String,
    client: reqwest::Client,
    bearer_token: Option<String>,
}

impl HttpPermissionFetcher {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            bearer_token: None,
        }
    }

    pub fn from_config(config: &PermissionsConfig) -> Self {
        let fetcher = Self::new(config.api_url.clone());
        match &config.bearer_token {
            Some(token) => fetcher.with_bearer_token(token.clone()),
            None => fetcher,
        }
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn role_url(&self, role_id: RoleId) -> String {
        format!("{}/api/roles/{}/permissions", self.base_url, role_id)
    }
}

#[async_trait]
impl PermissionFetcher for HttpPermissionFetcher {
    async fn fetch_permissions(&self, role_id: RoleId) -> PermissionResult<PermissionMatrix> {
        let mut request = self.client.get(self.role_url(role_id));
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PermissionError::fetch(format!("server returned {status}")));
        }

        let body: RolePermissionsResponse = response.json().await?;
        Ok(body.into_matrix(utc_now()))
    }
}
