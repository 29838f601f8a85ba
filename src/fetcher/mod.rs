//! Permission fetchers - the I/O boundary to the server-of-record
//!
//! The store only ever talks to a [`PermissionFetcher`]; the HTTP
//! implementation is used in production and the in-memory one by tests and
//! local tooling.

mod http;
mod memory;

pub use http::HttpPermissionFetcher;
pub use memory::MemoryPermissionFetcher;

use async_trait::async_trait;

use crate::authz::{PermissionMatrix, RoleId};
use crate::errors::PermissionResult;

/// Retrieves the authorized module/privilege matrix for a role.
///
/// Implementations must echo the requested role id in the returned matrix;
/// the store rejects matrices answering for any other role.
#[async_trait]
pub trait PermissionFetcher: Send + Sync {
    async fn fetch_permissions(&self, role_id: RoleId) -> PermissionResult<PermissionMatrix>;
}
