pub mod app;
pub mod authz;
pub mod config;
pub mod errors;
pub mod fetcher;
pub mod models;
pub mod routes;
pub mod utils;

// Re-export commonly used items for tests
pub use app::{create_app, AppState};
pub use authz::{Identity, PermissionController, PermissionStore};
pub use errors::{PermissionError, PermissionResult};
