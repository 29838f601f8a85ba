//! Authorization module - client-side permission cache
//!
//! This module holds the role-scoped permission cache used to gate the
//! administration screens:
//! - A process-wide store answering synchronous, fail-closed queries
//! - Per-screen controllers that subscribe to the store and revalidate it
//!   against the server-of-record on a timer
//! - The directory of well-known module and privilege names
//!
//! The server enforces authorization on its own; nothing here is a security
//! boundary.

mod controller;
pub mod global;
mod listeners;
mod matrix;
mod store;

pub use controller::{ControllerConfig, ControllerState, Identity, PermissionController, PermissionSnapshot};
pub use listeners::{ListenerGuard, ListenerId, StoreTransition};
pub use matrix::{Grants, PermissionGrant, PermissionMatrix, RoleId};
pub use store::{PermissionStore, PermissionsDebugDump, StoreConfig, StoreStatus, StoreView};

/// Well-known module names
pub mod modules {
    pub const CLIENTES: &str = "CLIENTES";
    pub const MEMBRESIAS: &str = "MEMBRESIAS";
    pub const CONTRATOS: &str = "CONTRATOS";
    pub const HORARIOS: &str = "HORARIOS";
    pub const ENCUESTAS: &str = "ENCUESTAS";
    pub const PAGOS: &str = "PAGOS";
    pub const USUARIOS: &str = "USUARIOS";
    pub const ROLES: &str = "ROLES";
    pub const REPORTES: &str = "REPORTES";
}

/// Well-known privilege names
pub mod privileges {
    pub const CREATE: &str = "CREATE";
    pub const READ: &str = "READ";
    pub const UPDATE: &str = "UPDATE";
    pub const DELETE: &str = "DELETE";
}

pub const ALL_MODULES: [&str; 9] = [
    modules::CLIENTES,
    modules::MEMBRESIAS,
    modules::CONTRATOS,
    modules::HORARIOS,
    modules::ENCUESTAS,
    modules::PAGOS,
    modules::USUARIOS,
    modules::ROLES,
    modules::REPORTES,
];

pub const ALL_PRIVILEGES: [&str; 4] = [
    privileges::CREATE,
    privileges::READ,
    privileges::UPDATE,
    privileges::DELETE,
];

/// Whether `privilege` belongs to the privilege vocabulary.
pub fn is_known_privilege(privilege: &str) -> bool {
    ALL_PRIVILEGES.contains(&privilege)
}
