//! frps subprocess management
//!
//! Provisioning of the pinned frps binary, TOML config generation, the
//! supervisor that owns the subprocess lifecycle, and the admin-API client.

pub mod admin;
pub mod config_gen;
pub mod provision;
pub mod supervisor;

pub use admin::FrpsAdminClient;
pub use supervisor::{FrpsSupervisor, SupervisorState, SupervisorStatus};
