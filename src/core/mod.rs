//! Core control-plane state
//!
//! The credential lifecycle state machine and everything it touches: the port
//! allocator, the reject set, the expiry scheduler and the composite
//! single-writer state that serializes all mutations.

pub mod allocator;
pub mod credential;
pub mod expiry;
pub mod reject;
pub mod service;
pub mod state;

pub use allocator::PortAllocator;
pub use credential::{AuditEntry, AuditEvent, Credential, CredentialStatus};
pub use reject::RejectSet;
pub use state::{CoreState, Notifier, TunnelNotice};
