//! Kernel services.

pub mod audit;

pub use audit::{AuditEntry, AuditService};
