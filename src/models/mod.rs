//! Data models for lots and the audit trail.

mod audit;
mod lot;

pub use audit::{AuditAction, AuditEvent, AuditLog, AUDIT_CAPACITY};
pub use lot::{Lot, LotStatus, StopLoss};
