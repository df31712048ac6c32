//! Security plumbing for RelayClaw: audit logging and request signing.
//!
//! Provides:
//! - **Audit logging**: structured, fire-and-forget records of queued work
//! - **Signatures**: HMAC-SHA256 for webhook callbacks and inbound webhooks

pub mod audit;
pub mod signature;

pub use audit::{AuditAction, AuditEntry, AuditLogger, AuditSink, JsonlFileSink, TracingSink};
