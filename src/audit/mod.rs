// # Audit Log
//
// Tamper-evident, hash-chained event record. Append-only with a single
// serialized writer, concurrent readers, search/export, and an end-to-end
// integrity verifier.

pub mod audit_events;
pub mod audit_log;

pub use audit_events::{params_hash, record_hash, AuditQuery, AuditRecord, GENESIS_HASH};
pub use audit_log::{AuditConfig, AuditLog, AuditStatistics};
