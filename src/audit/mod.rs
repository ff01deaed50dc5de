//! 审计层：追加写、不可变、崩溃安全的特权决策记录

mod entry;
mod sink;

pub use entry::{actions, AuditEntry, Outcome, Severity};
pub use sink::{read_audit_log, AuditSink, JsonlAuditLog, MemoryAuditLog};
