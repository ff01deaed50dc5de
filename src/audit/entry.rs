//! 审计条目
//!
//! 每条一行 JSON，自描述：timestamp、severity、action、performer、status、details，
//! 外部 SIEM 类工具可逐行独立解析。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 严重级别（可比较：Info < Warn < Critical）
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warn,
    Critical,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Success,
    Failure,
}

/// 审计动作名
pub mod actions {
    pub const COMMAND_EXECUTED: &str = "COMMAND_EXECUTED";
    pub const PATH_DENIED: &str = "PATH_DENIED";
    pub const DESTRUCTIVE_DENIED: &str = "DESTRUCTIVE_DENIED";
    pub const ROLLBACK: &str = "ROLLBACK";
}

/// 单条审计记录；写入后不可修改、不可删除
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// 由审计日志在写入时分配的全局递增序号
    #[serde(default)]
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub action: String,
    #[serde(rename = "performer")]
    pub actor: String,
    #[serde(rename = "status")]
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl AuditEntry {
    pub fn new(
        severity: Severity,
        actor: impl Into<String>,
        action: impl Into<String>,
        outcome: Outcome,
    ) -> Self {
        Self {
            seq: 0,
            timestamp: Utc::now(),
            severity,
            action: action.into(),
            actor: actor.into(),
            outcome,
            session_id: None,
            details: serde_json::Value::Null,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_format_uses_external_field_names() {
        let entry = AuditEntry::new(Severity::Critical, "executor", actions::PATH_DENIED, Outcome::Failure)
            .with_session("session_1")
            .with_details(serde_json::json!({ "path": "/etc/shadow" }));
        let line = serde_json::to_string(&entry).unwrap();
        let v: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["severity"], "CRITICAL");
        assert_eq!(v["status"], "FAILURE");
        assert_eq!(v["performer"], "executor");
        assert_eq!(v["action"], "PATH_DENIED");
        assert_eq!(v["details"]["path"], "/etc/shadow");
        assert!(!line.contains('\n'));
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical >= Severity::Warn);
        assert!(Severity::Warn > Severity::Info);
    }
}
