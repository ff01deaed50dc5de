//! Agent 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 AgentError 决定 RetryWithCorrection / SurfaceAsObservation / Rollback / Abort。
//! Display 文本面向调用方，只包含可读原因；原始错误细节只进入审计日志的 details。

use thiserror::Error;

use crate::llm::LlmError;

/// 编排过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// 动作触及沙箱外路径或命中危险模式：总是拒绝、总是 CRITICAL 审计、从不重试
    #[error("Sandbox violation: {0}")]
    SandboxViolation(String),

    /// 子进程已运行但返回非零或超时：可进入有限次自我修正
    #[error("Execution failed: {0}")]
    ExecutionFailure(String),

    /// LLM 后端不可达或出错：中止当前回合循环，会话仍可用
    #[error("Inference unavailable: {0}")]
    InferenceUnavailable(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Turn limit of {0} reached before the task finished")]
    TurnLimitExceeded(usize),

    /// 审计写入失败：当前动作不得继续（fail closed）
    #[error("Audit log unavailable: {0}")]
    AuditWriteFailure(String),

    #[error("Cancelled by caller")]
    Cancelled,

    /// 基础设施故障（如无法创建子进程）
    #[error("Process error: {0}")]
    Process(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Config error: {0}")]
    ConfigError(String),
}

impl AgentError {
    /// 稳定的错误类别名，用于审计 details 与事件
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::SandboxViolation(_) => "sandbox_violation",
            AgentError::ExecutionFailure(_) => "execution_failure",
            AgentError::InferenceUnavailable(_) => "inference_unavailable",
            AgentError::SessionNotFound(_) => "session_not_found",
            AgentError::TurnLimitExceeded(_) => "turn_limit_exceeded",
            AgentError::AuditWriteFailure(_) => "audit_write_failure",
            AgentError::Cancelled => "cancelled",
            AgentError::Process(_) => "process",
            AgentError::Storage(_) => "storage",
            AgentError::ConfigError(_) => "config",
        }
    }
}

impl From<LlmError> for AgentError {
    fn from(e: LlmError) -> Self {
        AgentError::InferenceUnavailable(e.to_string())
    }
}

impl From<config::ConfigError> for AgentError {
    fn from(e: config::ConfigError) -> Self {
        AgentError::ConfigError(e.to_string())
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 让代码模型给出修正后的命令，重新校验后重试
    RetryWithCorrection,
    /// 作为 Observation 交给模型，由模型决定下一步
    SurfaceAsObservation,
    /// 调用外部回滚能力后作为 Observation 交给模型
    Rollback,
    /// 终止当前回合循环，并向调用方给出原因
    Abort,
}
