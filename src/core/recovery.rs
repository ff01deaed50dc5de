//! 错误恢复引擎
//!
//! 根据 AgentError 类型返回 RecoveryAction，供回合循环与自我修正决定是重试、交给模型、回滚还是终止。
//! 传播策略集中在这里：SandboxViolation / AuditWriteFailure 从不重试；ExecutionFailure 在上限内重试，
//! 之后回滚并作为 Observation 交给模型；InferenceUnavailable / SessionNotFound 直接交给调用方。

use crate::core::{AgentError, RecoveryAction};

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Clone, Copy)]
pub struct RecoveryEngine {
    max_attempts: usize,
}

impl RecoveryEngine {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// attempt 从 1 开始，表示刚刚失败的是第几次执行
    pub fn handle(&self, err: &AgentError, attempt: usize) -> RecoveryAction {
        match err {
            AgentError::ExecutionFailure(_) if attempt < self.max_attempts => {
                RecoveryAction::RetryWithCorrection
            }
            AgentError::ExecutionFailure(_) => RecoveryAction::Rollback,
            AgentError::SandboxViolation(_) => RecoveryAction::SurfaceAsObservation,
            AgentError::InferenceUnavailable(_)
            | AgentError::SessionNotFound(_)
            | AgentError::TurnLimitExceeded(_)
            | AgentError::AuditWriteFailure(_)
            | AgentError::Cancelled
            | AgentError::Process(_)
            | AgentError::Storage(_)
            | AgentError::ConfigError(_) => RecoveryAction::Abort,
        }
    }
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new(3)
    }
}
