//! 自我修正：命令失败（非零退出 / 超时，不含沙箱拒绝）时请编码模型给出修正命令并重试
//!
//! 每个 ActionRequest 最多执行 max_attempts 次（含首次）；每次修正后的命令都重新走沙箱校验，
//! 每次执行各写一条审计。用尽后调用可插拔的 Rollback 并返回最后一次失败结果，交给模型在下一回合处理。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::audit::{actions, AuditEntry, Outcome, Severity};
use crate::core::{AgentError, RecoveryAction, RecoveryEngine};
use crate::llm::{ChatRequest, LlmClient, ModelRouter};
use crate::memory::Message;
use crate::react::parse_action;
use crate::tools::executor::{ActionExecutor, ActionRequest, ActionResult, ExecutionContext};

const CORRECTION_PREAMBLE: &str = "You repair failed shell commands. \
Reply with exactly one line of the form `Action: <corrected command>` and nothing else. \
Stay inside the current workspace and never touch system paths.";

/// 上下文中保留的 stderr 字符数
const STDERR_PREVIEW_CHARS: usize = 2000;

/// 外部回滚能力（版本控制、文件快照等），在修正次数用尽后调用
#[async_trait]
pub trait Rollback: Send + Sync {
    async fn rollback(&self, session_id: &str) -> anyhow::Result<()>;
}

/// 带自我修正的执行器
pub struct SelfCorrection {
    executor: Arc<ActionExecutor>,
    llm: Arc<dyn LlmClient>,
    router: ModelRouter,
    recovery: RecoveryEngine,
    rollback: Option<Arc<dyn Rollback>>,
}

impl SelfCorrection {
    pub fn new(
        executor: Arc<ActionExecutor>,
        llm: Arc<dyn LlmClient>,
        router: ModelRouter,
        recovery: RecoveryEngine,
    ) -> Self {
        Self {
            executor,
            llm,
            router,
            recovery,
            rollback: None,
        }
    }

    pub fn with_rollback(mut self, rollback: Option<Arc<dyn Rollback>>) -> Self {
        self.rollback = rollback;
        self
    }

    pub fn executor(&self) -> &ActionExecutor {
        &self.executor
    }

    /// 执行请求，失败时在上限内修正重试；返回最后一次结果
    pub async fn run(
        &self,
        ctx: &ExecutionContext,
        request: ActionRequest,
        instruction: &str,
    ) -> Result<ActionResult, AgentError> {
        let mut request = request;
        let mut attempt = 1;
        loop {
            let result = self
                .executor
                .execute(&ctx.with_attempt(attempt), &request)
                .await?;
            if !result.is_failure() {
                return Ok(result);
            }

            let err = AgentError::ExecutionFailure(result.failure_reason());
            match self.recovery.handle(&err, attempt) {
                RecoveryAction::RetryWithCorrection => {
                    tracing::warn!(
                        session_id = %ctx.session_id,
                        command = %result.command,
                        attempt,
                        "command failed, requesting correction"
                    );
                    match self.correct(ctx, instruction, &result).await? {
                        Some(corrected) => {
                            request = ActionRequest {
                                command: corrected.command,
                                cwd: corrected.cwd.or(request.cwd),
                            };
                            attempt += 1;
                        }
                        None => {
                            tracing::warn!(session_id = %ctx.session_id, "correction reply had no Action line");
                            return Ok(result);
                        }
                    }
                }
                RecoveryAction::Rollback => {
                    self.roll_back(ctx, &result).await?;
                    return Ok(result);
                }
                RecoveryAction::SurfaceAsObservation | RecoveryAction::Abort => return Ok(result),
            }
        }
    }

    /// 向编码模型要修正命令；可被取消
    async fn correct(
        &self,
        ctx: &ExecutionContext,
        instruction: &str,
        failed: &ActionResult,
    ) -> Result<Option<ActionRequest>, AgentError> {
        let decision = self.router.coding();
        let stderr: String = failed.stderr.trim().chars().take(STDERR_PREVIEW_CHARS).collect();
        let prompt = format!(
            "Task: {}\nFailed command: {}\nResult: {}\nstderr:\n{}",
            instruction,
            failed.command,
            failed.failure_reason(),
            if stderr.is_empty() { "(empty)" } else { stderr.as_str() },
        );
        let request = ChatRequest::new(
            decision.model,
            decision.temperature,
            vec![Message::system(CORRECTION_PREAMBLE), Message::user(prompt)],
        );

        let reply = tokio::select! {
            reply = self.llm.complete(&request) => reply?,
            _ = ctx.cancel.cancelled() => return Err(AgentError::Cancelled),
        };
        Ok(parse_action(&reply))
    }

    async fn roll_back(&self, ctx: &ExecutionContext, last: &ActionResult) -> Result<(), AgentError> {
        let Some(rollback) = &self.rollback else {
            return Ok(());
        };
        let (outcome, error) = match rollback.rollback(&ctx.session_id).await {
            Ok(()) => (Outcome::Success, None),
            Err(e) => {
                tracing::warn!(session_id = %ctx.session_id, error = %e, "rollback failed");
                (Outcome::Failure, Some(format!("{:#}", e)))
            }
        };
        let entry = AuditEntry::new(Severity::Warn, "self_correction", actions::ROLLBACK, outcome)
            .with_session(ctx.session_id.clone())
            .with_details(json!({
                "command": last.command,
                "attempts": last.attempt,
                "error": error,
            }));
        self.executor.audit().record(entry).await
    }
}
