//! 动作执行器
//!
//! execute(ctx, request) 的协议：
//! 1. 校验工作目录提示（`Cwd:`），缺省为工作区根；
//! 2. 沙箱校验整条命令（危险模式 + 路径参数优先，其后逐个路径），拒绝时先写 CRITICAL 审计再返回 Denied；
//! 3. 探测审计汇可写，否则不执行（fail closed）；
//! 4. 在超时与输出上限内运行子进程；
//! 5. 写 INFO 审计（SUCCESS / FAILURE）后返回；运行中被取消或无法创建进程时写 WARN FAILURE 审计后返回 Err。
//!
//! 被拒绝或失败的命令通过 ActionResult 表达，不返回 Err；只有基础设施故障、审计失败与取消才返回 Err。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::audit::{actions, AuditEntry, AuditSink, Outcome, Severity};
use crate::core::AgentError;
use crate::sandbox::{DenialKind, SandboxPolicy, SandboxVerdict};
use crate::tools::shell::CommandRunner;

const ACTOR: &str = "action_executor";

/// 结构化动作请求
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ActionRequest {
    pub command: String,
    /// 工作目录提示；None 表示工作区根
    pub cwd: Option<String>,
}

impl ActionRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            cwd: None,
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Succeeded,
    Failed,
    TimedOut,
    Denied,
}

/// 单次执行的结果
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ActionResult {
    pub command: String,
    pub status: ActionStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
    pub elapsed: Duration,
    pub verdict: SandboxVerdict,
    /// 第几次执行（从 1 开始）
    pub attempt: usize,
}

impl ActionResult {
    fn denied(command: &str, verdict: SandboxVerdict, attempt: usize) -> Self {
        Self {
            command: command.to_string(),
            status: ActionStatus::Denied,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            truncated: false,
            elapsed: Duration::ZERO,
            verdict,
            attempt,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ActionStatus::Succeeded
    }

    pub fn is_denied(&self) -> bool {
        self.status == ActionStatus::Denied
    }

    /// 失败或超时（可进入自我修正）
    pub fn is_failure(&self) -> bool {
        matches!(self.status, ActionStatus::Failed | ActionStatus::TimedOut)
    }

    /// 失败原因的一句话描述
    pub fn failure_reason(&self) -> String {
        match self.status {
            ActionStatus::TimedOut => format!("'{}' timed out", self.command),
            ActionStatus::Denied => self
                .verdict
                .reason
                .clone()
                .unwrap_or_else(|| "denied".to_string()),
            _ => match self.exit_code {
                Some(code) => format!("'{}' exited with code {}", self.command, code),
                None => format!("'{}' was terminated", self.command),
            },
        }
    }

    /// 回填给模型的 Observation 文本
    pub fn observation_text(&self) -> String {
        let mut text = match self.status {
            ActionStatus::Succeeded => {
                let out = self.stdout.trim();
                if out.is_empty() {
                    "(no output)".to_string()
                } else {
                    out.to_string()
                }
            }
            ActionStatus::Denied => format!("Denied: {}", self.failure_reason()),
            ActionStatus::Failed | ActionStatus::TimedOut => {
                let mut s = format!("Failed: {}", self.failure_reason());
                let stderr = self.stderr.trim();
                let stdout = self.stdout.trim();
                if !stderr.is_empty() {
                    s.push_str("\nstderr: ");
                    s.push_str(stderr);
                }
                if !stdout.is_empty() {
                    s.push_str("\nstdout: ");
                    s.push_str(stdout);
                }
                s
            }
        };
        if self.truncated {
            text.push_str("\n[output truncated]");
        }
        text
    }
}

/// 一次执行的上下文
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    pub session_id: String,
    pub attempt: usize,
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(session_id: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            session_id: session_id.into(),
            attempt: 1,
            cancel,
        }
    }

    pub fn with_attempt(&self, attempt: usize) -> Self {
        Self {
            attempt,
            ..self.clone()
        }
    }
}

/// 动作执行器：沙箱 + 子进程 + 审计
pub struct ActionExecutor {
    policy: SandboxPolicy,
    runner: Arc<dyn CommandRunner>,
    audit: Arc<dyn AuditSink>,
}

impl ActionExecutor {
    pub fn new(policy: SandboxPolicy, runner: Arc<dyn CommandRunner>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            policy,
            runner,
            audit,
        }
    }

    pub fn policy(&self) -> &SandboxPolicy {
        &self.policy
    }

    pub fn audit(&self) -> &Arc<dyn AuditSink> {
        &self.audit
    }

    pub async fn execute(
        &self,
        ctx: &ExecutionContext,
        request: &ActionRequest,
    ) -> Result<ActionResult, AgentError> {
        let command = request.command.trim();

        let base: PathBuf = match &request.cwd {
            None => self.policy.workspace_root().to_path_buf(),
            Some(hint) => {
                let verdict = self.policy.validate_path(hint);
                if !verdict.allowed {
                    let verdict = verdict.with_command(command);
                    return self.deny(ctx, command, verdict, DenialKind::Path).await;
                }
                verdict
                    .resolved_path
                    .unwrap_or_else(|| self.policy.workspace_root().to_path_buf())
            }
        };

        let (verdict, denial) = self.policy.validate_command(command, &base);
        if let Some(kind) = denial {
            return self.deny(ctx, command, verdict, kind).await;
        }

        self.audit.check().await?;

        if !is_dir(&base).await {
            let result = ActionResult {
                command: command.to_string(),
                status: ActionStatus::Failed,
                exit_code: None,
                stdout: String::new(),
                stderr: format!("working directory does not exist: {}", base.display()),
                truncated: false,
                elapsed: Duration::ZERO,
                verdict,
                attempt: ctx.attempt,
            };
            self.record_execution(ctx, &base, &result).await?;
            return Ok(result);
        }

        tracing::info!(
            session_id = %ctx.session_id,
            command = %command,
            attempt = ctx.attempt,
            cwd = %base.display(),
            "executing action"
        );
        let output = match self.runner.run(command, &base, &ctx.cancel).await {
            Ok(output) => output,
            Err(e) => {
                self.record_interrupted(ctx, command, &base, &e).await;
                return Err(e);
            }
        };

        let status = if output.timed_out {
            ActionStatus::TimedOut
        } else if output.success() {
            ActionStatus::Succeeded
        } else {
            ActionStatus::Failed
        };
        let result = ActionResult {
            command: command.to_string(),
            status,
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            truncated: output.truncated,
            elapsed: output.elapsed,
            verdict,
            attempt: ctx.attempt,
        };
        self.record_execution(ctx, &base, &result).await?;
        Ok(result)
    }

    /// 拒绝：审计先于返回；审计失败则整个动作失败
    async fn deny(
        &self,
        ctx: &ExecutionContext,
        command: &str,
        verdict: SandboxVerdict,
        kind: DenialKind,
    ) -> Result<ActionResult, AgentError> {
        let action = match kind {
            DenialKind::Path => actions::PATH_DENIED,
            DenialKind::Destructive => actions::DESTRUCTIVE_DENIED,
        };
        tracing::warn!(
            session_id = %ctx.session_id,
            command = %command,
            reason = verdict.reason.as_deref().unwrap_or(""),
            "action denied by sandbox"
        );
        let entry = AuditEntry::new(Severity::Critical, ACTOR, action, Outcome::Failure)
            .with_session(ctx.session_id.clone())
            .with_details(json!({
                "command": command,
                "reason": verdict.reason,
                "resolved_path": verdict.resolved_path,
                "attempt": ctx.attempt,
            }));
        self.audit.record(entry).await?;
        Ok(ActionResult::denied(command, verdict, ctx.attempt))
    }

    /// 已放行的命令被取消或无法创建进程：照样留下 FAILURE 记录，再把原错误交给调用方
    async fn record_interrupted(&self, ctx: &ExecutionContext, command: &str, cwd: &Path, err: &AgentError) {
        let details = match err {
            AgentError::Cancelled => json!({
                "command": command,
                "cwd": cwd,
                "cancelled": true,
                "attempt": ctx.attempt,
            }),
            other => json!({
                "command": command,
                "cwd": cwd,
                "error": other.to_string(),
                "attempt": ctx.attempt,
            }),
        };
        let entry = AuditEntry::new(Severity::Warn, ACTOR, actions::COMMAND_EXECUTED, Outcome::Failure)
            .with_session(ctx.session_id.clone())
            .with_details(details);
        if let Err(audit_err) = self.audit.record(entry).await {
            tracing::error!(
                session_id = %ctx.session_id,
                command = %command,
                error = %audit_err,
                "failed to audit interrupted command"
            );
        }
    }

    async fn record_execution(
        &self,
        ctx: &ExecutionContext,
        cwd: &Path,
        result: &ActionResult,
    ) -> Result<(), AgentError> {
        let outcome = if result.is_success() {
            Outcome::Success
        } else {
            Outcome::Failure
        };
        let entry = AuditEntry::new(Severity::Info, ACTOR, actions::COMMAND_EXECUTED, outcome)
            .with_session(ctx.session_id.clone())
            .with_details(json!({
                "command": result.command,
                "cwd": cwd,
                "exit_code": result.exit_code,
                "timed_out": result.status == ActionStatus::TimedOut,
                "truncated": result.truncated,
                "elapsed_ms": result.elapsed.as_millis() as u64,
                "stderr": result.stderr,
                "attempt": result.attempt,
            }));
        self.audit.record(entry).await
    }
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditLog;
    use crate::tools::shell::ShellRunner;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        audit: Arc<MemoryAuditLog>,
        executor: ActionExecutor,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let audit = Arc::new(MemoryAuditLog::new());
        let policy = SandboxPolicy::new(&root, None).with_case_insensitive(false);
        let runner = ShellRunner::new("sh", Duration::from_secs(5), 4096);
        let executor = ActionExecutor::new(policy, Arc::new(runner), audit.clone());
        Fixture {
            _dir: dir,
            root,
            audit,
            executor,
        }
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("s1", CancellationToken::new())
    }

    #[tokio::test]
    async fn test_success_is_audited_info() {
        let f = fixture();
        let result = f.executor.execute(&ctx(), &ActionRequest::new("echo hello")).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.observation_text(), "hello");

        let entries = f.audit.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].severity, Severity::Info);
        assert_eq!(entries[0].action, actions::COMMAND_EXECUTED);
        assert_eq!(entries[0].outcome, Outcome::Success);
        assert_eq!(entries[0].session_id.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_path_denial_is_audited_before_return() {
        let f = fixture();
        let result = f.executor.execute(&ctx(), &ActionRequest::new("cat /etc/shadow")).await.unwrap();
        assert!(result.is_denied());
        assert!(result.observation_text().starts_with("Denied:"));

        let entries = f.audit.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].severity, Severity::Critical);
        assert_eq!(entries[0].action, actions::PATH_DENIED);
    }

    #[tokio::test]
    async fn test_destructive_denial() {
        let f = fixture();
        let command = format!("rm -rf {}/build", f.root.display());
        let result = f.executor.execute(&ctx(), &ActionRequest::new(command)).await.unwrap();
        assert!(result.is_denied());
        assert_eq!(f.audit.entries()[0].action, actions::DESTRUCTIVE_DENIED);
    }

    #[tokio::test]
    async fn test_failure_is_reported_in_result() {
        let f = fixture();
        let result = f.executor.execute(&ctx(), &ActionRequest::new("echo bad >&2; exit 2")).await.unwrap();
        assert!(result.is_failure());
        assert_eq!(result.exit_code, Some(2));
        assert!(result.observation_text().contains("bad"));
        assert_eq!(f.audit.entries()[0].outcome, Outcome::Failure);
    }

    #[tokio::test]
    async fn test_audit_unavailable_blocks_execution() {
        let f = fixture();
        f.audit.set_unavailable(true);
        let marker = f.root.join("ran.txt");
        let command = "touch ran.txt";
        let err = f.executor.execute(&ctx(), &ActionRequest::new(command)).await.unwrap_err();
        assert!(matches!(err, AgentError::AuditWriteFailure(_)));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_cancelled_command_is_still_audited() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });
        let ctx = ExecutionContext::new("s1", cancel);

        let err = f
            .executor
            .execute(&ctx, &ActionRequest::new("touch ran.txt; sleep 5"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
        assert!(f.root.join("ran.txt").exists());

        let entries = f.audit.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, actions::COMMAND_EXECUTED);
        assert_eq!(entries[0].outcome, Outcome::Failure);
        assert_eq!(entries[0].severity, Severity::Warn);
        assert_eq!(entries[0].details["cancelled"], true);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_audited() {
        let dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(MemoryAuditLog::new());
        let executor = ActionExecutor::new(
            SandboxPolicy::new(dir.path(), None).with_case_insensitive(false),
            Arc::new(ShellRunner::new("/nonexistent/shell", Duration::from_secs(5), 4096)),
            audit.clone(),
        );

        let err = executor.execute(&ctx(), &ActionRequest::new("echo hi")).await.unwrap_err();
        assert!(matches!(err, AgentError::Process(_)));
        let entries = audit.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome, Outcome::Failure);
        assert!(entries[0].details["error"].as_str().unwrap().contains("spawn"));
    }

    #[tokio::test]
    async fn test_cwd_hint() {
        let f = fixture();
        std::fs::create_dir(f.root.join("sub")).unwrap();
        let ok = f
            .executor
            .execute(&ctx(), &ActionRequest::new("pwd").with_cwd("sub"))
            .await
            .unwrap();
        assert!(ok.is_success());
        assert!(ok.stdout.trim().ends_with("sub"));

        let missing = f
            .executor
            .execute(&ctx(), &ActionRequest::new("pwd").with_cwd("nope"))
            .await
            .unwrap();
        assert!(missing.is_failure());

        let outside = f
            .executor
            .execute(&ctx(), &ActionRequest::new("pwd").with_cwd("/etc"))
            .await
            .unwrap();
        assert!(outside.is_denied());
    }

    #[tokio::test]
    async fn test_relative_traversal_is_denied() {
        let f = fixture();
        let result = f
            .executor
            .execute(&ctx(), &ActionRequest::new("cat ../../../etc/passwd"))
            .await
            .unwrap();
        assert!(result.is_denied());
    }
}
