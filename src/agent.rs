//! Agent 运行时：调用方入口
//!
//! AgentBuilder 把配置转换为各组件自己的配置值（SandboxPolicy、ShellRunner、ModelSet、OrchestratorConfig），
//! 并允许替换 LLM、会话存储、审计汇、子进程执行器与回滚能力（测试与嵌入场景）。
//! Agent 暴露 create_session / list_sessions / run_instruction 三个调用方接口。

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::audit::{AuditSink, JsonlAuditLog};
use crate::config::AppConfig;
use crate::core::{AgentError, RecoveryEngine};
use crate::llm::{LlmClient, MockLlmClient, ModelRouter, ModelSet, OpenAiClient};
use crate::react::{Orchestrator, OrchestratorConfig, TurnStream};
use crate::sandbox::{normalize, SandboxPolicy};
use crate::session::{FileSessionStore, Metadata, Session, SessionId, SessionStore, SessionSummary};
use crate::tools::{ActionExecutor, CommandRunner, Rollback, SelfCorrection, ShellRunner};

/// 根据 [llm] 配置创建客户端；provider 为 mock 或缺少 API Key 时退回 Mock
pub fn llm_from_config(config: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = config.llm.provider.to_lowercase();
    if provider == "mock" {
        tracing::info!("Using Mock LLM (configured)");
        return Arc::new(MockLlmClient::new());
    }
    match std::env::var(&config.llm.api_key_env) {
        Ok(key) if !key.trim().is_empty() => {
            tracing::info!(
                base_url = config.llm.base_url.as_deref().unwrap_or("default"),
                "Using OpenAI-compatible LLM"
            );
            Arc::new(OpenAiClient::from_config(&config.llm, key.trim()))
        }
        _ => {
            tracing::warn!(
                env = %config.llm.api_key_env,
                "No API key set, using Mock LLM"
            );
            Arc::new(MockLlmClient::new())
        }
    }
}

/// 根据配置构建沙箱策略：工作区根 + 状态目录 + 临时目录 + 额外目录；审计日志与会话目录受保护
pub fn sandbox_from_config(config: &AppConfig, workspace: &std::path::Path) -> SandboxPolicy {
    let audit_log = config.audit_log_path();
    let sessions_dir = config.sessions_dir();
    if audit_log.starts_with(workspace) || sessions_dir.starts_with(workspace) {
        tracing::warn!(
            workspace = %workspace.display(),
            "audit log or sessions dir inside the workspace; relative paths can reach them"
        );
    }
    let mut policy = SandboxPolicy::new(workspace, dirs::home_dir())
        .with_allowed_dir(config.state_dir())
        .with_allowed_dir(config.scratch_dir())
        .with_protected_path(audit_log)
        .with_protected_path(sessions_dir);
    for dir in &config.sandbox.extra_allowed_dirs {
        policy = policy.with_allowed_dir(dir);
    }
    if let Some(case_insensitive) = config.sandbox.case_insensitive {
        policy = policy.with_case_insensitive(case_insensitive);
    }
    policy
}

/// Agent 构建器
pub struct AgentBuilder {
    config: AppConfig,
    llm: Option<Arc<dyn LlmClient>>,
    store: Option<Arc<dyn SessionStore>>,
    audit: Option<Arc<dyn AuditSink>>,
    runner: Option<Arc<dyn CommandRunner>>,
    rollback: Option<Arc<dyn Rollback>>,
    policy: Option<SandboxPolicy>,
}

impl AgentBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm: None,
            store: None,
            audit: None,
            runner: None,
            rollback: None,
            policy: None,
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn with_rollback(mut self, rollback: Arc<dyn Rollback>) -> Self {
        self.rollback = Some(rollback);
        self
    }

    /// 覆盖由配置推导的沙箱策略
    pub fn with_sandbox(mut self, policy: SandboxPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    fn workspace(&self) -> Result<PathBuf, AgentError> {
        let root = self.config.workspace_root();
        if root.is_absolute() {
            return Ok(normalize(&root));
        }
        std::env::current_dir()
            .map(|cwd| normalize(&cwd.join(root)))
            .map_err(|e| AgentError::ConfigError(format!("cannot resolve workspace root: {}", e)))
    }

    pub async fn build(self) -> Result<Agent, AgentError> {
        let workspace = self.workspace()?;
        tokio::fs::create_dir_all(&workspace).await.map_err(|e| {
            AgentError::Storage(format!("cannot create workspace {}: {}", workspace.display(), e))
        })?;

        let store: Arc<dyn SessionStore> = match self.store {
            Some(store) => store,
            None => Arc::new(FileSessionStore::open(self.config.sessions_dir()).await?),
        };
        let audit: Arc<dyn AuditSink> = match self.audit {
            Some(audit) => audit,
            None => Arc::new(JsonlAuditLog::open(self.config.audit_log_path()).await?),
        };
        let llm = self.llm.unwrap_or_else(|| llm_from_config(&self.config));
        let runner = self
            .runner
            .unwrap_or_else(|| Arc::new(ShellRunner::from_config(&self.config.executor)));
        let policy = self
            .policy
            .unwrap_or_else(|| sandbox_from_config(&self.config, &workspace));

        let router = ModelRouter::new(ModelSet::from(&self.config.llm.models));
        let executor = Arc::new(ActionExecutor::new(policy, runner, audit));
        let correction = SelfCorrection::new(
            executor,
            llm.clone(),
            router.clone(),
            RecoveryEngine::new(self.config.executor.max_attempts),
        )
        .with_rollback(self.rollback);

        let orchestrator_config = OrchestratorConfig::from_config(&self.config, &workspace);
        tracing::info!(workspace = %workspace.display(), "agent ready");

        Ok(Agent {
            orchestrator: Arc::new(Orchestrator::new(
                llm,
                router,
                Arc::new(correction),
                store.clone(),
                orchestrator_config,
            )),
            store,
            workspace,
        })
    }
}

/// Agent：多会话共享；每条指令一个独立的回合循环
pub struct Agent {
    orchestrator: Arc<Orchestrator>,
    store: Arc<dyn SessionStore>,
    workspace: PathBuf,
}

impl Agent {
    /// 按配置构建（文件会话存储 + JSONL 审计 + 配置指定的 LLM）
    pub async fn from_config(config: AppConfig) -> Result<Self, AgentError> {
        AgentBuilder::new(config).build().await
    }

    pub fn workspace(&self) -> &std::path::Path {
        &self.workspace
    }

    pub async fn create_session(&self, metadata: Metadata) -> Result<SessionId, AgentError> {
        Ok(self.store.create(metadata).await?.id)
    }

    pub async fn session(&self, id: &str) -> Result<Session, AgentError> {
        self.store.get(id).await
    }

    /// 会话摘要，最近活跃在前
    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>, AgentError> {
        Ok(self.store.list().await?.iter().map(Session::summary).collect())
    }

    /// 对会话运行一条指令；未知会话立即返回 SessionNotFound，其余错误以 Aborted 事件结束事件流
    pub async fn run_instruction(
        &self,
        session_id: &str,
        text: &str,
        cancel: CancellationToken,
    ) -> Result<TurnStream, AgentError> {
        let session = self.store.get(session_id).await?;
        Ok(self.orchestrator.run(session, text.to_string(), cancel))
    }
}
