//! 回合主循环（Orchestrator）
//!
//! Thinking → (Action → Observation → Thinking)* → Reflecting → Done；任何错误 → Aborted。
//! 每条指令一个独立的 tokio 任务，通过有界 mpsc 通道把 TurnEvent 推给调用方；回合内严格串行。
//! 只有 LLM 调用与子进程是挂起点，二者都受取消令牌约束。结束（Done / Aborted）时把本次记录追加到会话存储，
//! 然后才发出终止事件。LLM 调用从不自动重试；只有动作失败会进入有界自我修正。

use std::path::Path;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{AgentError, LoopPhase, TurnMachine};
use crate::llm::{ChatRequest, LlmClient, ModelRouter, RoutingDecision};
use crate::memory::{ActionRef, Message};
use crate::react::planner::{build_context, observation_message, parse_action, render_preamble};
use crate::react::{Reflector, TurnEvent, TurnStream};
use crate::session::{Session, SessionStore};
use crate::tools::{ExecutionContext, SelfCorrection};

/// 事件通道容量；调用方消费慢时循环在发送处等待（背压）
const EVENT_BUFFER: usize = 64;

/// 编排配置（构造时注入，循环内只读）
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_turns: usize,
    pub reflection_max_chars: usize,
    /// 已渲染的系统前言
    pub preamble: String,
}

impl OrchestratorConfig {
    /// workspace 为已解析的绝对工作区根
    pub fn from_config(config: &AppConfig, workspace: &Path) -> Self {
        Self {
            max_turns: config.orchestrator.max_turns.max(1),
            reflection_max_chars: config.orchestrator.reflection_max_chars,
            preamble: render_preamble(config.orchestrator.system_preamble.as_deref(), workspace),
        }
    }
}

#[derive(Clone, Copy)]
enum Fragment {
    Thought,
    Reflection,
}

impl Fragment {
    fn event(self, text: String) -> TurnEvent {
        match self {
            Fragment::Thought => TurnEvent::ThoughtFragment { text },
            Fragment::Reflection => TurnEvent::ReflectionFragment { text },
        }
    }
}

/// 单次指令的运行状态
struct TurnRun {
    session_id: String,
    instruction: String,
    decision: RoutingDecision,
    /// 发给模型的完整历史（会话历史 + 本次新消息）
    history: Vec<Message>,
    /// 本次新产生、结束时需要持久化的消息
    transcript: Vec<Message>,
    machine: TurnMachine,
    cancel: CancellationToken,
    tx: mpsc::Sender<TurnEvent>,
}

impl TurnRun {
    fn record(&mut self, message: Message) {
        self.history.push(message.clone());
        self.transcript.push(message);
    }

    /// 调用方已丢弃事件流时视为取消
    async fn emit(&self, event: TurnEvent) -> Result<(), AgentError> {
        self.tx.send(event).await.map_err(|_| AgentError::Cancelled)
    }
}

/// 编排器：路由 + LLM + 自我修正执行 + 会话存储
pub struct Orchestrator {
    llm: Arc<dyn LlmClient>,
    router: ModelRouter,
    reflector: Reflector,
    correction: Arc<SelfCorrection>,
    store: Arc<dyn SessionStore>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        router: ModelRouter,
        correction: Arc<SelfCorrection>,
        store: Arc<dyn SessionStore>,
        config: OrchestratorConfig,
    ) -> Self {
        let reflector = Reflector::new(router.clone(), config.reflection_max_chars);
        Self {
            llm,
            router,
            reflector,
            correction,
            store,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// 为一条指令启动新的有界循环；返回的事件流有限且不可重启。
    /// 取消 cancel 或丢弃事件流都会中止循环（LLM 请求被丢弃，子进程被 kill）。
    pub fn run(self: &Arc<Self>, session: Session, instruction: String, cancel: CancellationToken) -> TurnStream {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let loop_cancel = cancel.child_token();
        let decision = self.router.route(&instruction);
        tracing::info!(
            session_id = %session.id,
            model = %decision.model,
            category = ?decision.category,
            reason = %decision.reason,
            "instruction routed"
        );

        let run = TurnRun {
            session_id: session.id.clone(),
            instruction,
            decision,
            history: session.messages,
            transcript: Vec::new(),
            machine: TurnMachine::new(self.config.max_turns),
            cancel: loop_cancel.clone(),
            tx,
        };
        let this = Arc::clone(self);
        tokio::spawn(async move { this.drive(run).await });
        TurnStream::new(rx, loop_cancel)
    }

    async fn drive(&self, mut run: TurnRun) {
        let instruction = Message::user(run.instruction.clone());
        run.record(instruction);

        let outcome = self.turn_loop(&mut run).await;
        if outcome.is_err() && !run.machine.phase().is_terminal() {
            run.machine.advance(LoopPhase::Aborted);
        }
        let persisted = self.persist(&run).await;

        let terminal = match outcome.and(persisted) {
            Ok(()) => {
                tracing::info!(session_id = %run.session_id, turns = run.machine.turn(), "instruction done");
                TurnEvent::Done
            }
            Err(e) => {
                match &e {
                    AgentError::Cancelled => {
                        tracing::info!(session_id = %run.session_id, "instruction cancelled")
                    }
                    _ => tracing::error!(
                        session_id = %run.session_id,
                        turn = run.machine.turn(),
                        kind = e.kind(),
                        error = %e,
                        "instruction aborted"
                    ),
                }
                TurnEvent::Aborted {
                    kind: e.kind().to_string(),
                    reason: e.to_string(),
                }
            }
        };
        // 调用方可能已离开
        let _ = run.tx.send(terminal).await;
    }

    async fn turn_loop(&self, run: &mut TurnRun) -> Result<(), AgentError> {
        loop {
            let turn = run.machine.begin_turn()?;
            run.emit(TurnEvent::TurnStarted {
                turn,
                max_turns: run.machine.max_turns(),
            })
            .await?;

            let request = ChatRequest::new(
                run.decision.model.clone(),
                run.decision.temperature,
                build_context(&self.config.preamble, &run.history),
            );
            let thought = self.stream_fragments(run, &request, Fragment::Thought, None).await?;
            run.record(Message::assistant(thought.clone()));

            let Some(action) = parse_action(&thought) else {
                run.machine.advance(LoopPhase::Reflecting);
                self.reflect(run).await?;
                run.machine.advance(LoopPhase::Done);
                return Ok(());
            };

            run.machine.advance(LoopPhase::Acting);
            tracing::info!(session_id = %run.session_id, turn, command = %action.command, "action parsed");
            run.emit(TurnEvent::ActionStarted {
                command: action.command.clone(),
                cwd: action.cwd.clone(),
            })
            .await?;

            let ctx = ExecutionContext::new(run.session_id.clone(), run.cancel.clone());
            let result = self.correction.run(&ctx, action, &run.instruction).await?;

            run.machine.advance(LoopPhase::Observing);
            let text = result.observation_text();
            run.emit(TurnEvent::Observation {
                command: result.command.clone(),
                status: result.status,
                text: text.clone(),
            })
            .await?;
            run.record(
                Message::user(observation_message(&result.command, &text)).with_action(ActionRef {
                    command: result.command.clone(),
                    allowed: !result.is_denied(),
                    exit_code: result.exit_code,
                }),
            );
            run.machine.advance(LoopPhase::Thinking);
        }
    }

    async fn reflect(&self, run: &mut TurnRun) -> Result<(), AgentError> {
        let request = self.reflector.request(&run.transcript);
        let cap = Some(self.reflector.max_chars());
        let reflection = self.stream_fragments(run, &request, Fragment::Reflection, cap).await?;
        if !reflection.trim().is_empty() {
            run.record(Message::assistant(reflection));
        }
        Ok(())
    }

    /// 流式调用 LLM，边收边转发；cap 为字符上限（到达后丢弃流，即中断请求）
    async fn stream_fragments(
        &self,
        run: &TurnRun,
        request: &ChatRequest,
        kind: Fragment,
        cap: Option<usize>,
    ) -> Result<String, AgentError> {
        let mut stream = tokio::select! {
            s = self.llm.chat_stream(request) => s?,
            _ = run.cancel.cancelled() => return Err(AgentError::Cancelled),
        };

        let mut text = String::new();
        let mut count = 0usize;
        loop {
            let next = tokio::select! {
                n = stream.next() => n,
                _ = run.cancel.cancelled() => return Err(AgentError::Cancelled),
            };
            let Some(chunk) = next else { break };
            let mut chunk = chunk?;
            if let Some(cap) = cap {
                let room = cap.saturating_sub(count);
                if chunk.chars().count() > room {
                    chunk = chunk.chars().take(room).collect();
                }
            }
            if chunk.is_empty() {
                if cap.is_some_and(|c| count >= c) {
                    break;
                }
                continue;
            }
            count += chunk.chars().count();
            text.push_str(&chunk);
            run.emit(kind.event(chunk)).await?;
        }
        Ok(text)
    }

    /// 按回合顺序逐条追加到会话；取消或出错时也保存已完成的部分
    async fn persist(&self, run: &TurnRun) -> Result<(), AgentError> {
        for message in &run.transcript {
            self.store.append(&run.session_id, message.clone()).await?;
        }
        tracing::debug!(
            session_id = %run.session_id,
            messages = run.transcript.len(),
            "transcript persisted"
        );
        Ok(())
    }
}
