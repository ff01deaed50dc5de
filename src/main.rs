//! Warden - 本地智能体编排核心（无界面入口）
//!
//! 初始化日志与配置，创建一个会话，把 stdin 的每一行作为一条指令运行，边流式输出边打印。
//! Ctrl-C 取消当前指令。

use std::io::Write;

use anyhow::Context;
use futures_util::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use warden::config::load_config;
use warden::session::Metadata;
use warden::{observability, Agent, TurnEvent};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config = load_config(None).context("Failed to load config")?;
    let agent = Agent::from_config(config)
        .await
        .context("Failed to create agent")?;

    let mut metadata = Metadata::new();
    metadata.insert("origin".to_string(), "stdin".to_string());
    let session_id = agent
        .create_session(metadata)
        .await
        .context("Failed to create session")?;
    tracing::info!(session_id = %session_id, workspace = %agent.workspace().display(), "ready");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let instruction = line.trim();
        if instruction.is_empty() {
            continue;
        }

        let cancel = CancellationToken::new();
        let mut events = agent
            .run_instruction(&session_id, instruction, cancel.clone())
            .await
            .context("Failed to start instruction")?;

        loop {
            let event = tokio::select! {
                event = events.next() => event,
                _ = tokio::signal::ctrl_c() => {
                    cancel.cancel();
                    continue;
                }
            };
            let Some(event) = event else { break };
            print_event(&event)?;
        }
    }
    Ok(())
}

fn print_event(event: &TurnEvent) -> anyhow::Result<()> {
    let mut out = std::io::stdout().lock();
    match event {
        TurnEvent::TurnStarted { turn, max_turns } => writeln!(out, "\n[turn {}/{}]", turn, max_turns)?,
        TurnEvent::ThoughtFragment { text } | TurnEvent::ReflectionFragment { text } => write!(out, "{}", text)?,
        TurnEvent::ActionStarted { command, .. } => writeln!(out, "\n$ {}", command)?,
        TurnEvent::Observation { text, .. } => writeln!(out, "{}", text)?,
        TurnEvent::Done => writeln!(out, "\n[done]")?,
        TurnEvent::Aborted { kind, reason } => writeln!(out, "\n[aborted: {}] {}", kind, reason)?,
    }
    out.flush()?;
    Ok(())
}
