//! 回合事件：调用方按顺序消费的惰性事件序列
//!
//! 可序列化为带 type 标签的 JSON，便于传输层（WebSocket / SSE / 聊天桥）直接转发。

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::tools::ActionStatus;

/// 单步过程事件
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// 开始第几回合（从 1 开始）
    TurnStarted { turn: usize, max_turns: usize },
    /// Thought 的一段流式文本
    ThoughtFragment { text: String },
    /// 解析出动作、即将交给执行器
    ActionStarted { command: String, cwd: Option<String> },
    /// 动作结果（含拒绝）
    Observation {
        command: String,
        status: ActionStatus,
        text: String,
    },
    /// Reflection 的一段流式文本
    ReflectionFragment { text: String },
    /// 正常结束
    Done,
    /// 中止：kind 为 AgentError::kind()，reason 为可读原因
    Aborted { kind: String, reason: String },
}

impl TurnEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnEvent::Done | TurnEvent::Aborted { .. })
    }

    /// 面向纯文本调用方的片段
    pub fn as_text(&self) -> Option<&str> {
        match self {
            TurnEvent::ThoughtFragment { text } | TurnEvent::ReflectionFragment { text } => Some(text.as_str()),
            TurnEvent::Observation { text, .. } => Some(text.as_str()),
            TurnEvent::Aborted { reason, .. } => Some(reason.as_str()),
            _ => None,
        }
    }
}

/// 回合事件流：有限、不可重启；丢弃即取消正在进行的循环（含 LLM 请求与子进程）
pub struct TurnStream {
    rx: mpsc::Receiver<TurnEvent>,
    _guard: DropGuard,
}

impl TurnStream {
    pub(crate) fn new(rx: mpsc::Receiver<TurnEvent>, cancel: CancellationToken) -> Self {
        Self {
            rx,
            _guard: cancel.drop_guard(),
        }
    }

    /// 收集到结束（测试与无界面调用方使用）
    pub async fn collect_all(mut self) -> Vec<TurnEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.rx.recv().await {
            events.push(event);
        }
        events
    }
}

impl Stream for TurnStream {
    type Item = TurnEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<TurnEvent>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_with_type_tag() {
        let v = serde_json::to_value(TurnEvent::Aborted {
            kind: "turn_limit_exceeded".to_string(),
            reason: "limit".to_string(),
        })
        .unwrap();
        assert_eq!(v["type"], "aborted");
        assert_eq!(v["kind"], "turn_limit_exceeded");

        let v = serde_json::to_value(TurnEvent::ThoughtFragment { text: "hi".to_string() }).unwrap();
        assert_eq!(v["type"], "thought_fragment");
    }

    #[tokio::test]
    async fn test_dropping_stream_cancels() {
        let (_tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let stream = TurnStream::new(rx, cancel.clone());
        assert!(!cancel.is_cancelled());
        drop(stream);
        assert!(cancel.is_cancelled());
    }
}
