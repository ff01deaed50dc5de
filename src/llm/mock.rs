//! Mock LLM 客户端（用于测试与无 API Key 的本地运行）
//!
//! 按脚本依次返回回复（或错误），脚本用完后重复固定回复或回显最后一条 User 消息；
//! 每个回复切成小段模拟流式输出，并记录收到的每个请求便于断言。

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};

use crate::llm::{ChatRequest, LlmClient, LlmError, TokenStream};
use crate::memory::Role;

/// 流式回复时每段字符数
const CHUNK_CHARS: usize = 8;

/// Mock 客户端
#[derive(Debug, Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    /// 脚本耗尽后的固定回复；None 时回显
    fallback: Option<String>,
    requests: Mutex<Vec<ChatRequest>>,
    chunk_delay: Option<Duration>,
}

impl MockLlmClient {
    /// 回显模式：回复最后一条 User 消息（不含 Action 行）
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let client = Self::default();
        for r in replies {
            client.push_reply(r);
        }
        client
    }

    /// 每次都返回同一回复（用于验证回合上限）
    pub fn repeating(reply: impl Into<String>) -> Self {
        Self {
            fallback: Some(reply.into()),
            ..Self::default()
        }
    }

    /// 每个分片之间等待，便于测试中途取消
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        self.script_guard().push_back(Ok(reply.into()));
    }

    pub fn push_error(&self, err: LlmError) {
        self.script_guard().push_back(Err(err));
    }

    /// 已收到的请求（按顺序）
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    fn script_guard(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<String, LlmError>>> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_reply(&self, request: &ChatRequest) -> Result<String, LlmError> {
        if let Some(next) = self.script_guard().pop_front() {
            return next;
        }
        if let Some(fallback) = &self.fallback {
            return Ok(fallback.clone());
        }
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        Ok(format!("Echo from Mock: {}", last_user))
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn chat_stream(&self, request: &ChatRequest) -> Result<TokenStream, LlmError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        let reply = self.next_reply(request)?;
        let chars: Vec<char> = reply.chars().collect();
        let chunks: Vec<String> = chars
            .chunks(CHUNK_CHARS)
            .map(|c| c.iter().collect())
            .collect();

        match self.chunk_delay {
            None => Ok(Box::pin(stream::iter(chunks.into_iter().map(Ok::<_, LlmError>)))),
            Some(delay) => Ok(Box::pin(stream::iter(chunks).then(move |c| async move {
                tokio::time::sleep(delay).await;
                Ok::<_, LlmError>(c)
            }))),
        }
    }
}
