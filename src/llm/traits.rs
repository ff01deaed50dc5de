//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient：chat_stream 返回惰性、有限、不可重启的分片流。
//! 丢弃流即取消底层请求；调用方通过 select! 配合 CancellationToken 实现中途取消。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use thiserror::Error;

use crate::memory::Message;

/// 后端错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("stream interrupted: {0}")]
    Stream(String),

    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// 流式分片
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// 单次对话请求：模型 + 采样温度 + 有序消息
#[derive(Clone, Debug, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub temperature: f32,
    pub messages: Vec<Message>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, temperature: f32, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            temperature,
            messages,
        }
    }
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 流式对话
    async fn chat_stream(&self, request: &ChatRequest) -> Result<TokenStream, LlmError>;

    /// 非流式完成：默认收集整个流
    async fn complete(&self, request: &ChatRequest) -> Result<String, LlmError> {
        let mut stream = self.chat_stream(request).await?;
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            out.push_str(&chunk?);
        }
        Ok(out)
    }
}
