//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 流式调用任意 OpenAI 兼容端点（可配置 base_url），本地 Ollama / vLLM / 代理均可。
//! 首个分片受 request 超时约束，之后每两个分片之间受 stream 空闲超时约束；丢弃流即中断 HTTP 请求。

use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use futures_util::{stream, StreamExt};

use crate::config::LlmSection;
use crate::llm::{ChatRequest, LlmClient, LlmError, TokenStream};
use crate::memory::{Message, Role};

/// OpenAI 兼容客户端：持有 Client 与两段超时
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    request_timeout: Duration,
    stream_timeout: Duration,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, api_key: &str) -> Self {
        let config = match base_url {
            Some(url) => OpenAIConfig::new().with_api_base(url).with_api_key(api_key),
            None => OpenAIConfig::new().with_api_key(api_key),
        };
        Self {
            client: Client::with_config(config),
            request_timeout: Duration::from_secs(60),
            stream_timeout: Duration::from_secs(120),
        }
    }

    /// 从 [llm] 配置段构造；API Key 从 api_key_env 指定的环境变量读取
    pub fn from_config(section: &LlmSection, api_key: &str) -> Self {
        Self::new(section.base_url.as_deref(), api_key).with_timeouts(
            Duration::from_secs(section.timeouts.request),
            Duration::from_secs(section.timeouts.stream),
        )
    }

    pub fn with_timeouts(mut self, request: Duration, stream: Duration) -> Self {
        self.request_timeout = request;
        self.stream_timeout = stream;
        self
    }

    fn to_openai_messages(
        messages: &[Message],
    ) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        let invalid = |e: OpenAIError| LlmError::InvalidRequest(e.to_string());
        messages
            .iter()
            .map(|m| {
                Ok(match m.role {
                    Role::System => ChatCompletionRequestMessage::System(
                        ChatCompletionRequestSystemMessageArgs::default()
                            .content(m.content.clone())
                            .build()
                            .map_err(invalid)?,
                    ),
                    Role::User => ChatCompletionRequestMessage::User(
                        ChatCompletionRequestUserMessageArgs::default()
                            .content(m.content.clone())
                            .build()
                            .map_err(invalid)?,
                    ),
                    Role::Assistant => ChatCompletionRequestMessage::Assistant(
                        ChatCompletionRequestAssistantMessageArgs::default()
                            .content(m.content.clone())
                            .build()
                            .map_err(invalid)?,
                    ),
                })
            })
            .collect()
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn chat_stream(&self, request: &ChatRequest) -> Result<TokenStream, LlmError> {
        let body = CreateChatCompletionRequestArgs::default()
            .model(&request.model)
            .temperature(request.temperature)
            .messages(Self::to_openai_messages(&request.messages)?)
            .stream(true)
            .build()
            .map_err(|e| LlmError::InvalidRequest(e.to_string()))?;

        let inner = self
            .client
            .chat()
            .create_stream(body)
            .await
            .map_err(|e| match e {
                OpenAIError::ApiError(_) => LlmError::ApiError(e.to_string()),
                other => LlmError::Unreachable(other.to_string()),
            })?;

        let first = self.request_timeout;
        let idle = self.stream_timeout;

        // (底层流, 是否已收到首个分片, 是否已结束)
        let tokens = stream::unfold((inner, false, false), move |(mut inner, started, done)| async move {
            if done {
                return None;
            }
            let limit = if started { idle } else { first };
            match tokio::time::timeout(limit, inner.next()).await {
                Err(_) => Some((Err(LlmError::Timeout(limit.as_secs())), (inner, started, true))),
                Ok(None) => None,
                Ok(Some(Err(e))) => Some((Err(LlmError::Stream(e.to_string())), (inner, started, true))),
                Ok(Some(Ok(chunk))) => {
                    let text: String = chunk
                        .choices
                        .iter()
                        .filter_map(|c| c.delta.content.as_deref())
                        .collect();
                    Some((Ok(text), (inner, true, false)))
                }
            }
        })
        .filter(|item| {
            let keep = !matches!(item, Ok(text) if text.is_empty());
            async move { keep }
        });

        Ok(Box::pin(tokens))
    }
}
