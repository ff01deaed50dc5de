//! LLM 层：客户端抽象、实现（OpenAI 兼容 / Mock）与模型路由

pub mod mock;
pub mod openai;
pub mod router;
pub mod traits;

pub use mock::MockLlmClient;
pub use openai::OpenAiClient;
pub use router::{ModelRouter, ModelSet, RoutingDecision, TaskCategory, TaskClassifier};
pub use traits::{ChatRequest, LlmClient, LlmError, TokenStream};
