//! Warden - 本地智能体编排核心
//!
//! 模块划分：
//! - **agent**: 面向调用方的门面（创建会话、列出会话、运行指令）与构建器
//! - **audit**: 追加写、不可变的结构化审计日志
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、恢复策略、回合状态机
//! - **llm**: LLM 后端抽象与实现（OpenAI 兼容 / Mock）与模型路由
//! - **memory**: 消息模型与持久化辅助
//! - **observability**: tracing 初始化
//! - **react**: Thought → Action → Observation → Reflection 主循环
//! - **sandbox**: 纯函数式路径 / 命令校验
//! - **session**: 会话存储（持久化 / 内存）
//! - **tools**: 动作执行器、子进程执行、自我修正

pub mod agent;
pub mod audit;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod sandbox;
pub mod session;
pub mod tools;

pub use agent::{Agent, AgentBuilder};
pub use core::AgentError;
pub use react::{TurnEvent, TurnStream};
