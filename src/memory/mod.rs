//! 记忆层：对话消息模型与持久化辅助

pub mod conversation;
pub mod persistence;

pub use conversation::{ActionRef, Message, Role};
pub use persistence::{read_json, write_json_durable};
