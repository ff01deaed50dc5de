//! 会话层：会话记录与持久存储

mod model;
mod store;

pub use model::{Metadata, Session, SessionId, SessionSummary};
pub use store::{FileSessionStore, MemorySessionStore, SessionStore};
