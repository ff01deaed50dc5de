//! 核心层：错误分类、恢复策略、回合状态机

pub mod error;
pub mod recovery;
pub mod state;

pub use error::{AgentError, RecoveryAction};
pub use recovery::RecoveryEngine;
pub use state::{LoopPhase, TurnMachine};
