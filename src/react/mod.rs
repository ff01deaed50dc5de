//! 认知层：回合事件、动作解析、反思与主循环

pub mod events;
pub mod loop_;
pub mod planner;
pub mod reflection;

pub use events::{TurnEvent, TurnStream};
pub use loop_::{Orchestrator, OrchestratorConfig};
pub use planner::parse_action;
pub use reflection::Reflector;
