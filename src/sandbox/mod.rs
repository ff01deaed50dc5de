//! 沙箱层：纯函数式的路径与命令校验（无状态，无需加锁）

mod command;
mod validator;

pub use command::{destructive_pattern, extract_paths, DenialKind};
pub use validator::{normalize, SandboxPolicy, SandboxVerdict};
