//! 动作执行层：子进程、沙箱化执行器与自我修正

pub mod correction;
pub mod executor;
pub mod shell;

pub use correction::{Rollback, SelfCorrection};
pub use executor::{ActionExecutor, ActionRequest, ActionResult, ActionStatus, ExecutionContext};
pub use shell::{CommandRunner, ProcessOutput, ShellRunner};
