//! 核心层：错误类型与 I/O 调度

pub mod error;
pub mod task_scheduler;

pub use error::{AgentError, McpError};
pub use task_scheduler::{ScheduledLlmClient, TaskKind, TaskScheduler};
