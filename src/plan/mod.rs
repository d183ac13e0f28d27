//! Plan-and-Execute：计划 → 执行 → 观察 → 重新规划 / 追问 → 最终回复

pub mod context;
pub mod engine;
pub mod events;
pub mod parse;
pub mod prompts;
pub mod step;

pub use context::{ExecutionContext, StepRecord};
pub use engine::{EngineState, PlanExecuteEngine, RunOutcome, ASK_USER_EXHAUSTED_REPLY};
pub use events::{EventSink, OrchestrationEvent};
pub use step::{StepExecutor, StepOutput};
