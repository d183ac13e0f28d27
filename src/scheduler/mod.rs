//! 多意图调度：串行执行、追问提前终止与待办保存、结果汇总

pub mod multi_intent;

pub use multi_intent::{merge_intents, BatchOutcome, MultiIntentScheduler};
