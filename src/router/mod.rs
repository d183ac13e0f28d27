//! 意图路由：Intent、路由输出解析、IntentRouter

pub mod intent;
pub mod intent_router;

pub use intent::{parse_route_output, Intent};
pub use intent_router::IntentRouter;
