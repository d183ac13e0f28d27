//! Skill Gateway - 多意图技能路由与 Plan-and-Execute 编排
//!
//! 模块划分：
//! - **agent**: 对外入口 SkillAgent（事件流 / 非流式 / 运维接口）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、I/O 许可池
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）、嵌入
//! - **mcp**: Tool Server 协议、HTTP 会话、多 Server 连接管理
//! - **memory**: 对话记忆、待办意图（内存 / SQLite）
//! - **skills**: SKILL.md 加载、技能目录、工具解析、候选检索
//! - **router**: 意图识别
//! - **plan**: Plan → Execute → Observe → RePlan 状态机与事件
//! - **scheduler**: 多意图串行调度与汇总

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod mcp;
pub mod memory;
pub mod observability;
pub mod plan;
pub mod router;
pub mod scheduler;
pub mod skills;

pub use agent::{AgentParts, HealthReport, SkillAgent, ToolInfo, TurnStream};
pub use plan::OrchestrationEvent;
