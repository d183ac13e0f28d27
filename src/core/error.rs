//! 错误类型
//!
//! LlmError 在 llm::traits 中定义；这里是 Tool Server 连接错误（McpError）与编排错误（AgentError）。

use thiserror::Error;

use crate::llm::LlmError;

/// Tool Server（MCP）相关错误：连接、超时、RPC 错误、全部不可用
#[derive(Error, Debug, Clone)]
pub enum McpError {
    #[error("Unknown server: {0}")]
    UnknownServer(String),

    #[error("Server [{0}] is not connected")]
    NotConnected(String),

    #[error("Failed to connect server [{server}]: {reason}")]
    Connect { server: String, reason: String },

    #[error("Server [{server}] timed out after {secs}s")]
    Timeout { server: String, secs: u64 },

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("所有 MCP Server 均不可用")]
    AllServersUnavailable,
}

/// 编排过程中的错误（路由、规划、汇总、存储）
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("MCP error: {0}")]
    Mcp(#[from] McpError),

    #[error("Skill not found: {0}")]
    SkillNotFound(String),

    #[error("No fallback skill configured")]
    NoFallbackSkill,

    #[error("Store error: {0}")]
    Store(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Cancelled")]
    Cancelled,
}
