//! MCP 层：JSON-RPC 协议类型、Tool Server 会话（HTTP）、多 Server 连接管理

pub mod client;
pub mod manager;
pub mod protocol;

pub use client::{HttpConnector, HttpSession, ToolServerConnector, ToolServerSession};
pub use manager::{ConnectionState, ToolConnectionManager, ToolProvider};
pub use protocol::{McpTool, ToolHandle};
