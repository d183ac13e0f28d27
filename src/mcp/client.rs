//! Tool Server 会话：抽象 + HTTP（Streamable HTTP / JSON-RPC）实现
//!
//! ToolServerConnector::connect 建立会话并完成 initialize 握手；ToolServerSession 负责
//! tools/list 与 tools/call。连接管理器只依赖这两个 trait，测试中可替换为进程内假实现。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderValue, ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::core::McpError;
use crate::mcp::protocol::{CallToolResult, ListToolsResult, McpRequest, McpResponse, McpTool};

const SESSION_HEADER: &str = "Mcp-Session-Id";
const CLIENT_NAME: &str = "skill-gateway";

/// 已建立的 Tool Server 会话
#[async_trait]
pub trait ToolServerSession: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<McpTool>, McpError>;

    /// 调用工具，返回文本内容；isError 为 true 时返回 Err
    async fn call_tool(&self, name: &str, args: Value) -> Result<String, McpError>;

    /// 关闭会话（尽力而为）
    async fn close(&self) -> Result<(), McpError>;
}

/// 按 endpoint 建立会话
#[async_trait]
pub trait ToolServerConnector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn ToolServerSession>, McpError>;
}

/// 基于 reqwest 的 HTTP 连接器
#[derive(Clone)]
pub struct HttpConnector {
    http: reqwest::Client,
    request_timeout: Duration,
}

impl HttpConnector {
    pub fn new(request_timeout_secs: u64) -> Self {
        Self {
            http: reqwest::Client::new(),
            request_timeout: Duration::from_secs(request_timeout_secs.max(1)),
        }
    }
}

#[async_trait]
impl ToolServerConnector for HttpConnector {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn ToolServerSession>, McpError> {
        let session = HttpSession {
            http: self.http.clone(),
            endpoint: endpoint.to_string(),
            timeout: self.request_timeout,
            session_id: RwLock::new(None),
            next_id: AtomicU64::new(1),
        };
        session.initialize().await?;
        Ok(Arc::new(session))
    }
}

/// 一个 HTTP 会话：POST JSON-RPC 到 endpoint，记住服务端分配的 Mcp-Session-Id
pub struct HttpSession {
    http: reqwest::Client,
    endpoint: String,
    timeout: Duration,
    session_id: RwLock<Option<String>>,
    next_id: AtomicU64,
}

impl HttpSession {
    async fn initialize(&self) -> Result<(), McpError> {
        let id = self.next_id();
        let result = self.request(McpRequest::initialize(id, CLIENT_NAME)).await?;
        tracing::debug!(
            endpoint = %self.endpoint,
            server_info = ?result.get("serverInfo"),
            "[MCP] initialize ok"
        );
        self.notify(McpRequest::notification("notifications/initialized"))
            .await
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn post(&self, body: &McpRequest) -> Result<reqwest::Response, McpError> {
        let mut req = self
            .http
            .post(&self.endpoint)
            .timeout(self.timeout)
            .header(
                ACCEPT,
                HeaderValue::from_static("application/json, text/event-stream"),
            )
            .json(body);
        if let Some(sid) = self.session_id.read().await.as_deref() {
            req = req.header(SESSION_HEADER, sid);
        }
        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                McpError::Transport(format!("request to {} timed out", self.endpoint))
            } else {
                McpError::Transport(e.to_string())
            }
        })?;

        if let Some(sid) = resp
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.write().await = Some(sid.to_string());
        }

        if !resp.status().is_success() {
            return Err(McpError::Transport(format!(
                "{} returned HTTP {}",
                self.endpoint,
                resp.status()
            )));
        }
        Ok(resp)
    }

    async fn request(&self, body: McpRequest) -> Result<Value, McpError> {
        let id = body.id;
        let resp = self.post(&body).await?;
        let is_sse = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("text/event-stream"))
            .unwrap_or(false);
        let text = resp
            .text()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;

        let response = if is_sse {
            parse_sse_response(&text, id)?
        } else {
            serde_json::from_str::<McpResponse>(&text)
                .map_err(|e| McpError::Protocol(format!("invalid JSON-RPC response: {e}")))?
        };
        response.into_result()
    }

    async fn notify(&self, body: McpRequest) -> Result<(), McpError> {
        self.post(&body).await.map(|_| ())
    }
}

#[async_trait]
impl ToolServerSession for HttpSession {
    async fn list_tools(&self) -> Result<Vec<McpTool>, McpError> {
        let result = self.request(McpRequest::list_tools(self.next_id())).await?;
        let list: ListToolsResult = serde_json::from_value(result)
            .map_err(|e| McpError::Protocol(format!("invalid tools/list result: {e}")))?;
        Ok(list.tools)
    }

    async fn call_tool(&self, name: &str, args: Value) -> Result<String, McpError> {
        let result = self
            .request(McpRequest::call_tool(self.next_id(), name, args))
            .await?;
        let call: CallToolResult = serde_json::from_value(result)
            .map_err(|e| McpError::Protocol(format!("invalid tools/call result: {e}")))?;
        if call.is_error {
            return Err(McpError::Rpc {
                code: -1,
                message: call.text(),
            });
        }
        Ok(call.text())
    }

    async fn close(&self) -> Result<(), McpError> {
        let sid = self.session_id.write().await.take();
        let Some(sid) = sid else {
            return Ok(());
        };
        self.http
            .delete(&self.endpoint)
            .timeout(self.timeout)
            .header(SESSION_HEADER, sid)
            .send()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        Ok(())
    }
}

/// 从 SSE 响应体中取出与 id 对应的 JSON-RPC 响应（`data:` 行）
pub fn parse_sse_response(body: &str, id: Option<u64>) -> Result<McpResponse, McpError> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .filter_map(|data| serde_json::from_str::<McpResponse>(data.trim()).ok())
        .find(|resp| id.is_none() || resp.id == id)
        .ok_or_else(|| McpError::Protocol("no JSON-RPC response in event stream".into()))
}
