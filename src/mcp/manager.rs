//! Tool Server 连接管理
//!
//! 每个配置的 Server 一条逻辑连接；连接/断开/重连在同一把生命周期锁下串行执行。
//! get_all_tools 按配置顺序聚合各 Server 的工具列表：单个 Server 失败时重连并重试一次，
//! 仍失败则跳过该 Server，只有全部 Server 都没有贡献工具时才返回错误。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;

use crate::config::{McpSection, McpServerSection};
use crate::core::{McpError, TaskKind, TaskScheduler};
use crate::mcp::client::{ToolServerConnector, ToolServerSession};
use crate::mcp::protocol::ToolHandle;

/// 编排层看到的工具来源：在线工具列表 + 调用
#[async_trait]
pub trait ToolProvider: Send + Sync {
    async fn all_tools(&self) -> Result<Vec<ToolHandle>, McpError>;

    async fn invoke(&self, handle: &ToolHandle, args: Value) -> Result<String, McpError>;
}

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// 一个 Server 的连接
struct ServerConnection {
    endpoint: String,
    state: ConnectionState,
    session: Option<Arc<dyn ToolServerSession>>,
}

pub struct ToolConnectionManager {
    /// 配置顺序即同名工具的优先级
    servers: Vec<McpServerSection>,
    connector: Arc<dyn ToolServerConnector>,
    connections: RwLock<HashMap<String, ServerConnection>>,
    lifecycle: Mutex<()>,
    fetch_timeout: Duration,
    request_timeout: Duration,
    scheduler: TaskScheduler,
}

impl ToolConnectionManager {
    pub fn new(
        cfg: &McpSection,
        connector: Arc<dyn ToolServerConnector>,
        scheduler: TaskScheduler,
    ) -> Self {
        Self {
            servers: cfg.servers.clone(),
            connector,
            connections: RwLock::new(HashMap::new()),
            lifecycle: Mutex::new(()),
            fetch_timeout: Duration::from_secs(cfg.fetch_timeout_secs.max(1)),
            request_timeout: Duration::from_secs(cfg.request_timeout_secs.max(1)),
            scheduler,
        }
    }

    pub fn server_names(&self) -> Vec<String> {
        self.servers.iter().map(|s| s.name.clone()).collect()
    }

    /// 启动时连接所有 Server；单个失败只记录日志
    pub async fn connect_all(&self) {
        let _guard = self.lifecycle.lock().await;
        for server in &self.servers {
            if let Err(e) = self.connect_locked(server).await {
                tracing::error!(server = %server.name, error = %e, "[MCP] 连接失败");
            }
        }
    }

    /// 当前状态；未出现在连接表中视为 Disconnected
    pub async fn state(&self, name: &str) -> ConnectionState {
        self.connections
            .read()
            .await
            .get(name)
            .map(|c| c.state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// 所有配置的 Server 及其状态（按配置顺序）
    pub async fn states(&self) -> Vec<(String, ConnectionState)> {
        let mut out = Vec::with_capacity(self.servers.len());
        for server in &self.servers {
            out.push((server.name.clone(), self.state(&server.name).await));
        }
        out
    }

    /// 断开并重连单个 Server，返回重连后是否可用
    pub async fn reconnect(&self, name: &str) -> bool {
        let Some(server) = self.servers.iter().find(|s| s.name == name) else {
            tracing::warn!(server = %name, "[MCP] 未配置的 Server，忽略重连");
            return false;
        };
        let _guard = self.lifecycle.lock().await;
        self.disconnect_locked(name).await;
        match self.connect_locked(server).await {
            Ok(()) => {
                tracing::info!(server = %name, "[MCP] 重连成功");
                true
            }
            Err(e) => {
                tracing::error!(server = %name, error = %e, "[MCP] 重连失败");
                false
            }
        }
    }

    /// 逐个重连所有 Server，互不影响
    pub async fn reconnect_all(&self) -> Vec<(String, bool)> {
        let mut results = Vec::with_capacity(self.servers.len());
        for name in self.server_names() {
            let ok = self.reconnect(&name).await;
            results.push((name, ok));
        }
        results
    }

    /// 聚合所有 Server 的工具（按配置顺序）
    pub async fn get_all_tools(&self) -> Result<Vec<ToolHandle>, McpError> {
        let mut all = Vec::new();
        for server in &self.servers {
            match self.fetch_with_retry(&server.name).await {
                Ok(tools) => {
                    tracing::debug!(server = %server.name, count = tools.len(), "[MCP] 获取工具");
                    all.extend(tools);
                }
                Err(e) => {
                    tracing::warn!(server = %server.name, error = %e, "[MCP] 跳过不可用的 Server");
                }
            }
        }
        if all.is_empty() {
            tracing::error!("[MCP] 所有 MCP Server 均不可用");
            return Err(McpError::AllServersUnavailable);
        }
        Ok(all)
    }

    async fn fetch_with_retry(&self, name: &str) -> Result<Vec<ToolHandle>, McpError> {
        let first = match self.session(name).await {
            Some(session) => self.fetch_tools(name, session).await,
            None => Err(McpError::NotConnected(name.to_string())),
        };
        match first {
            Ok(tools) => Ok(tools),
            Err(e) => {
                tracing::warn!(server = %name, error = %e, "[MCP] 获取工具失败，尝试重连");
                if !self.reconnect(name).await {
                    return Err(e);
                }
                let session = self
                    .session(name)
                    .await
                    .ok_or_else(|| McpError::NotConnected(name.to_string()))?;
                self.fetch_tools(name, session).await
            }
        }
    }

    async fn fetch_tools(
        &self,
        name: &str,
        session: Arc<dyn ToolServerSession>,
    ) -> Result<Vec<ToolHandle>, McpError> {
        let _permit = self
            .scheduler
            .acquire(TaskKind::ToolCatalog)
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        let tools = timeout(self.fetch_timeout, session.list_tools())
            .await
            .map_err(|_| McpError::Timeout {
                server: name.to_string(),
                secs: self.fetch_timeout.as_secs(),
            })??;
        Ok(tools
            .into_iter()
            .map(|t| ToolHandle::from_mcp(name, t))
            .collect())
    }

    /// 调用远程工具；输出一条 JSON 审计日志
    pub async fn call_tool(&self, handle: &ToolHandle, args: Value) -> Result<String, McpError> {
        if !self.servers.iter().any(|s| s.name == handle.server) {
            return Err(McpError::UnknownServer(handle.server.clone()));
        }
        let session = self
            .session(&handle.server)
            .await
            .ok_or_else(|| McpError::NotConnected(handle.server.clone()))?;
        let _permit = self
            .scheduler
            .acquire(TaskKind::ToolCall)
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;

        let start = Instant::now();
        let args_preview = args_preview(&args);
        let result = timeout(
            self.request_timeout,
            session.call_tool(&handle.qualified_name, args),
        )
        .await;

        let outcome = match &result {
            Ok(Ok(_)) => "ok",
            Ok(Err(_)) => "error",
            Err(_) => "timeout",
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": handle.qualified_name,
            "server": handle.server,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "[MCP] 工具审计");

        match result {
            Ok(r) => r,
            Err(_) => Err(McpError::Timeout {
                server: handle.server.clone(),
                secs: self.request_timeout.as_secs(),
            }),
        }
    }

    /// 关闭所有会话
    pub async fn shutdown(&self) {
        let _guard = self.lifecycle.lock().await;
        for name in self.server_names() {
            self.disconnect_locked(&name).await;
        }
        tracing::info!("[MCP] 所有连接已关闭");
    }

    async fn session(&self, name: &str) -> Option<Arc<dyn ToolServerSession>> {
        self.connections
            .read()
            .await
            .get(name)
            .filter(|c| c.state == ConnectionState::Connected)
            .and_then(|c| c.session.clone())
    }

    /// 调用方须持有 lifecycle 锁
    async fn connect_locked(&self, server: &McpServerSection) -> Result<(), McpError> {
        let connected = timeout(self.request_timeout, self.connector.connect(&server.url))
            .await
            .map_err(|_| McpError::Timeout {
                server: server.name.clone(),
                secs: self.request_timeout.as_secs(),
            })?
            .map_err(|e| McpError::Connect {
                server: server.name.clone(),
                reason: e.to_string(),
            })?;
        self.connections.write().await.insert(
            server.name.clone(),
            ServerConnection {
                endpoint: server.url.clone(),
                state: ConnectionState::Connected,
                session: Some(connected),
            },
        );
        tracing::info!(server = %server.name, endpoint = %server.url, "[MCP] 已连接");
        Ok(())
    }

    /// 调用方须持有 lifecycle 锁；关闭错误被吞掉
    async fn disconnect_locked(&self, name: &str) {
        let session = {
            let mut conns = self.connections.write().await;
            conns.get_mut(name).and_then(|c| {
                c.state = ConnectionState::Disconnected;
                c.session.take()
            })
        };
        if let Some(session) = session {
            if let Err(e) = session.close().await {
                tracing::debug!(server = %name, error = %e, "[MCP] 关闭会话失败（忽略）");
            }
        }
    }

    /// 连接表中的 endpoint（仅用于健康信息）
    pub async fn endpoint(&self, name: &str) -> Option<String> {
        self.connections
            .read()
            .await
            .get(name)
            .map(|c| c.endpoint.clone())
    }
}

#[async_trait]
impl ToolProvider for ToolConnectionManager {
    async fn all_tools(&self) -> Result<Vec<ToolHandle>, McpError> {
        self.get_all_tools().await
    }

    async fn invoke(&self, handle: &ToolHandle, args: Value) -> Result<String, McpError> {
        self.call_tool(handle, args).await
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mcp::protocol::McpTool;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 进程内假 Server：按 endpoint 配置行为
    #[derive(Clone, Default)]
    pub(crate) struct FakeBehavior {
        pub tools: Vec<&'static str>,
        pub hang_on_list: bool,
        pub refuse_connect: bool,
    }

    pub(crate) struct FakeSession {
        behavior: FakeBehavior,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ToolServerSession for FakeSession {
        async fn list_tools(&self) -> Result<Vec<McpTool>, McpError> {
            if self.behavior.hang_on_list {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(self
                .behavior
                .tools
                .iter()
                .map(|n| McpTool {
                    name: n.to_string(),
                    description: format!("tool {n}"),
                    input_schema: serde_json::json!({"type": "object"}),
                })
                .collect())
        }

        async fn call_tool(&self, name: &str, args: Value) -> Result<String, McpError> {
            Ok(format!("{name}({args})"))
        }

        async fn close(&self) -> Result<(), McpError> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Err(McpError::Transport("already gone".into()))
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeConnector {
        pub behaviors: std::sync::Mutex<HashMap<String, FakeBehavior>>,
        pub connects: AtomicUsize,
        pub closed: Arc<AtomicUsize>,
    }

    impl FakeConnector {
        pub fn with(self, endpoint: &str, behavior: FakeBehavior) -> Self {
            self.behaviors
                .lock()
                .unwrap()
                .insert(endpoint.to_string(), behavior);
            self
        }
    }

    #[async_trait]
    impl ToolServerConnector for FakeConnector {
        async fn connect(&self, endpoint: &str) -> Result<Arc<dyn ToolServerSession>, McpError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let behavior = self
                .behaviors
                .lock()
                .unwrap()
                .get(endpoint)
                .cloned()
                .unwrap_or_default();
            if behavior.refuse_connect {
                return Err(McpError::Transport("connection refused".into()));
            }
            Ok(Arc::new(FakeSession {
                behavior,
                closed: self.closed.clone(),
            }))
        }
    }

    fn section(names: &[&str]) -> McpSection {
        McpSection {
            servers: names
                .iter()
                .map(|n| McpServerSection {
                    name: n.to_string(),
                    url: format!("fake://{n}"),
                })
                .collect(),
            ..McpSection::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_server_is_skipped_after_failed_retry() {
        let connector = Arc::new(
            FakeConnector::default()
                .with(
                    "fake://slow",
                    FakeBehavior {
                        tools: vec!["slow_ping"],
                        hang_on_list: true,
                        ..Default::default()
                    },
                )
                .with(
                    "fake://weather",
                    FakeBehavior {
                        tools: vec!["weather_getWeather"],
                        ..Default::default()
                    },
                ),
        );
        let mgr = ToolConnectionManager::new(
            &section(&["slow", "weather"]),
            connector.clone(),
            TaskScheduler::default(),
        );
        mgr.connect_all().await;
        // 重连成功但仍然超时 → 跳过
        let tools = mgr.get_all_tools().await.unwrap();
        let names: Vec<&str> = tools.iter().map(|t| t.qualified_name.as_str()).collect();
        assert_eq!(names, vec!["weather_getWeather"]);
        assert_eq!(tools[0].short_name, "getWeather");
        assert_eq!(connector.connects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_servers_failing_is_an_error() {
        let connector = Arc::new(
            FakeConnector::default()
                .with(
                    "fake://a",
                    FakeBehavior {
                        hang_on_list: true,
                        ..Default::default()
                    },
                )
                .with(
                    "fake://b",
                    FakeBehavior {
                        refuse_connect: true,
                        ..Default::default()
                    },
                ),
        );
        let mgr =
            ToolConnectionManager::new(&section(&["a", "b"]), connector, TaskScheduler::default());
        mgr.connect_all().await;
        assert_eq!(mgr.state("b").await, ConnectionState::Disconnected);
        let err = mgr.get_all_tools().await.unwrap_err();
        assert!(matches!(err, McpError::AllServersUnavailable));
    }

    #[tokio::test]
    async fn test_reconnect_healthy_server_twice_stays_connected() {
        let connector = Arc::new(FakeConnector::default().with(
            "fake://biz",
            FakeBehavior {
                tools: vec!["queryOrder"],
                ..Default::default()
            },
        ));
        let mgr = ToolConnectionManager::new(
            &section(&["biz"]),
            connector.clone(),
            TaskScheduler::default(),
        );
        mgr.connect_all().await;
        assert!(mgr.reconnect("biz").await);
        assert_eq!(mgr.state("biz").await, ConnectionState::Connected);
        assert!(mgr.reconnect("biz").await);
        assert_eq!(mgr.state("biz").await, ConnectionState::Connected);
        // close 报错被吞掉
        assert_eq!(connector.closed.load(Ordering::SeqCst), 2);
        assert!(!mgr.reconnect("unknown").await);
    }

    #[tokio::test]
    async fn test_absent_server_is_reconnected_on_fetch() {
        let connector = Arc::new(FakeConnector::default().with(
            "fake://biz",
            FakeBehavior {
                tools: vec!["queryOrder"],
                ..Default::default()
            },
        ));
        let mgr = ToolConnectionManager::new(
            &section(&["biz"]),
            connector.clone(),
            TaskScheduler::default(),
        );
        // 未 connect_all：取工具时自动补连
        let tools = mgr.get_all_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(mgr.state("biz").await, ConnectionState::Connected);

        let out = mgr
            .call_tool(&tools[0], serde_json::json!({"orderId": "ORD1"}))
            .await
            .unwrap();
        assert!(out.starts_with("queryOrder("));

        mgr.shutdown().await;
        assert_eq!(mgr.state("biz").await, ConnectionState::Disconnected);
        assert!(matches!(
            mgr.call_tool(&tools[0], Value::Null).await,
            Err(McpError::NotConnected(_))
        ));

        let mut stray = tools[0].clone();
        stray.server = "legacy".to_string();
        assert!(matches!(
            mgr.call_tool(&stray, Value::Null).await,
            Err(McpError::UnknownServer(name)) if name == "legacy"
        ));
    }
}
