//! SkillAgent：对外的唯一入口
//!
//! handle_turn 对一条用户消息跑完整流水线：意图识别 → 合并待办意图 → 串行执行 → 汇总，
//! 以事件流返回；流的最后一个事件恒为 Done。另提供非流式的 handle_turn_text 与运维接口
//! （重连、工具列表、技能列表、健康检查、关闭）。

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::AppConfig;
use crate::core::{AgentError, ScheduledLlmClient, TaskScheduler};
use crate::llm::{create_embedder_from_config, create_llm_from_config, LlmClient};
use crate::mcp::{ConnectionState, HttpConnector, ToolConnectionManager, ToolServerConnector};
use crate::memory::{
    ChatMemory, InMemoryChatMemory, InMemoryPendingIntentStore, Message, PendingIntentStore,
};
use crate::plan::{EventSink, OrchestrationEvent, PlanExecuteEngine};
use crate::router::IntentRouter;
use crate::scheduler::{merge_intents, MultiIntentScheduler};
use crate::skills::{SkillCatalog, SkillIndex, SkillLoader};

/// 一个回合的事件流
pub struct TurnStream {
    rx: mpsc::UnboundedReceiver<OrchestrationEvent>,
}

impl Stream for TurnStream {
    type Item = OrchestrationEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// 工具列表项
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerHealth {
    pub name: String,
    pub endpoint: Option<String>,
    pub state: ConnectionState,
}

/// 健康信息
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// UP：至少一个工具可用或没有配置 Server；DEGRADED：配置了 Server 但拿不到任何工具
    pub status: &'static str,
    pub checked_at: String,
    pub skills: BTreeMap<String, String>,
    pub fallback_skill: String,
    pub servers: Vec<ServerHealth>,
    pub tool_count: usize,
    pub tools: Vec<String>,
    /// 累计 token：(prompt, completion, total)
    pub token_usage: (u64, u64, u64),
}

/// 构造 SkillAgent 所需的组件（测试与自定义部署可直接注入）
pub struct AgentParts {
    pub config: AppConfig,
    pub llm: Arc<dyn LlmClient>,
    pub tools: Arc<ToolConnectionManager>,
    pub catalog: Arc<SkillCatalog>,
    pub index: SkillIndex,
    pub memory: Arc<dyn ChatMemory>,
    pub pending: Arc<dyn PendingIntentStore>,
}

struct AgentInner {
    llm: Arc<dyn LlmClient>,
    router: IntentRouter,
    index: SkillIndex,
    catalog: Arc<SkillCatalog>,
    scheduler: MultiIntentScheduler,
    tools: Arc<ToolConnectionManager>,
    memory: Arc<dyn ChatMemory>,
    pending: Arc<dyn PendingIntentStore>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct SkillAgent {
    inner: Arc<AgentInner>,
}

impl SkillAgent {
    pub fn new(parts: AgentParts) -> Self {
        let AgentParts {
            config,
            llm,
            tools,
            catalog,
            index,
            memory,
            pending,
        } = parts;

        let router = IntentRouter::new(llm.clone(), catalog.clone()).with_history(
            config.app.router_history_messages,
            config.app.assistant_preview_chars,
        );
        let engine = Arc::new(PlanExecuteEngine::new(
            llm.clone(),
            tools.clone(),
            catalog.clone(),
            config.engine.clone(),
        ));
        let scheduler =
            MultiIntentScheduler::new(engine, catalog.clone(), llm.clone(), pending.clone());

        Self {
            inner: Arc::new(AgentInner {
                llm,
                router,
                index,
                catalog,
                scheduler,
                tools,
                memory,
                pending,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// 按配置构建：LLM、Tool Server 连接、技能目录、候选索引、存储
    pub async fn from_config(cfg: &AppConfig) -> Result<Self, AgentError> {
        let io = TaskScheduler::new(cfg.mcp.max_concurrent_io);
        let llm: Arc<dyn LlmClient> =
            Arc::new(ScheduledLlmClient::new(create_llm_from_config(cfg), io.clone()));

        let connector: Arc<dyn ToolServerConnector> =
            Arc::new(HttpConnector::new(cfg.mcp.request_timeout_secs));
        let tools = Arc::new(ToolConnectionManager::new(&cfg.mcp, connector, io));
        tools.connect_all().await;

        let skills = SkillLoader::new(&cfg.skills.dir)
            .load_all()
            .map_err(|e| AgentError::Config(format!("load skills: {e}")))?;
        let catalog = Arc::new(SkillCatalog::new(skills, cfg.skills.fallback.clone()));
        if catalog.fallback().is_none() {
            tracing::warn!(fallback = %cfg.skills.fallback, "[Agent] 兜底技能不在技能目录中");
        }
        tracing::info!(skills = ?catalog.names(), "[Agent] 技能目录已加载");

        let embedder = if cfg.skills.embedding_enabled {
            create_embedder_from_config(
                cfg.llm.base_url.as_deref(),
                &cfg.skills.embedding_model,
                None,
            )
        } else {
            None
        };
        let index = SkillIndex::new(embedder, cfg.skills.top_k);
        index.build(&catalog).await;

        let (memory, pending) = create_stores(cfg).await?;

        Ok(Self::new(AgentParts {
            config: cfg.clone(),
            llm,
            tools,
            catalog,
            index,
            memory,
            pending,
        }))
    }

    /// 处理一轮对话，返回事件流；最后一个事件恒为 Done（消费端提前丢弃流时流水线在下一阶段停止）
    pub fn handle_turn(
        &self,
        conversation_id: impl Into<String>,
        message: impl Into<String>,
    ) -> TurnStream {
        let conversation_id = conversation_id.into();
        let message = message.into();
        let (sink, rx) = EventSink::channel();
        let inner = self.inner.clone();
        let span = tracing::info_span!("turn", conversation_id = %conversation_id);

        tokio::spawn(
            async move {
                let result = tokio::select! {
                    biased;
                    _ = inner.shutdown.cancelled() => Err(AgentError::Cancelled),
                    r = inner.run_turn(&conversation_id, &message, &sink) => r,
                };
                match result {
                    Ok(()) => {}
                    Err(AgentError::Cancelled) => {
                        if !sink.is_closed() {
                            let _ = sink.emit(OrchestrationEvent::error("服务正在关闭，请稍后重试"));
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "[Agent] 回合处理失败");
                        let _ = sink.emit(OrchestrationEvent::error(format!("处理请求时出错: {e}")));
                    }
                }
                let _ = sink.emit(OrchestrationEvent::Done);
            }
            .instrument(span),
        );

        TurnStream { rx }
    }

    /// 非流式：耗尽事件流，返回最后一个文本结果（没有结果时返回最后一个错误信息）
    pub async fn handle_turn_text(
        &self,
        conversation_id: impl Into<String>,
        message: impl Into<String>,
    ) -> String {
        let mut stream = self.handle_turn(conversation_id, message);
        let mut result = None;
        let mut error = None;
        while let Some(event) = stream.next().await {
            match event {
                OrchestrationEvent::Result { content } => result = Some(content),
                OrchestrationEvent::Error { message } => error = Some(message),
                _ => {}
            }
        }
        result.or(error).unwrap_or_default()
    }

    /// 重连指定 Server，或全部 Server
    pub async fn reconnect(&self, server: Option<&str>) -> Vec<(String, bool)> {
        match server {
            Some(name) => vec![(name.to_string(), self.inner.tools.reconnect(name).await)],
            None => self.inner.tools.reconnect_all().await,
        }
    }

    pub async fn list_available_tools(&self) -> Result<Vec<ToolInfo>, AgentError> {
        let tools = self.inner.tools.get_all_tools().await?;
        Ok(tools
            .into_iter()
            .map(|t| ToolInfo {
                name: t.qualified_name,
                description: t.description,
            })
            .collect())
    }

    pub fn list_skills(&self) -> BTreeMap<String, String> {
        self.inner.catalog.descriptions()
    }

    pub async fn health(&self) -> HealthReport {
        let tools = match self.inner.tools.get_all_tools().await {
            Ok(tools) => tools.into_iter().map(|t| t.qualified_name).collect(),
            Err(e) => {
                tracing::warn!(error = %e, "[Agent] 健康检查：工具不可用");
                Vec::new()
            }
        };
        let mut servers = Vec::new();
        for (name, state) in self.inner.tools.states().await {
            let endpoint = self.inner.tools.endpoint(&name).await;
            servers.push(ServerHealth {
                name,
                endpoint,
                state,
            });
        }
        let status = if tools.is_empty() && !servers.is_empty() {
            "DEGRADED"
        } else {
            "UP"
        };
        HealthReport {
            status,
            checked_at: chrono::Utc::now().to_rfc3339(),
            skills: self.inner.catalog.descriptions(),
            fallback_skill: self.inner.catalog.fallback_name().to_string(),
            servers,
            tool_count: tools.len(),
            tools,
            token_usage: self.inner.llm.token_usage(),
        }
    }

    /// 取消进行中的回合并关闭所有 Tool Server 会话
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.tools.shutdown().await;
    }
}

impl AgentInner {
    async fn run_turn(
        &self,
        conversation_id: &str,
        message: &str,
        sink: &EventSink,
    ) -> Result<(), AgentError> {
        sink.emit(OrchestrationEvent::planning("🤔 正在理解您的问题..."))?;

        let history = self.memory.read(conversation_id).await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "[Memory] 读取对话记忆失败，按无历史处理");
            Vec::new()
        });
        let candidates = self.index.candidates(message, &self.catalog).await;
        let routed = self.router.route(message, &history, &candidates).await;
        if sink.is_closed() {
            return Err(AgentError::Cancelled);
        }

        let pending = self.pending.pop(conversation_id).await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "[MultiIntent] 读取待办意图失败，忽略");
            Vec::new()
        });
        let intents = merge_intents(routed, pending);

        if let Err(e) = self.memory.append(conversation_id, Message::user(message)).await {
            tracing::warn!(error = %e, "[Memory] 写入对话记忆失败");
        }

        let outcome = self.scheduler.execute(conversation_id, intents, sink).await?;
        tracing::info!(
            terminated_early = outcome.terminated_early,
            pending_saved = outcome.pending_saved,
            failed_intents = outcome.failed_intents,
            "[Agent] 回合完成"
        );
        if let Some(reply) = outcome.reply {
            if let Err(e) = self
                .memory
                .append(conversation_id, Message::assistant(reply))
                .await
            {
                tracing::warn!(error = %e, "[Memory] 写入对话记忆失败");
            }
        }
        Ok(())
    }
}

#[cfg(feature = "async-sqlite")]
async fn create_stores(
    cfg: &AppConfig,
) -> Result<(Arc<dyn ChatMemory>, Arc<dyn PendingIntentStore>), AgentError> {
    if let Some(path) = &cfg.storage.sqlite_path {
        let store = Arc::new(
            crate::memory::SqliteStore::new(path, cfg.app.chat_memory_max_messages)
                .await
                .map_err(|e| AgentError::Store(e.to_string()))?,
        );
        tracing::info!(path = %path.display(), "[Memory] 使用 SQLite 存储");
        let memory: Arc<dyn ChatMemory> = store.clone();
        let pending: Arc<dyn PendingIntentStore> = store;
        return Ok((memory, pending));
    }
    Ok(in_memory_stores(cfg))
}

#[cfg(not(feature = "async-sqlite"))]
async fn create_stores(
    cfg: &AppConfig,
) -> Result<(Arc<dyn ChatMemory>, Arc<dyn PendingIntentStore>), AgentError> {
    if cfg.storage.sqlite_path.is_some() {
        tracing::warn!("[Memory] 配置了 sqlite_path 但未启用 async-sqlite feature，使用内存存储");
    }
    Ok(in_memory_stores(cfg))
}

fn in_memory_stores(cfg: &AppConfig) -> (Arc<dyn ChatMemory>, Arc<dyn PendingIntentStore>) {
    let memory: Arc<dyn ChatMemory> =
        Arc::new(InMemoryChatMemory::new(cfg.app.chat_memory_max_messages));
    let pending: Arc<dyn PendingIntentStore> = Arc::new(InMemoryPendingIntentStore::new());
    (memory, pending)
}
