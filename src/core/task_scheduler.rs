//! I/O 调度：LLM 调用与 Tool Server 调用共享的有界许可池
//!
//! 一个回合内的流水线是串行的；多个会话并发时，阻塞型 I/O（LLM、工具列表、工具调用）
//! 统一从 Semaphore 取许可，避免慢调用占满运行时。

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::core::AgentError;
use crate::llm::{LlmClient, LlmError};
use crate::memory::Message;

/// 任务类型（仅用于日志）
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum TaskKind {
    LlmCall,
    ToolCatalog,
    ToolCall,
}

/// 有界 I/O 许可池，clone 后共享同一个 Semaphore
#[derive(Clone, Debug)]
pub struct TaskScheduler {
    io_semaphore: Arc<Semaphore>,
}

impl TaskScheduler {
    pub fn new(max_concurrent_io: usize) -> Self {
        Self {
            io_semaphore: Arc::new(Semaphore::new(max_concurrent_io.max(1))),
        }
    }

    /// 获取一次 I/O 许可；Semaphore 关闭时返回 Cancelled
    pub async fn acquire(&self, kind: TaskKind) -> Result<OwnedSemaphorePermit, AgentError> {
        tracing::trace!(?kind, available = self.available(), "[Scheduler] 申请 I/O 许可");
        self.io_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AgentError::Cancelled)
    }

    pub fn available(&self) -> usize {
        self.io_semaphore.available_permits()
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(8)
    }
}

/// 每次 complete 前先取 LlmCall 许可的 LLM 包装
pub struct ScheduledLlmClient {
    inner: Arc<dyn LlmClient>,
    scheduler: TaskScheduler,
}

impl ScheduledLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, scheduler: TaskScheduler) -> Self {
        Self { inner, scheduler }
    }
}

#[async_trait]
impl LlmClient for ScheduledLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let _permit = self
            .scheduler
            .acquire(TaskKind::LlmCall)
            .await
            .map_err(|e| LlmError::Request(e.to_string()))?;
        self.inner.complete(messages).await
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.inner.token_usage()
    }
}
