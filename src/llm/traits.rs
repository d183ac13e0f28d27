//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Mock）实现 LlmClient：complete（非流式，整段文本返回）。
//! TimeoutLlmClient 为任意后端加上单次调用超时，避免挂起的调用卡住整个回合。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::memory::Message;

/// LLM 调用错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("timed out after {0}s")]
    Timeout(u64),

    #[error("empty response")]
    EmptyResponse,
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// 便捷调用：可选 system + 一条 user
pub async fn complete_prompt(
    llm: &dyn LlmClient,
    system: Option<&str>,
    user: &str,
) -> Result<String, LlmError> {
    let mut messages = Vec::with_capacity(2);
    if let Some(system) = system {
        messages.push(Message::system(system));
    }
    messages.push(Message::user(user));
    llm.complete(&messages).await
}

/// 超时包装：对内部客户端的每次 complete 施加固定超时
pub struct TimeoutLlmClient {
    inner: Arc<dyn LlmClient>,
    timeout: Duration,
}

impl TimeoutLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, timeout_secs: u64) -> Self {
        Self {
            inner,
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }
}

#[async_trait]
impl LlmClient for TimeoutLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        match tokio::time::timeout(self.timeout, self.inner.complete(messages)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(timeout_secs = self.timeout.as_secs(), "[LLM] 调用超时");
                Err(LlmError::Timeout(self.timeout.as_secs()))
            }
        }
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.inner.token_usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowClient;

    #[async_trait]
    impl LlmClient for SlowClient {
        async fn complete(&self, _messages: &[Message]) -> Result<String, LlmError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok("late".to_string())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_client_cuts_off_hung_call() {
        let client = TimeoutLlmClient::new(Arc::new(SlowClient), 2);
        let err = client.complete(&[Message::user("hi")]).await.unwrap_err();
        assert_eq!(err, LlmError::Timeout(2));
    }
}
