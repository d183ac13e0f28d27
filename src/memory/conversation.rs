//! 对话记忆：消息类型与按会话隔离的滑动窗口
//!
//! 每个会话保留最近 N 条消息，超出时自动剪枝；供意图识别（上下文延续）与规划使用。

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::AgentError;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            _ => Role::System,
        }
    }
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 对话记忆：按 conversation_id 追加与读取（读取结果按时间从早到晚）
#[async_trait]
pub trait ChatMemory: Send + Sync {
    async fn append(&self, conversation_id: &str, message: Message) -> Result<(), AgentError>;

    async fn read(&self, conversation_id: &str) -> Result<Vec<Message>, AgentError>;
}

/// 内存实现：每个会话一个窗口，超过 max_messages 时丢弃最旧的消息
#[derive(Debug)]
pub struct InMemoryChatMemory {
    conversations: RwLock<HashMap<String, Vec<Message>>>,
    max_messages: usize,
}

impl InMemoryChatMemory {
    pub fn new(max_messages: usize) -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            max_messages: max_messages.max(1),
        }
    }
}

impl Default for InMemoryChatMemory {
    fn default() -> Self {
        Self::new(50)
    }
}

#[async_trait]
impl ChatMemory for InMemoryChatMemory {
    async fn append(&self, conversation_id: &str, message: Message) -> Result<(), AgentError> {
        let mut conversations = self.conversations.write().await;
        let messages = conversations.entry(conversation_id.to_string()).or_default();
        messages.push(message);
        if messages.len() > self.max_messages {
            let excess = messages.len() - self.max_messages;
            messages.drain(..excess);
        }
        Ok(())
    }

    async fn read(&self, conversation_id: &str) -> Result<Vec<Message>, AgentError> {
        let conversations = self.conversations.read().await;
        Ok(conversations
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }
}
