//! 待办意图队列
//!
//! 多意图执行中某个 Skill 追问用户时，剩余意图按会话保存；下一轮开始时取出（取出即删除）。
//! 每次保存整体替换，一个会话最多一组待办。
//!
//! 同一处还记录 (会话, 技能) 的连续追问次数，使追问上限跨回合生效。

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::core::AgentError;
use crate::router::Intent;

#[async_trait]
pub trait PendingIntentStore: Send + Sync {
    /// 读取（不删除）
    async fn get(&self, conversation_id: &str) -> Result<Vec<Intent>, AgentError>;

    /// 整体替换为 intents（空列表等同 clear）
    async fn replace(&self, conversation_id: &str, intents: Vec<Intent>) -> Result<(), AgentError>;

    async fn clear(&self, conversation_id: &str) -> Result<(), AgentError>;

    /// 取出并清除
    async fn pop(&self, conversation_id: &str) -> Result<Vec<Intent>, AgentError> {
        let pending = self.get(conversation_id).await?;
        if !pending.is_empty() {
            self.clear(conversation_id).await?;
            tracing::info!(
                conversation_id,
                count = pending.len(),
                "[MultiIntent] 取出待办意图"
            );
        }
        Ok(pending)
    }

    /// 该技能在本会话中连续追问的次数（没有记录为 0）
    async fn ask_streak(&self, conversation_id: &str, skill: &str) -> Result<usize, AgentError>;

    /// 设置连续追问次数；0 表示删除记录
    async fn set_ask_streak(
        &self,
        conversation_id: &str,
        skill: &str,
        count: usize,
    ) -> Result<(), AgentError>;

    /// 删除本会话所有技能的追问记录
    async fn clear_ask_streaks(&self, conversation_id: &str) -> Result<(), AgentError>;
}

#[derive(Debug, Default)]
pub struct InMemoryPendingIntentStore {
    pending: RwLock<HashMap<String, Vec<Intent>>>,
    /// 会话 → (技能 → 连续追问次数)
    ask_streaks: RwLock<HashMap<String, HashMap<String, usize>>>,
}

impl InMemoryPendingIntentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PendingIntentStore for InMemoryPendingIntentStore {
    async fn get(&self, conversation_id: &str) -> Result<Vec<Intent>, AgentError> {
        Ok(self
            .pending
            .read()
            .await
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn replace(&self, conversation_id: &str, intents: Vec<Intent>) -> Result<(), AgentError> {
        let mut pending = self.pending.write().await;
        if intents.is_empty() {
            pending.remove(conversation_id);
        } else {
            pending.insert(conversation_id.to_string(), intents);
        }
        Ok(())
    }

    async fn clear(&self, conversation_id: &str) -> Result<(), AgentError> {
        self.pending.write().await.remove(conversation_id);
        Ok(())
    }

    async fn ask_streak(&self, conversation_id: &str, skill: &str) -> Result<usize, AgentError> {
        Ok(self
            .ask_streaks
            .read()
            .await
            .get(conversation_id)
            .and_then(|m| m.get(skill))
            .copied()
            .unwrap_or(0))
    }

    async fn set_ask_streak(
        &self,
        conversation_id: &str,
        skill: &str,
        count: usize,
    ) -> Result<(), AgentError> {
        let mut streaks = self.ask_streaks.write().await;
        if count > 0 {
            streaks
                .entry(conversation_id.to_string())
                .or_default()
                .insert(skill.to_string(), count);
            return Ok(());
        }
        if let Some(per_skill) = streaks.get_mut(conversation_id) {
            per_skill.remove(skill);
            if per_skill.is_empty() {
                streaks.remove(conversation_id);
            }
        }
        Ok(())
    }

    async fn clear_ask_streaks(&self, conversation_id: &str) -> Result<(), AgentError> {
        self.ask_streaks.write().await.remove(conversation_id);
        Ok(())
    }
}

impl InMemoryPendingIntentStore {
    /// 有追问记录的会话数
    pub async fn tracked_conversations(&self) -> usize {
        self.ask_streaks.read().await.len()
    }
}
