//! Mock LLM 客户端（用于测试与无 API Key 时的本地运行）
//!
//! 按「提示词包含的关键字」匹配预设回复：同一规则的多条回复按顺序消费，最后一条保持不变；
//! 未命中任何规则时回显最后一条 User 消息。所有调用都会被记录，便于断言调用次数与顺序。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError};
use crate::memory::{Message, Role};

#[derive(Debug)]
struct MockRule {
    needles: Vec<String>,
    replies: VecDeque<Result<String, LlmError>>,
}

impl MockRule {
    fn matches(&self, prompt: &str) -> bool {
        self.needles.iter().all(|n| prompt.contains(n.as_str()))
    }

    fn next_reply(&mut self) -> Result<String, LlmError> {
        if self.replies.len() > 1 {
            self.replies
                .pop_front()
                .unwrap_or(Err(LlmError::EmptyResponse))
        } else {
            self.replies
                .front()
                .cloned()
                .unwrap_or(Err(LlmError::EmptyResponse))
        }
    }
}

/// 脚本化 Mock 客户端
#[derive(Debug, Default)]
pub struct MockLlmClient {
    rules: Mutex<Vec<MockRule>>,
    calls: Mutex<Vec<String>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 提示词包含 needle 时返回 reply（可多次调用追加回复序列）
    pub fn on(self, needle: impl Into<String>, reply: impl Into<String>) -> Self {
        self.push_rule(vec![needle.into()], Ok(reply.into()))
    }

    /// 提示词同时包含所有 needles 时返回 reply
    pub fn on_all(self, needles: &[&str], reply: impl Into<String>) -> Self {
        let needles = needles.iter().map(|s| s.to_string()).collect();
        self.push_rule(needles, Ok(reply.into()))
    }

    /// 提示词包含 needle 时返回错误
    pub fn fail_on(self, needle: impl Into<String>, err: LlmError) -> Self {
        self.push_rule(vec![needle.into()], Err(err))
    }

    fn push_rule(self, needles: Vec<String>, reply: Result<String, LlmError>) -> Self {
        {
            let mut rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
            match rules.iter_mut().find(|r| r.needles == needles) {
                Some(rule) => rule.replies.push_back(reply),
                None => rules.push(MockRule {
                    needles,
                    replies: VecDeque::from([reply]),
                }),
            }
        }
        self
    }

    /// 已记录的全部调用（每次调用的所有消息内容拼接）
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// 提示词包含 needle 的调用次数
    pub fn count_calls(&self, needle: &str) -> usize {
        self.calls().iter().filter(|c| c.contains(needle)).count()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let prompt = messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(prompt.clone());

        {
            let mut rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(rule) = rules.iter_mut().find(|r| r.matches(&prompt)) {
                return rule.next_reply();
            }
        }

        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        Ok(format!("Echo from Mock: {}", last_user))
    }
}
