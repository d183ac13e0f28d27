//! 编排过程事件：用于流式展示规划、步骤执行、观察与回复

use serde::Serialize;
use tokio::sync::mpsc;

use crate::core::AgentError;

/// 单个事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestrationEvent {
    /// 阶段提示（理解问题、生成计划、汇总等）
    Planning { message: String },
    /// 初始计划
    Plan { steps: Vec<String> },
    /// 多意图中第 current 个任务开始
    SkillStart {
        current: usize,
        total: usize,
        skill: String,
        sub_task: String,
    },
    ActionStart {
        step: usize,
        total: usize,
        description: String,
    },
    ActionDone {
        step: usize,
        total: usize,
        description: String,
        result: String,
    },
    Observe { step: usize, text: String },
    Replan { reason: String, steps: Vec<String> },
    /// 文本结果（单个意图的回复、追问或汇总）
    Result { content: String },
    Error { message: String },
    /// 回合结束，每个回合恰好一次
    Done,
}

impl OrchestrationEvent {
    pub fn planning(message: impl Into<String>) -> Self {
        Self::Planning {
            message: message.into(),
        }
    }

    pub fn result(content: impl Into<String>) -> Self {
        Self::Result {
            content: content.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// 事件类型名（与序列化后的 type 字段一致）
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Planning { .. } => "planning",
            Self::Plan { .. } => "plan",
            Self::SkillStart { .. } => "skill_start",
            Self::ActionStart { .. } => "action_start",
            Self::ActionDone { .. } => "action_done",
            Self::Observe { .. } => "observe",
            Self::Replan { .. } => "replan",
            Self::Result { .. } => "result",
            Self::Error { .. } => "error",
            Self::Done => "done",
        }
    }
}

/// 事件发送端；接收端被丢弃后 emit 返回 Cancelled，流水线在下一个阶段边界停止
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<OrchestrationEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<OrchestrationEvent>) -> Self {
        Self { tx }
    }

    /// 新建一对 (sink, receiver)
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OrchestrationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn emit(&self, event: OrchestrationEvent) -> Result<(), AgentError> {
        tracing::trace!(kind = event.kind(), "[Event] 发送事件");
        self.tx.send(event).map_err(|_| AgentError::Cancelled)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialized_tag_is_snake_case() {
        let ev = OrchestrationEvent::ActionDone {
            step: 1,
            total: 2,
            description: "查询天气".into(),
            result: "晴".into(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "action_done");
        assert_eq!(json["step"], 1);
        assert_eq!(serde_json::to_value(OrchestrationEvent::Done).unwrap()["type"], "done");
    }

    #[tokio::test]
    async fn test_emit_after_receiver_dropped_is_cancelled() {
        let (sink, rx) = EventSink::channel();
        sink.emit(OrchestrationEvent::planning("x")).unwrap();
        drop(rx);
        assert!(sink.is_closed());
        assert!(matches!(
            sink.emit(OrchestrationEvent::Done),
            Err(AgentError::Cancelled)
        ));
    }
}
