//! MultiIntentScheduler：按顺序串行执行多个意图，处理追问提前终止，最后汇总
//!
//! - 同一回合内意图严格串行：第 K 个意图的事件全部发出后才开始第 K+1 个
//! - 某个意图只追问、未调用任何工具时提前终止，剩余意图存入待办队列，下一轮与新意图合并
//! - 各技能的连续追问次数与待办意图一起存放在 PendingIntentStore 中
//! - 多于一个结果时调用 LLM 汇总；只有一个时直接返回

use std::sync::Arc;

use crate::core::AgentError;
use crate::llm::{complete_prompt, LlmClient};
use crate::memory::PendingIntentStore;
use crate::plan::{prompts, EventSink, OrchestrationEvent, PlanExecuteEngine};
use crate::router::Intent;
use crate::skills::SkillCatalog;

/// 合并新意图与待办意图：新意图优先，待办意图只在没有新意图指向同一技能时追加
pub fn merge_intents(new: Vec<Intent>, pending: Vec<Intent>) -> Vec<Intent> {
    let mut merged = new;
    for intent in pending {
        if merged.iter().any(|i| i.skill_name == intent.skill_name) {
            tracing::debug!(skill = %intent.skill_name, "[MultiIntent] 待办意图与新意图重复，丢弃");
            continue;
        }
        merged.push(intent);
    }
    merged
}

/// 一批意图的执行结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// 本回合给用户的最终文本（写入对话记忆）
    pub reply: Option<String>,
    pub terminated_early: bool,
    /// 存入待办队列的意图数
    pub pending_saved: usize,
    pub failed_intents: usize,
}

pub struct MultiIntentScheduler {
    engine: Arc<PlanExecuteEngine>,
    catalog: Arc<SkillCatalog>,
    llm: Arc<dyn LlmClient>,
    pending: Arc<dyn PendingIntentStore>,
}

impl MultiIntentScheduler {
    pub fn new(
        engine: Arc<PlanExecuteEngine>,
        catalog: Arc<SkillCatalog>,
        llm: Arc<dyn LlmClient>,
        pending: Arc<dyn PendingIntentStore>,
    ) -> Self {
        Self {
            engine,
            catalog,
            llm,
            pending,
        }
    }

    /// 执行一批意图。Err 只在取消或没有兜底技能时返回
    pub async fn execute(
        &self,
        conversation_id: &str,
        intents: Vec<Intent>,
        sink: &EventSink,
    ) -> Result<BatchOutcome, AgentError> {
        let total = intents.len();
        if total > 1 {
            sink.emit(OrchestrationEvent::planning(format!(
                "💡 识别到 {total} 个任务，开始逐个处理..."
            )))?;
        }

        let mut outcome = BatchOutcome::default();
        let mut results: Vec<(String, String)> = Vec::new();
        let mut question: Option<String> = None;
        let mut asked = false;

        for (i, intent) in intents.iter().enumerate() {
            if outcome.terminated_early {
                let remaining = intents[i..].to_vec();
                outcome.pending_saved = remaining.len();
                tracing::info!(
                    conversation_id,
                    count = remaining.len(),
                    "[MultiIntent] 追问中，保存剩余意图"
                );
                self.pending.replace(conversation_id, remaining).await?;
                break;
            }

            let skill = self.catalog.resolve_or_fallback(&intent.skill_name)?;
            tracing::info!(
                conversation_id,
                skill = %skill.name,
                "[MultiIntent] 执行第 {}/{} 个意图: {}",
                i + 1,
                total,
                intent.sub_task
            );
            sink.emit(OrchestrationEvent::SkillStart {
                current: i + 1,
                total,
                skill: skill.name.clone(),
                sub_task: intent.sub_task.clone(),
            })?;

            let seed = self.pending.ask_streak(conversation_id, &skill.name).await?;
            let run = self
                .engine
                .execute(skill, &intent.sub_task, seed, sink)
                .await?;

            if run.ask_user_terminated {
                asked = true;
                self.pending
                    .set_ask_streak(conversation_id, &skill.name, run.ask_user_count)
                    .await?;
                // 已调用过工具的追问按普通结果处理，不中断后续意图
                if run.tool_calls == 0 {
                    outcome.terminated_early = true;
                    question = run.result;
                    continue;
                }
            } else {
                self.pending.set_ask_streak(conversation_id, &skill.name, 0).await?;
            }

            match run.result {
                Some(content) if !run.failed => results.push((intent.sub_task.clone(), content)),
                _ => outcome.failed_intents += 1,
            }
        }

        if !asked {
            self.pending.clear_ask_streaks(conversation_id).await?;
        }
        outcome.reply = self.finish(results, question, sink).await?;
        Ok(outcome)
    }

    /// 汇总阶段：追问优先；多个结果走 LLM 汇总，单个直接返回
    async fn finish(
        &self,
        results: Vec<(String, String)>,
        question: Option<String>,
        sink: &EventSink,
    ) -> Result<Option<String>, AgentError> {
        if let Some(question) = question {
            if results.is_empty() {
                return Ok(Some(question));
            }
            let mut parts: Vec<String> = results.into_iter().map(|(_, c)| c).collect();
            parts.push(question);
            let reply = parts.join("\n\n");
            sink.emit(OrchestrationEvent::result(reply.clone()))?;
            return Ok(Some(reply));
        }

        match results.len() {
            0 => Ok(None),
            1 => Ok(results.into_iter().next().map(|(_, c)| c)),
            _ => {
                sink.emit(OrchestrationEvent::planning("📝 正在汇总所有任务结果..."))?;
                let labelled: Vec<String> = results
                    .iter()
                    .map(|(task, content)| format!("【{task}】\n{content}"))
                    .collect();
                let prompt = prompts::summary_prompt(&labelled);
                let summary = match complete_prompt(self.llm.as_ref(), None, &prompt).await {
                    Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
                    Ok(_) => labelled.join("\n\n"),
                    Err(e) => {
                        tracing::warn!(error = %e, "[MultiIntent] 汇总失败，直接拼接各任务结果");
                        labelled.join("\n\n")
                    }
                };
                tracing::info!(results = results.len(), "[MultiIntent] 汇总完成");
                sink.emit(OrchestrationEvent::result(summary.clone()))?;
                Ok(Some(summary))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineSection;
    use crate::llm::MockLlmClient;
    use crate::memory::InMemoryPendingIntentStore;
    use crate::plan::step::tests::FakeTools;
    use crate::plan::ASK_USER_EXHAUSTED_REPLY;
    use crate::skills::SkillDefinition;

    fn catalog() -> Arc<SkillCatalog> {
        Arc::new(SkillCatalog::new(
            vec![
                SkillDefinition::inline("weather", "查询天气", &[], "你是天气助手。"),
                SkillDefinition::inline("refund", "退款", &[], "你是退款助手。"),
                SkillDefinition::inline("logistics", "物流", &[], "你是物流助手。"),
                SkillDefinition::inline("chitchat", "闲聊", &[], "你是闲聊助手。"),
            ],
            "chitchat",
        ))
    }

    fn scheduler(
        llm: Arc<MockLlmClient>,
        pending: Arc<InMemoryPendingIntentStore>,
    ) -> MultiIntentScheduler {
        let catalog = catalog();
        let engine = Arc::new(PlanExecuteEngine::new(
            llm.clone(),
            Arc::new(FakeTools::default()),
            catalog.clone(),
            EngineSection::default(),
        ));
        MultiIntentScheduler::new(engine, catalog, llm, pending)
    }

    async fn drain(
        rx: &mut tokio::sync::mpsc::UnboundedReceiver<OrchestrationEvent>,
    ) -> Vec<OrchestrationEvent> {
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        events
    }

    #[test]
    fn test_merge_dedups_by_skill_keeping_new() {
        let merged = merge_intents(
            vec![Intent::new("A", "x")],
            vec![Intent::new("A", "y"), Intent::new("B", "z")],
        );
        assert_eq!(merged, vec![Intent::new("A", "x"), Intent::new("B", "z")]);
    }

    #[tokio::test]
    async fn test_two_results_are_summarized() {
        let llm = Arc::new(
            MockLlmClient::new()
                .on("用户一次提出了多个问题", "北京晴；订单已发货")
                .on_all(&["任务规划器", "北京"], "回复用户")
                .on_all(&["任务规划器", "ORD1"], "回复用户")
                .on("任务观察者", "OK")
                .on_all(&["最终完整回复", "北京"], "北京晴")
                .on_all(&["最终完整回复", "ORD1"], "订单已发货")
                .on("你正在执行以下步骤", "done"),
        );
        let pending = Arc::new(InMemoryPendingIntentStore::new());
        let s = scheduler(llm.clone(), pending);
        let (sink, mut rx) = EventSink::channel();
        let outcome = s
            .execute(
                "c1",
                vec![Intent::new("weather", "北京天气"), Intent::new("logistics", "ORD1物流")],
                &sink,
            )
            .await
            .unwrap();

        assert_eq!(outcome.reply.as_deref(), Some("北京晴；订单已发货"));
        let summary_call = llm
            .calls()
            .into_iter()
            .find(|c| c.contains("用户一次提出了多个问题"))
            .unwrap();
        assert!(summary_call.contains("【北京天气】\n北京晴\n\n---\n\n【ORD1物流】\n订单已发货"));

        let events = drain(&mut rx).await;
        let starts: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                OrchestrationEvent::SkillStart { current, .. } => Some(*current),
                _ => None,
            })
            .collect();
        assert_eq!(starts, vec![1, 2]);
        assert!(matches!(events.last(), Some(OrchestrationEvent::Result { content }) if content == "北京晴；订单已发货"));
    }

    #[tokio::test]
    async fn test_single_result_skips_summary() {
        let llm = Arc::new(
            MockLlmClient::new()
                .on("任务规划器", "回复用户")
                .on("任务观察者", "OK")
                .on("最终完整回复", "你好！")
                .on("你正在执行以下步骤", "done"),
        );
        let s = scheduler(llm.clone(), Arc::new(InMemoryPendingIntentStore::new()));
        let (sink, _rx) = EventSink::channel();
        let outcome = s.execute("c1", vec![Intent::new("chitchat", "你好")], &sink).await.unwrap();
        assert_eq!(outcome.reply.as_deref(), Some("你好！"));
        assert_eq!(llm.count_calls("用户一次提出了多个问题"), 0);
    }

    #[tokio::test]
    async fn test_ask_user_saves_remaining_intents() {
        let llm = Arc::new(
            MockLlmClient::new().on_all(&["任务规划器", "退款"], "追问用户：请提供订单号"),
        );
        let pending = Arc::new(InMemoryPendingIntentStore::new());
        let s = scheduler(llm.clone(), pending.clone());
        let (sink, _rx) = EventSink::channel();
        let outcome = s
            .execute(
                "c1",
                vec![
                    Intent::new("refund", "我要退款"),
                    Intent::new("weather", "上海天气"),
                    Intent::new("logistics", "查物流"),
                ],
                &sink,
            )
            .await
            .unwrap();

        assert!(outcome.terminated_early);
        assert_eq!(outcome.reply.as_deref(), Some("请提供订单号"));
        assert_eq!(outcome.pending_saved, 2);
        assert_eq!(
            pending.get("c1").await.unwrap(),
            vec![Intent::new("weather", "上海天气"), Intent::new("logistics", "查物流")]
        );
        assert_eq!(llm.count_calls("任务规划器"), 1);
    }

    #[tokio::test]
    async fn test_completed_results_precede_question() {
        let llm = Arc::new(
            MockLlmClient::new()
                .on_all(&["任务规划器", "退款"], "追问用户：请提供订单号")
                .on("任务规划器", "回复用户")
                .on("任务观察者", "OK")
                .on("最终完整回复", "北京晴")
                .on("你正在执行以下步骤", "done"),
        );
        let s = scheduler(llm.clone(), Arc::new(InMemoryPendingIntentStore::new()));
        let (sink, _rx) = EventSink::channel();
        let outcome = s
            .execute(
                "c1",
                vec![Intent::new("weather", "北京天气"), Intent::new("refund", "我要退款")],
                &sink,
            )
            .await
            .unwrap();
        assert_eq!(outcome.reply.as_deref(), Some("北京晴\n\n请提供订单号"));
        assert_eq!(outcome.pending_saved, 0);
        assert_eq!(llm.count_calls("用户一次提出了多个问题"), 0);
    }

    #[tokio::test]
    async fn test_ask_user_streak_is_bounded_across_turns() {
        let llm = Arc::new(MockLlmClient::new().on("任务规划器", "追问用户：请提供订单号"));
        let s = scheduler(llm, Arc::new(InMemoryPendingIntentStore::new()));
        let (sink, _rx) = EventSink::channel();
        let mut replies = Vec::new();
        for _ in 0..5 {
            let outcome = s
                .execute("c1", vec![Intent::new("refund", "退款")], &sink)
                .await
                .unwrap();
            replies.push(outcome.reply.unwrap_or_default());
        }
        assert!(replies[..4].iter().all(|r| r == "请提供订单号"));
        assert_eq!(replies[4], ASK_USER_EXHAUSTED_REPLY);

        // 道歉之后计数清零
        let again = s.execute("c1", vec![Intent::new("refund", "退款")], &sink).await.unwrap();
        assert_eq!(again.reply.as_deref(), Some("请提供订单号"));
    }

    #[tokio::test]
    async fn test_question_after_tool_call_does_not_stop_batch() {
        let catalog = Arc::new(SkillCatalog::new(
            vec![
                SkillDefinition::inline("refund", "退款", &["queryOrder"], "你是退款助手。"),
                SkillDefinition::inline("weather", "查询天气", &[], "你是天气助手。"),
                SkillDefinition::inline("chitchat", "闲聊", &[], "你是闲聊助手。"),
            ],
            "chitchat",
        ));
        let tools = Arc::new(FakeTools::default().tool("biz", "queryOrder", "ORD1：已发货"));
        let llm = Arc::new(
            MockLlmClient::new()
                .on("用户一次提出了多个问题", "汇总回复")
                .on("ORD1：已发货", "订单ORD1已发货")
                .on_all(&["任务观察者", "ORD1"], "REPLAN: 需要退款原因")
                .on("任务观察者", "OK")
                .on_all(&["任务规划器", "ORD1"], "调用 queryOrder 查询订单")
                .on_all(&["任务规划器", "ORD1"], "追问用户：请问退款原因？")
                .on("任务规划器", "回复用户")
                .on("最终完整回复", "上海多云")
                .on_all(
                    &["你正在执行以下步骤", "queryOrder"],
                    r#"{"tool": "queryOrder", "args": {"orderId": "ORD1"}}"#,
                )
                .on("你正在执行以下步骤", "done"),
        );
        let engine = Arc::new(PlanExecuteEngine::new(
            llm.clone(),
            tools.clone(),
            catalog.clone(),
            EngineSection::default(),
        ));
        let pending = Arc::new(InMemoryPendingIntentStore::new());
        let s = MultiIntentScheduler::new(engine, catalog, llm, pending.clone());
        let (sink, _rx) = EventSink::channel();
        let outcome = s
            .execute(
                "c1",
                vec![Intent::new("refund", "我要退款ORD1"), Intent::new("weather", "上海天气")],
                &sink,
            )
            .await
            .unwrap();

        assert_eq!(tools.invoked_names(), vec!["biz_queryOrder"]);
        assert!(!outcome.terminated_early);
        assert_eq!(outcome.pending_saved, 0);
        assert!(pending.get("c1").await.unwrap().is_empty());
        assert_eq!(outcome.reply.as_deref(), Some("汇总回复"));
        assert_eq!(pending.ask_streak("c1", "refund").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ask_streaks_evicted_when_turn_does_not_ask() {
        let llm = Arc::new(
            MockLlmClient::new()
                .on_all(&["任务规划器", "退款"], "追问用户：请提供订单号")
                .on("任务规划器", "回复用户")
                .on("任务观察者", "OK")
                .on("最终完整回复", "你好！")
                .on("你正在执行以下步骤", "done"),
        );
        let pending = Arc::new(InMemoryPendingIntentStore::new());
        let s = scheduler(llm, pending.clone());
        let (sink, _rx) = EventSink::channel();

        s.execute("c1", vec![Intent::new("refund", "我要退款")], &sink).await.unwrap();
        assert_eq!(pending.ask_streak("c1", "refund").await.unwrap(), 1);
        assert_eq!(pending.tracked_conversations().await, 1);

        let outcome = s.execute("c1", vec![Intent::new("chitchat", "你好")], &sink).await.unwrap();
        assert_eq!(outcome.reply.as_deref(), Some("你好！"));
        assert_eq!(pending.tracked_conversations().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_skill_without_fallback_is_error() {
        let catalog = Arc::new(SkillCatalog::new(
            vec![SkillDefinition::inline("weather", "天气", &[], "p")],
            "chitchat",
        ));
        let llm = Arc::new(MockLlmClient::new());
        let engine = Arc::new(PlanExecuteEngine::new(
            llm.clone(),
            Arc::new(FakeTools::default()),
            catalog.clone(),
            EngineSection::default(),
        ));
        let s = MultiIntentScheduler::new(
            engine,
            catalog,
            llm,
            Arc::new(InMemoryPendingIntentStore::new()),
        );
        let (sink, _rx) = EventSink::channel();
        let err = s
            .execute("c1", vec![Intent::new("refund", "退款")], &sink)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::NoFallbackSkill));
    }
}
