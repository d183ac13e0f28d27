//! IntentRouter：把一条用户消息（结合对话历史）拆成有序的意图列表
//!
//! 路由失败或解析不出任何意图时，返回唯一一个兜底意图（兜底技能 + 原始消息），保证路由结果非空。

use std::sync::Arc;

use crate::llm::{complete_prompt, LlmClient};
use crate::memory::{Message, Role};
use crate::router::intent::{parse_route_output, Intent};
use crate::skills::{SkillCatalog, SkillDefinition};

pub struct IntentRouter {
    llm: Arc<dyn LlmClient>,
    catalog: Arc<SkillCatalog>,
    history_messages: usize,
    assistant_preview_chars: usize,
}

impl IntentRouter {
    pub fn new(llm: Arc<dyn LlmClient>, catalog: Arc<SkillCatalog>) -> Self {
        Self {
            llm,
            catalog,
            history_messages: 16,
            assistant_preview_chars: 150,
        }
    }

    /// 设置带入路由的历史窗口
    pub fn with_history(mut self, messages: usize, assistant_preview_chars: usize) -> Self {
        self.history_messages = messages;
        self.assistant_preview_chars = assistant_preview_chars;
        self
    }

    /// 路由；candidates 为预筛后的候选技能（为空时使用完整目录）
    pub async fn route(
        &self,
        message: &str,
        history: &[Message],
        candidates: &[SkillDefinition],
    ) -> Vec<Intent> {
        tracing::info!("[SkillRouter] 收到请求: {}", message);
        let candidates = if candidates.is_empty() {
            self.catalog.all()
        } else {
            candidates
        };
        let system = format!(
            "{}{}",
            build_router_prompt(candidates, self.catalog.fallback_name()),
            self.history_section(history)
        );

        let intents = match complete_prompt(self.llm.as_ref(), Some(&system), message).await {
            Ok(output) => {
                let intents = parse_route_output(&output, message, &self.catalog);
                if intents.is_empty() {
                    tracing::warn!(output = %output.trim(), "[SkillRouter] 无法匹配 Skill，使用兜底");
                }
                intents
            }
            Err(e) => {
                tracing::error!(error = %e, "[SkillRouter] 意图识别出错，使用兜底");
                Vec::new()
            }
        };

        if intents.is_empty() {
            return vec![Intent::new(self.catalog.fallback_name(), message)];
        }
        tracing::info!(
            "[SkillRouter] 意图识别结果: {}",
            intents
                .iter()
                .map(|i| format!("{}|{}", i.skill_name, i.sub_task))
                .collect::<Vec<_>>()
                .join(", ")
        );
        intents
    }

    /// 最近 N 条历史（从早到晚），助手回复截断
    fn history_section(&self, history: &[Message]) -> String {
        if history.is_empty() || self.history_messages == 0 {
            return String::new();
        }
        let start = history.len().saturating_sub(self.history_messages);
        let mut sb = String::from("\n\n## 对话历史（从早到晚）\n");
        for msg in &history[start..] {
            let text = if msg.role == Role::Assistant {
                truncate_chars(&msg.content, self.assistant_preview_chars)
            } else {
                msg.content.clone()
            };
            sb.push_str(&format!("{}: {}\n", msg.role.as_str(), text));
        }
        sb.push_str(
            "\n请结合对话历史判断用户当前消息的意图。如果用户在补充上一轮的信息，应该路由到同一个 Skill。",
        );
        sb
    }
}

fn build_router_prompt(skills: &[SkillDefinition], fallback: &str) -> String {
    let mut sb = format!(
        "你是一个意图识别路由器。你的任务是：判断用户的消息包含哪些意图，以及每个意图应该由哪个 Skill 来处理。\n\
         \n\
         ## 规则\n\
         - 每行输出一个意图，格式为：skill名称|子任务描述\n\
         - 只有一个意图时，也可以只返回 skill 名称\n\
         - 按用户提问的先后顺序输出\n\
         - 不要解释，不要输出其他内容\n\
         - 如果无法确定，返回 {fallback}\n\
         \n\
         ## 可用的 Skills\n"
    );
    for skill in skills {
        sb.push_str(&format!("- **{}**: {}\n", skill.name, skill.description));
    }
    sb.push_str(
        "\n## 示例\n\
         用户: \"北京天气怎么样\" → weather\n\
         用户: \"查一下我的订单\" → order-query\n\
         用户: \"帮我退款\" → refund\n\
         用户: \"物流到哪了\" → logistics\n\
         用户: \"统计一下销售额\" → data-analysis\n\
         用户: \"你好\" → chitchat\n\
         用户: \"北京天气怎么样，还有帮我查一下ORD123的物流\" →\n\
         weather|查询北京天气\n\
         logistics|查询订单ORD123的物流\n",
    );
    sb
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        format!("{}...", s.chars().take(max).collect::<String>())
    } else {
        s.to_string()
    }
}
