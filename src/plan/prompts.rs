//! 提示词构建：Planner / 步骤执行 / Observer / 最终回复 / 直接执行 / 多意图汇总

use std::collections::HashMap;

use schemars::{schema_for, JsonSchema};

use crate::mcp::ToolHandle;
use crate::plan::context::StepRecord;
use crate::plan::parse::ASK_USER_PREFIX;

/// 工具调用请求格式：与 parse_tool_call 解析的 `{"tool": "...", "args": {...}}` 一致（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallFormat {
    /// 工具名，取自「可用工具」列表
    pub tool: String,
    /// 工具参数，键为参数名，须符合该工具的参数 Schema
    pub args: HashMap<String, serde_json::Value>,
}

/// 工具调用的 JSON Schema 字符串，拼入步骤执行的 system prompt
pub fn tool_call_schema_json() -> String {
    let schema = schema_for!(ToolCallFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// 工具签名列表：名称、描述、参数 Schema
pub fn tool_signatures(tools: &[ToolHandle]) -> String {
    if tools.is_empty() {
        return "无".to_string();
    }
    tools
        .iter()
        .map(|t| {
            format!(
                "- {}: {}\n  参数: {}",
                t.qualified_name,
                if t.description.is_empty() { "(无描述)" } else { &t.description },
                t.parameter_schema
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn planner_prompt(
    tools: &[ToolHandle],
    user_message: &str,
    completed: &[StepRecord],
) -> String {
    let completed_info = if completed.is_empty() {
        "无".to_string()
    } else {
        completed
            .iter()
            .map(|s| format!("- {} → {}", s.step, s.result))
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!(
        "你是一个任务规划器。根据用户问题、可用工具和已完成步骤，生成接下来的执行计划。\n\
         \n\
         规则：\n\
         - 每行一个步骤，不要编号，不要多余内容\n\
         - 步骤要具体、可执行，明确说明要调用哪个工具和参数\n\
         - 如果调用工具所必需的参数在用户问题中缺失，第一步必须是「{ASK_USER_PREFIX}：具体问题」，且只输出这一步\n\
         - 如果只是工具能力有限（而不是缺少参数），不要追问，尽力执行并在最终回复中说明限制\n\
         - 如果不需要工具，直接写\"回复用户\"\n\
         - 最后一步应该是\"整理结果并回复用户\"\n\
         \n\
         可用工具:\n{}\n\
         用户问题: {user_message}\n\
         已完成步骤:\n{completed_info}\n\
         \n\
         请输出接下来要执行的步骤（每行一个）：",
        tool_signatures(tools)
    )
}

/// 步骤执行的 system prompt：技能提示词 + 工具调用约定
pub fn step_system_prompt(skill_prompt: &str, tools: &[ToolHandle]) -> String {
    if tools.is_empty() {
        return skill_prompt.to_string();
    }
    format!(
        "{skill_prompt}\n\
         \n\
         ## 可用工具\n{}\n\
         \n\
         需要调用工具时，只输出一个 JSON 对象（不要输出其他内容），格式如下：\n\
         {{\"tool\": \"工具名\", \"args\": {{...}}}}\n\
         JSON Schema:\n{}\n\
         收到工具结果后，可以继续调用工具，或直接输出文本结果。",
        tool_signatures(tools),
        tool_call_schema_json()
    )
}

pub fn step_prompt(step: &str, user_message: &str, completed: &[StepRecord]) -> String {
    let history = if completed.is_empty() {
        String::new()
    } else {
        format!(
            "之前步骤的结果:\n{}",
            completed
                .iter()
                .map(|s| format!("步骤「{}」结果: {}", s.step, s.result))
                .collect::<Vec<_>>()
                .join("\n")
        )
    };
    format!(
        "你正在执行以下步骤: {step}\n\
         \n\
         用户原始问题: {user_message}\n\
         {history}\n\
         \n\
         请执行这个步骤。如果需要调用工具，请调用。只返回这一步的执行结果，不要返回最终回复。"
    )
}

pub fn observer_prompt(
    user_message: &str,
    step: &str,
    result: &str,
    remaining: &[String],
    preview_chars: usize,
) -> String {
    let remaining = if remaining.is_empty() {
        "无".to_string()
    } else {
        remaining.join(", ")
    };
    format!(
        "你是一个任务观察者。请评估当前步骤的执行结果。\n\
         \n\
         用户问题: {user_message}\n\
         当前步骤: {step}\n\
         执行结果: {}\n\
         剩余步骤: {remaining}\n\
         \n\
         请用一句话评估：\n\
         - 如果结果正常且剩余步骤合理，回复 \"OK: [简要说明]\"\n\
         - 如果结果异常或需要调整计划，回复 \"REPLAN: [原因和建议]\"",
        truncate_chars(result, preview_chars)
    )
}

/// 最终回复；被 RePlan 作废的步骤作为背景附在前面
pub fn final_prompt(
    skill_prompt: &str,
    user_message: &str,
    superseded: &[StepRecord],
    completed: &[StepRecord],
) -> String {
    let steps_info = completed
        .iter()
        .map(|s| format!("步骤「{}」结果:\n{}", s.step, s.result))
        .collect::<Vec<_>>()
        .join("\n\n");
    let background = if superseded.is_empty() {
        String::new()
    } else {
        format!(
            "\n此前被调整掉的计划中已执行的步骤（仅供参考）：\n{}\n",
            superseded
                .iter()
                .map(|s| format!("- {} → {}", s.step, s.result))
                .collect::<Vec<_>>()
                .join("\n")
        )
    };
    format!(
        "{skill_prompt}\n\
         \n\
         用户问题: {user_message}\n\
         {background}\n\
         以下是已执行步骤及其结果：\n{steps_info}\n\
         \n\
         请根据以上所有步骤的结果，生成对用户问题的最终完整回复。"
    )
}

/// 直接执行模式：技能提示词 + 用户问题，一次带工具的调用给出回复
pub fn direct_prompt(user_message: &str) -> String {
    format!("用户问题: {user_message}\n\n请直接回复用户。如果需要调用工具，请先调用工具。")
}

/// 多意图汇总
pub fn summary_prompt(results: &[String]) -> String {
    format!(
        "你是一个智能助手。用户一次提出了多个问题，以下是各个子任务的执行结果。\n\
         请将所有结果整合成一个完整、连贯的回复，不要遗漏任何子任务的信息。\n\
         使用中文回复，语气友好专业。\n\
         \n\
         各子任务结果：\n{}\n\
         \n\
         请输出整合后的完整回复：",
        results.join("\n\n---\n\n")
    )
}

pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        format!("{}...", s.chars().take(max).collect::<String>())
    } else {
        s.to_string()
    }
}
