//! LLM 自由文本的解析：计划行、追问步骤、Observer 结论、工具调用 JSON
//!
//! 这些格式靠提示词约定，全部集中在这里；状态机只调用这里的函数。

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// 追问步骤的前缀
pub const ASK_USER_PREFIX: &str = "追问用户";

/// 追问步骤没有给出问题时使用的默认问题
pub const DEFAULT_ASK_USER_QUESTION: &str = "为了继续处理您的请求，请补充更多必要信息。";

fn list_marker() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:(?:步骤\s*)?\d+\s*[.、):：）]\s*|[-*•]\s+)").ok())
        .as_ref()
}

/// 计划文本 → 步骤列表：每行一步，去掉空行、`#` 开头的行与编号/列表符号
///
/// 计划里只要出现追问步骤，整个计划就只保留第一个追问步骤：缺信息时先问，不先调用工具。
pub fn parse_plan(text: &str) -> Vec<String> {
    let steps: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#') && !l.starts_with("```"))
        .map(|l| match list_marker() {
            Some(re) => re.replace(l, "").trim().to_string(),
            None => l.to_string(),
        })
        .filter(|l| !l.is_empty())
        .collect();

    match steps.iter().position(|s| is_ask_user_step(s)) {
        Some(i) if steps.len() > 1 => {
            tracing::info!(dropped = steps.len() - 1, "[Plan] 计划含追问步骤，只保留追问");
            vec![steps[i].clone()]
        }
        _ => steps,
    }
}

pub fn is_ask_user_step(step: &str) -> bool {
    step.trim_start().starts_with(ASK_USER_PREFIX)
}

/// 从追问步骤中取出问题：`追问用户：问题` 或 `追问用户:问题`；没有分隔符或问题为空时返回默认问题
pub fn extract_ask_user_question(step: &str) -> Option<String> {
    let rest = step.trim_start().strip_prefix(ASK_USER_PREFIX)?;
    let question = rest
        .trim_start()
        .strip_prefix('：')
        .or_else(|| rest.trim_start().strip_prefix(':'))
        .map(str::trim)
        .filter(|q| !q.is_empty());
    Some(
        question
            .map(String::from)
            .unwrap_or_else(|| DEFAULT_ASK_USER_QUESTION.to_string()),
    )
}

/// Observer 结论
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Ok(String),
    Replan(String),
}

impl Verdict {
    pub fn text(&self) -> &str {
        match self {
            Verdict::Ok(t) | Verdict::Replan(t) => t,
        }
    }

    pub fn needs_replan(&self) -> bool {
        matches!(self, Verdict::Replan(_))
    }
}

/// 以 REPLAN 开头（不区分大小写）为重新规划，其余一律视为 OK
pub fn parse_verdict(text: &str) -> Verdict {
    let text = text.trim();
    if text.to_uppercase().starts_with("REPLAN") {
        Verdict::Replan(text.to_string())
    } else {
        Verdict::Ok(text.to_string())
    }
}

/// LLM 返回的工具调用（`{"tool": "getWeather", "args": {"city": "北京"}}`）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// 提取工具调用：```json 代码块或首尾花括号之间的 JSON；不是合法调用时返回 None（视为普通文本）
pub fn parse_tool_call(output: &str) -> Option<ToolCall> {
    let trimmed = output.trim();
    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```")
            .map(|end| rest[..end].trim())
            .unwrap_or(rest.trim())
    } else {
        let start = trimmed.find('{')?;
        let end = trimmed.rfind('}')?;
        if end < start {
            return None;
        }
        &trimmed[start..=end]
    };

    let call: ToolCall = serde_json::from_str(json_str).ok()?;
    if call.tool.trim().is_empty() {
        None
    } else {
        Some(call)
    }
}
