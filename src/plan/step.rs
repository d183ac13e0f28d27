//! 步骤执行器：一次步骤内的「调用工具 → 观察 → 再调用」循环
//!
//! LLM 输出合法的工具调用 JSON 时执行对应工具，把结果作为新消息追加后继续；
//! 输出普通文本时即为本步结果。单步最多调用 max_tool_rounds 次工具，之后的回复无论内容如何都作为结果。

use std::sync::Arc;

use crate::llm::{LlmClient, LlmError};
use crate::mcp::{ToolHandle, ToolProvider};
use crate::memory::Message;
use crate::plan::parse::parse_tool_call;
use crate::plan::prompts::truncate_chars;

/// 单步执行结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutput {
    pub text: String,
    pub tool_calls: usize,
}

pub struct StepExecutor {
    llm: Arc<dyn LlmClient>,
    tools: Arc<dyn ToolProvider>,
    max_tool_rounds: usize,
}

impl StepExecutor {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        tools: Arc<dyn ToolProvider>,
        max_tool_rounds: usize,
    ) -> Self {
        Self {
            llm,
            tools,
            max_tool_rounds,
        }
    }

    /// 执行；只有 LLM 调用失败时返回 Err（工具失败作为观察结果交给 LLM）
    pub async fn execute(
        &self,
        system: &str,
        user_prompt: &str,
        bound: &[ToolHandle],
    ) -> Result<StepOutput, LlmError> {
        let mut messages = vec![Message::system(system), Message::user(user_prompt)];
        let mut tool_calls = 0;

        loop {
            let reply = self.llm.complete(&messages).await?;
            if tool_calls >= self.max_tool_rounds {
                return Ok(StepOutput {
                    text: reply.trim().to_string(),
                    tool_calls,
                });
            }
            let Some(call) = parse_tool_call(&reply) else {
                return Ok(StepOutput {
                    text: reply.trim().to_string(),
                    tool_calls,
                });
            };

            let observation = match find_bound(&call.tool, bound) {
                Some(handle) => {
                    tool_calls += 1;
                    match self.tools.invoke(handle, call.args.clone()).await {
                        Ok(out) => {
                            tracing::info!(
                                tool = %handle.qualified_name,
                                preview = %truncate_chars(&out, 100),
                                "[Action] 工具返回"
                            );
                            format!("工具 {} 返回：\n{}", call.tool, out)
                        }
                        Err(e) => {
                            tracing::warn!(
                                tool = %handle.qualified_name,
                                error = %e,
                                "[Action] 工具调用失败"
                            );
                            format!("工具 {} 调用失败：{}", call.tool, e)
                        }
                    }
                }
                None => {
                    tracing::warn!(tool = %call.tool, "[Action] 请求了未绑定的工具");
                    format!(
                        "工具 {} 不可用。可用工具：{}",
                        call.tool,
                        if bound.is_empty() {
                            "无".to_string()
                        } else {
                            bound
                                .iter()
                                .map(|t| t.qualified_name.as_str())
                                .collect::<Vec<_>>()
                                .join(", ")
                        }
                    )
                }
            };
            messages.push(Message::assistant(reply));
            messages.push(Message::user(observation));
        }
    }
}

/// 按完整名或短名查找已绑定的工具
fn find_bound<'a>(name: &str, bound: &'a [ToolHandle]) -> Option<&'a ToolHandle> {
    bound
        .iter()
        .find(|t| t.qualified_name == name)
        .or_else(|| bound.iter().find(|t| t.short_name == name))
}
