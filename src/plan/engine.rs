//! PlanExecuteEngine：单个意图的 Plan → Execute → Observe → (RePlan | 前进 | 追问) → 最终回复
//!
//! 显式状态机：`while state != Done` 循环，每次根据当前状态和 ExecutionContext 计算下一状态。
//! - 步骤执行的 LLM 失败转成文本结果「执行失败: ...」，交给 Observer 判断
//! - Observer 失败视为 OK
//! - Planning / RePlan / Finalizing 失败对当前意图是致命的：发出 error 事件并结束该意图
//! - 事件接收端被丢弃时，在下一个阶段边界返回 Cancelled

use std::sync::Arc;

use crate::config::{EngineSection, ExecutionMode};
use crate::core::AgentError;
use crate::llm::{complete_prompt, LlmClient};
use crate::mcp::ToolProvider;
use crate::plan::context::ExecutionContext;
use crate::plan::events::{EventSink, OrchestrationEvent};
use crate::plan::parse::{
    extract_ask_user_question, is_ask_user_step, parse_plan, parse_verdict, Verdict,
    DEFAULT_ASK_USER_QUESTION,
};
use crate::plan::prompts;
use crate::plan::step::StepExecutor;
use crate::skills::{resolve_tools, SkillCatalog, SkillDefinition};

/// 追问次数用尽时的固定回复
pub const ASK_USER_EXHAUSTED_REPLY: &str =
    "抱歉，经过多次确认仍缺少完成该请求所需的信息，暂时无法继续处理。请补充完整信息后重新提问。";

const OBSERVE_FALLBACK: &str = "OK: 观察异常，继续执行";

/// 状态机的状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    Preload,
    Planning,
    Executing,
    Observing,
    Replanning { reason: String },
    AskingUser,
    Finalizing,
    Done,
}

/// 单个意图的运行结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutcome {
    /// 最终文本（回复、追问或兜底道歉）；致命错误时为 None
    pub result: Option<String>,
    /// 以追问结束（需要用户补充信息）
    pub ask_user_terminated: bool,
    pub ask_user_count: usize,
    pub replan_count: usize,
    pub tool_calls: usize,
    pub failed: bool,
}

pub struct PlanExecuteEngine {
    llm: Arc<dyn LlmClient>,
    tools: Arc<dyn ToolProvider>,
    catalog: Arc<SkillCatalog>,
    step_executor: StepExecutor,
    limits: EngineSection,
}

impl PlanExecuteEngine {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        tools: Arc<dyn ToolProvider>,
        catalog: Arc<SkillCatalog>,
        limits: EngineSection,
    ) -> Self {
        let step_executor =
            StepExecutor::new(llm.clone(), tools.clone(), limits.max_tool_rounds_per_step);
        Self {
            llm,
            tools,
            catalog,
            step_executor,
            limits,
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.limits.mode
    }

    /// 按配置的执行方式运行一个意图；只有取消时返回 Err
    pub async fn execute(
        &self,
        skill: &SkillDefinition,
        sub_task: &str,
        ask_user_seed: usize,
        sink: &EventSink,
    ) -> Result<RunOutcome, AgentError> {
        match self.limits.mode {
            ExecutionMode::PlanExecute => self.run(skill, sub_task, ask_user_seed, sink).await,
            ExecutionMode::Direct => self.run_direct(skill, sub_task, sink).await,
        }
    }

    /// Plan-and-Execute 循环
    pub async fn run(
        &self,
        skill: &SkillDefinition,
        sub_task: &str,
        ask_user_seed: usize,
        sink: &EventSink,
    ) -> Result<RunOutcome, AgentError> {
        tracing::info!(skill = %skill.name, "[Plan] Plan&Execute 开始，子任务: {}", sub_task);
        let mut ctx = ExecutionContext::new(ask_user_seed);
        let mut outcome = RunOutcome::default();
        let mut state = EngineState::Preload;

        while state != EngineState::Done {
            if sink.is_closed() {
                tracing::info!(skill = %skill.name, ?state, "[Plan] 事件流已关闭，停止执行");
                return Err(AgentError::Cancelled);
            }
            state = match self
                .transition(state, skill, sub_task, &mut ctx, &mut outcome, sink)
                .await
            {
                Ok(next) => next,
                Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
                Err(e) => {
                    tracing::error!(skill = %skill.name, error = %e, "[Plan] 执行出错");
                    sink.emit(OrchestrationEvent::error(format!("执行出错: {e}")))?;
                    outcome.failed = true;
                    EngineState::Done
                }
            };
        }

        outcome.ask_user_count = ctx.ask_user_count;
        outcome.replan_count = ctx.replan_count;
        outcome.tool_calls = ctx.tool_calls;
        tracing::info!(
            skill = %skill.name,
            steps = ctx.all_steps().count(),
            replans = ctx.replan_count,
            tool_calls = ctx.tool_calls,
            "[Plan] 完成"
        );
        Ok(outcome)
    }

    /// 计算下一状态
    pub async fn transition(
        &self,
        state: EngineState,
        skill: &SkillDefinition,
        sub_task: &str,
        ctx: &mut ExecutionContext,
        outcome: &mut RunOutcome,
        sink: &EventSink,
    ) -> Result<EngineState, AgentError> {
        match state {
            EngineState::Preload => {
                self.preload(skill, ctx).await?;
                Ok(EngineState::Planning)
            }

            EngineState::Planning => {
                sink.emit(OrchestrationEvent::planning("正在分析问题并生成执行计划..."))?;
                let steps = self.plan(sub_task, ctx).await?;
                tracing::info!("[Plan] 初始计划: {:?}", steps);
                ctx.start_plan(steps.clone());
                sink.emit(OrchestrationEvent::Plan { steps })?;
                Ok(EngineState::Executing)
            }

            EngineState::Executing => {
                let Some(step) = ctx.current_step().map(String::from) else {
                    return Ok(EngineState::Finalizing);
                };
                if is_ask_user_step(&step) {
                    return Ok(EngineState::AskingUser);
                }
                let (step_no, total) = display_position(ctx);
                sink.emit(OrchestrationEvent::ActionStart {
                    step: step_no,
                    total,
                    description: step.clone(),
                })?;

                let system = prompts::step_system_prompt(&ctx.skill_prompt, &ctx.tools);
                let user = prompts::step_prompt(&step, sub_task, &ctx.completed_steps);
                let result = match self.step_executor.execute(&system, &user, &ctx.tools).await {
                    Ok(out) => {
                        ctx.tool_calls += out.tool_calls;
                        if out.text.is_empty() {
                            "(无结果)".to_string()
                        } else {
                            out.text
                        }
                    }
                    Err(e) => {
                        tracing::warn!(step = %step, error = %e, "[Action] 步骤执行失败");
                        format!("执行失败: {e}")
                    }
                };
                tracing::info!(
                    "[Action] Step {}: {} → {}",
                    step_no,
                    step,
                    prompts::truncate_chars(&result, 100)
                );
                ctx.record(step.clone(), result.clone());
                sink.emit(OrchestrationEvent::ActionDone {
                    step: step_no,
                    total,
                    description: step,
                    result,
                })?;
                Ok(EngineState::Observing)
            }

            EngineState::Observing => {
                let (step_no, _) = display_position(ctx);
                let verdict = self.observe(sub_task, ctx).await;
                tracing::info!("[Observe] Step {}: {}", step_no, verdict.text());
                sink.emit(OrchestrationEvent::Observe {
                    step: step_no,
                    text: verdict.text().to_string(),
                })?;

                if verdict.needs_replan() {
                    if ctx.replan_count < self.limits.max_replan_rounds {
                        return Ok(EngineState::Replanning {
                            reason: verdict.text().to_string(),
                        });
                    }
                    tracing::warn!(
                        replans = ctx.replan_count,
                        "[RePlan] 已达重新规划上限，继续执行"
                    );
                }
                ctx.advance();
                Ok(EngineState::Executing)
            }

            EngineState::Replanning { reason } => {
                tracing::info!("[RePlan] 第 {} 次重新规划", ctx.replan_count + 1);
                let steps = self.plan(sub_task, ctx).await?;
                tracing::info!("[RePlan] 新计划: {:?}", steps);
                ctx.replan(steps.clone());
                sink.emit(OrchestrationEvent::Replan { reason, steps })?;
                Ok(EngineState::Executing)
            }

            EngineState::AskingUser => {
                let reply = if ctx.ask_user_count >= self.limits.max_ask_user_rounds {
                    tracing::warn!(
                        skill = %skill.name,
                        asked = ctx.ask_user_count,
                        "[Plan] 追问次数已达上限，不再追问"
                    );
                    ctx.ask_user_terminated = false;
                    ASK_USER_EXHAUSTED_REPLY.to_string()
                } else {
                    ctx.ask_user_count += 1;
                    ctx.ask_user_terminated = true;
                    ctx.current_step()
                        .and_then(extract_ask_user_question)
                        .unwrap_or_else(|| DEFAULT_ASK_USER_QUESTION.to_string())
                };
                tracing::info!(skill = %skill.name, "[Plan] 追问用户: {}", reply);
                outcome.ask_user_terminated = ctx.ask_user_terminated;
                outcome.result = Some(reply.clone());
                sink.emit(OrchestrationEvent::result(reply))?;
                Ok(EngineState::Done)
            }

            EngineState::Finalizing => {
                sink.emit(OrchestrationEvent::planning("正在生成最终回复..."))?;
                let prompt = prompts::final_prompt(
                    &ctx.skill_prompt,
                    sub_task,
                    &ctx.superseded_steps,
                    &ctx.completed_steps,
                );
                let answer = complete_prompt(self.llm.as_ref(), None, &prompt)
                    .await?
                    .trim()
                    .to_string();
                outcome.result = Some(answer.clone());
                sink.emit(OrchestrationEvent::result(answer))?;
                Ok(EngineState::Done)
            }

            EngineState::Done => Ok(EngineState::Done),
        }
    }

    /// 直接执行：一次带工具的调用给出回复
    pub async fn run_direct(
        &self,
        skill: &SkillDefinition,
        sub_task: &str,
        sink: &EventSink,
    ) -> Result<RunOutcome, AgentError> {
        tracing::info!(skill = %skill.name, "[Plan] 直接执行，子任务: {}", sub_task);
        let mut ctx = ExecutionContext::new(0);
        let mut outcome = RunOutcome::default();

        let executed = match self.preload(skill, &mut ctx).await {
            Ok(()) => {
                let system = prompts::step_system_prompt(&ctx.skill_prompt, &ctx.tools);
                self.step_executor
                    .execute(&system, &prompts::direct_prompt(sub_task), &ctx.tools)
                    .await
                    .map_err(AgentError::from)
            }
            Err(e) => Err(e),
        };
        if sink.is_closed() {
            return Err(AgentError::Cancelled);
        }

        match executed {
            Ok(out) => {
                outcome.tool_calls = out.tool_calls;
                outcome.result = Some(out.text.clone());
                sink.emit(OrchestrationEvent::result(out.text))?;
            }
            Err(e) => {
                tracing::error!(skill = %skill.name, error = %e, "[Plan] 直接执行出错");
                outcome.failed = true;
                sink.emit(OrchestrationEvent::error(format!("处理请求时出错: {e}")))?;
            }
        }
        Ok(outcome)
    }

    /// 加载技能提示词、解析工具（本次运行内缓存）
    async fn preload(
        &self,
        skill: &SkillDefinition,
        ctx: &mut ExecutionContext,
    ) -> Result<(), AgentError> {
        ctx.skill_prompt = self.catalog.prompt(&skill.name).await?;
        if skill.allowed_tools.is_empty() {
            return Ok(());
        }
        ctx.tools = match self.tools.all_tools().await {
            Ok(live) => resolve_tools(&skill.name, &skill.allowed_tools, &live),
            Err(e) => {
                tracing::warn!(skill = %skill.name, error = %e, "[Plan] 工具不可用，无工具继续执行");
                Vec::new()
            }
        };
        tracing::info!(
            skill = %skill.name,
            tools = ?ctx.tools.iter().map(|t| t.qualified_name.as_str()).collect::<Vec<_>>(),
            "[Plan] 绑定工具"
        );
        Ok(())
    }

    async fn plan(
        &self,
        sub_task: &str,
        ctx: &ExecutionContext,
    ) -> Result<Vec<String>, AgentError> {
        let done: Vec<_> = ctx.all_steps().cloned().collect();
        let prompt = prompts::planner_prompt(&ctx.tools, sub_task, &done);
        let text = complete_prompt(self.llm.as_ref(), None, &prompt).await?;
        Ok(parse_plan(&text))
    }

    async fn observe(&self, sub_task: &str, ctx: &ExecutionContext) -> Verdict {
        let Some(last) = ctx.completed_steps.last() else {
            return parse_verdict(OBSERVE_FALLBACK);
        };
        let prompt = prompts::observer_prompt(
            sub_task,
            &last.step,
            &last.result,
            ctx.remaining_steps(),
            self.limits.observation_preview_chars,
        );
        match complete_prompt(self.llm.as_ref(), None, &prompt).await {
            Ok(text) if !text.trim().is_empty() => parse_verdict(&text),
            Ok(_) => parse_verdict(OBSERVE_FALLBACK),
            Err(e) => {
                tracing::warn!(error = %e, "[Observe] 观察失败，默认继续");
                parse_verdict(OBSERVE_FALLBACK)
            }
        }
    }
}

/// 展示用的 (步骤序号, 总步数)：跨 RePlan 连续编号
fn display_position(ctx: &ExecutionContext) -> (usize, usize) {
    let offset = ctx.display_offset();
    (offset + ctx.step_index + 1, offset + ctx.current_plan().len())
}
