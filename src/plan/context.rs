//! 单个意图的执行上下文：在状态机各阶段之间显式传递

use crate::mcp::ToolHandle;

/// 一个已执行步骤及其结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub step: String,
    pub result: String,
}

#[derive(Debug, Default)]
pub struct ExecutionContext {
    /// 当前计划已执行的步骤（按执行顺序，不重排）
    pub completed_steps: Vec<StepRecord>,
    /// 被 RePlan 作废的计划中已执行的步骤，仅作为最终回复的背景
    pub superseded_steps: Vec<StepRecord>,
    /// 计划历史，最后一个是当前计划
    pub plan_history: Vec<Vec<String>>,
    pub step_index: usize,
    pub replan_count: usize,
    pub ask_user_count: usize,
    pub ask_user_terminated: bool,
    /// 本次运行共调用工具的次数
    pub tool_calls: usize,
    /// Preload 阶段缓存的技能提示词与已绑定工具
    pub skill_prompt: String,
    pub tools: Vec<ToolHandle>,
}

impl ExecutionContext {
    /// ask_user_count 从同一技能在本会话中连续追问的次数开始计
    pub fn new(ask_user_seed: usize) -> Self {
        Self {
            ask_user_count: ask_user_seed,
            ..Self::default()
        }
    }

    pub fn current_plan(&self) -> &[String] {
        self.plan_history.last().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn current_step(&self) -> Option<&str> {
        self.current_plan().get(self.step_index).map(String::as_str)
    }

    /// 当前步骤之后的剩余步骤
    pub fn remaining_steps(&self) -> &[String] {
        let plan = self.current_plan();
        let next = (self.step_index + 1).min(plan.len());
        &plan[next..]
    }

    pub fn start_plan(&mut self, steps: Vec<String>) {
        self.plan_history.push(steps);
        self.step_index = 0;
    }

    pub fn record(&mut self, step: impl Into<String>, result: impl Into<String>) {
        self.completed_steps.push(StepRecord {
            step: step.into(),
            result: result.into(),
        });
    }

    /// 前进到下一步，不会越过当前计划末尾
    pub fn advance(&mut self) {
        self.step_index = (self.step_index + 1).min(self.current_plan().len());
    }

    /// 用新计划替换：已完成步骤移入归档，游标归零，计数加一
    pub fn replan(&mut self, steps: Vec<String>) {
        self.superseded_steps.append(&mut self.completed_steps);
        self.replan_count += 1;
        self.start_plan(steps);
    }

    /// 用于展示的全局步骤序号偏移（之前计划中已执行的步数）
    pub fn display_offset(&self) -> usize {
        self.superseded_steps.len()
    }

    /// 所有已执行步骤（归档在前）
    pub fn all_steps(&self) -> impl Iterator<Item = &StepRecord> {
        self.superseded_steps.iter().chain(self.completed_steps.iter())
    }
}
