//! 意图与路由输出解析
//!
//! LLM 每行返回一个意图：`skill名称|子任务描述`，或只返回 `skill名称`（子任务即原始消息）。
//! 技能名小写后与目录模糊匹配，匹配不到的行丢弃。

use serde::{Deserialize, Serialize};

use crate::skills::SkillCatalog;

/// 一个意图：由哪个 Skill 处理什么子任务
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub skill_name: String,
    pub sub_task: String,
}

impl Intent {
    pub fn new(skill_name: impl Into<String>, sub_task: impl Into<String>) -> Self {
        Self {
            skill_name: skill_name.into(),
            sub_task: sub_task.into(),
        }
    }
}

/// 解析路由输出，保持行序；不去重
pub fn parse_route_output(output: &str, original: &str, catalog: &SkillCatalog) -> Vec<Intent> {
    output
        .lines()
        .map(clean_line)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let (raw_skill, sub_task) = match line.split_once(['|', '｜']) {
                Some((skill, task)) => (skill, task.trim()),
                None => (line, ""),
            };
            let skill = catalog.fuzzy_match(raw_skill)?;
            let sub_task = if sub_task.is_empty() { original } else { sub_task };
            Some(Intent::new(skill.name.clone(), sub_task))
        })
        .collect()
}

/// 去掉列表符号、序号、引号与反引号
fn clean_line(line: &str) -> &str {
    let line = line.trim();
    let line = line
        .trim_start_matches(|c: char| c.is_ascii_digit())
        .trim_start_matches(['.', '、', ')', '-', '*', '→'])
        .trim();
    line.trim_matches(['`', '"', '\'', '“', '”']).trim()
}
