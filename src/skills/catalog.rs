//! 技能目录：启动时加载的不可变技能表 + 懒加载的提示词缓存

use std::collections::{BTreeMap, HashMap};

use tokio::sync::RwLock;

use crate::core::AgentError;
use crate::skills::loader::{load_prompt, SkillDefinition};

pub struct SkillCatalog {
    /// 按名称排序
    skills: Vec<SkillDefinition>,
    fallback: String,
    prompts: RwLock<HashMap<String, String>>,
}

impl SkillCatalog {
    pub fn new(mut skills: Vec<SkillDefinition>, fallback: impl Into<String>) -> Self {
        skills.sort_by(|a, b| a.name.cmp(&b.name));
        skills.dedup_by(|a, b| a.name == b.name);
        let fallback = fallback.into();
        if !skills.iter().any(|s| s.name == fallback) {
            tracing::warn!(fallback = %fallback, "[Skills] 兜底技能不在技能目录中");
        }
        Self {
            skills,
            fallback,
            prompts: RwLock::new(HashMap::new()),
        }
    }

    pub fn all(&self) -> &[SkillDefinition] {
        &self.skills
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&SkillDefinition> {
        self.skills.iter().find(|s| s.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.skills.iter().map(|s| s.name.clone()).collect()
    }

    /// name → description
    pub fn descriptions(&self) -> BTreeMap<String, String> {
        self.skills
            .iter()
            .map(|s| (s.name.clone(), s.description.clone()))
            .collect()
    }

    pub fn fallback_name(&self) -> &str {
        &self.fallback
    }

    /// 兜底技能（未配置或不在目录中时为 None）
    pub fn fallback(&self) -> Option<&SkillDefinition> {
        self.get(&self.fallback)
    }

    /// 名称模糊匹配：小写后精确匹配，否则按目录顺序找第一个名称出现在输入中的技能
    pub fn fuzzy_match(&self, raw: &str) -> Option<&SkillDefinition> {
        let name = raw.trim().to_lowercase();
        if name.is_empty() {
            return None;
        }
        self.get(&name).or_else(|| {
            self.skills
                .iter()
                .find(|s| name.contains(s.name.as_str()))
        })
    }

    /// 取技能定义；不存在时退回兜底技能，兜底也不存在时报错
    pub fn resolve_or_fallback(&self, name: &str) -> Result<&SkillDefinition, AgentError> {
        if let Some(skill) = self.get(name) {
            return Ok(skill);
        }
        tracing::warn!(skill = %name, fallback = %self.fallback, "[SkillRouter] 未知技能，使用兜底技能");
        self.fallback().ok_or(AgentError::NoFallbackSkill)
    }

    /// 技能的系统提示词，首次读取后缓存
    pub async fn prompt(&self, name: &str) -> Result<String, AgentError> {
        if let Some(p) = self.prompts.read().await.get(name) {
            return Ok(p.clone());
        }
        let skill = self
            .get(name)
            .ok_or_else(|| AgentError::SkillNotFound(name.to_string()))?;
        let prompt = load_prompt(&skill.prompt_source)
            .await
            .map_err(|e| AgentError::Config(format!("load prompt of {name}: {e}")))?;
        self.prompts
            .write()
            .await
            .insert(name.to_string(), prompt.clone());
        tracing::debug!(skill = %name, chars = prompt.chars().count(), "[Skills] 技能提示词已加载");
        Ok(prompt)
    }
}
