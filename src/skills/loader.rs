//! 技能加载器
//!
//! 扫描 `<skills_dir>/<name>/SKILL.md`：启动时只读 frontmatter（name / description / allowed-tools），
//! 正文（系统提示词）在技能首次被激活时再读取。

use std::path::{Path, PathBuf};

use anyhow::Context;

/// 提示词来源：文件（懒加载）或内联文本
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptSource {
    File(PathBuf),
    Inline(String),
}

/// 技能定义（启动后不可变）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkillDefinition {
    pub name: String,
    pub description: String,
    /// 短工具名，保持声明顺序
    pub allowed_tools: Vec<String>,
    pub prompt_source: PromptSource,
}

impl SkillDefinition {
    /// 内联定义（测试与内置技能使用）
    pub fn inline(
        name: impl Into<String>,
        description: impl Into<String>,
        allowed_tools: &[&str],
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            allowed_tools: allowed_tools.iter().map(|s| s.to_string()).collect(),
            prompt_source: PromptSource::Inline(prompt.into()),
        }
    }

    /// 用于检索与路由的简短描述
    pub fn summary(&self) -> String {
        format!("{}: {}", self.name, self.description)
    }
}

/// frontmatter 字段
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SkillFrontmatter {
    pub name: Option<String>,
    pub description: String,
    pub allowed_tools: Vec<String>,
}

/// 拆分 SKILL.md：返回 (frontmatter, 正文)。没有 frontmatter 或未闭合时返回 None
pub fn split_skill_md(content: &str) -> Option<(SkillFrontmatter, &str)> {
    let content = content.trim_start_matches('\u{feff}');
    let rest = content.strip_prefix("---")?;
    let rest = rest.strip_prefix("\r\n").or_else(|| rest.strip_prefix('\n'))?;
    let end = rest
        .match_indices("\n---")
        .map(|(i, _)| i)
        .next()?;
    let header = &rest[..end];
    let body = rest[end + 4..].trim_start_matches(['\r', '\n']);

    let mut fm = SkillFrontmatter::default();
    for line in header.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().trim_matches(['"', '\'']);
        match key.trim() {
            "name" => fm.name = Some(value.to_string()).filter(|v| !v.is_empty()),
            "description" => fm.description = value.to_string(),
            "allowed-tools" => {
                fm.allowed_tools = value
                    .split(|c: char| c.is_whitespace() || c == ',')
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect();
            }
            _ => {}
        }
    }
    Some((fm, body))
}

/// 技能加载器
pub struct SkillLoader {
    skills_dir: PathBuf,
}

impl SkillLoader {
    pub fn new(skills_dir: impl AsRef<Path>) -> Self {
        Self {
            skills_dir: skills_dir.as_ref().to_path_buf(),
        }
    }

    pub fn skills_dir(&self) -> &Path {
        &self.skills_dir
    }

    /// 扫描目录，按名称排序返回所有技能定义；无效文件跳过并告警
    pub fn load_all(&self) -> anyhow::Result<Vec<SkillDefinition>> {
        let mut skills = Vec::new();
        if !self.skills_dir.exists() {
            tracing::warn!(dir = %self.skills_dir.display(), "[Skills] 技能目录不存在");
            return Ok(skills);
        }

        let entries = std::fs::read_dir(&self.skills_dir)
            .with_context(|| format!("read skills dir {}", self.skills_dir.display()))?;
        for entry in entries.flatten() {
            let path = entry.path().join("SKILL.md");
            if !path.is_file() {
                continue;
            }
            match load_definition(&path) {
                Ok(Some(def)) => skills.push(def),
                Ok(None) => tracing::warn!(file = %path.display(), "[Skills] SKILL.md 格式无效，跳过"),
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "[Skills] 读取 SKILL.md 失败")
                }
            }
        }
        skills.sort_by(|a, b| a.name.cmp(&b.name));
        tracing::info!("[Skills] 已加载 {} 个技能", skills.len());
        Ok(skills)
    }
}

fn load_definition(path: &Path) -> anyhow::Result<Option<SkillDefinition>> {
    let content = std::fs::read_to_string(path)?;
    let Some((fm, _body)) = split_skill_md(&content) else {
        return Ok(None);
    };
    let Some(name) = fm.name else {
        return Ok(None);
    };
    Ok(Some(SkillDefinition {
        name: name.to_lowercase(),
        description: fm.description,
        allowed_tools: fm.allowed_tools,
        prompt_source: PromptSource::File(path.to_path_buf()),
    }))
}

/// 读取技能正文（系统提示词）
pub async fn load_prompt(source: &PromptSource) -> anyhow::Result<String> {
    match source {
        PromptSource::Inline(text) => Ok(text.clone()),
        PromptSource::File(path) => {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("read {}", path.display()))?;
            Ok(split_skill_md(&content)
                .map(|(_, body)| body.trim().to_string())
                .unwrap_or_else(|| content.trim().to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WEATHER: &str = "---\nname: weather\ndescription: 查询城市天气\nallowed-tools: getWeather, getForecast queryCity\n---\n\n你是天气助手。\n";

    #[test]
    fn test_split_frontmatter_and_body() {
        let (fm, body) = split_skill_md(WEATHER).unwrap();
        assert_eq!(fm.name.as_deref(), Some("weather"));
        assert_eq!(fm.description, "查询城市天气");
        assert_eq!(fm.allowed_tools, vec!["getWeather", "getForecast", "queryCity"]);
        assert_eq!(body.trim(), "你是天气助手。");
    }

    #[test]
    fn test_missing_or_unterminated_frontmatter() {
        assert!(split_skill_md("no frontmatter").is_none());
        assert!(split_skill_md("---\nname: x\nbody without end").is_none());
    }

    #[tokio::test]
    async fn test_load_all_skips_invalid_and_loads_body_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let weather = dir.path().join("weather");
        std::fs::create_dir(&weather).unwrap();
        std::fs::write(weather.join("SKILL.md"), WEATHER).unwrap();
        let broken = dir.path().join("broken");
        std::fs::create_dir(&broken).unwrap();
        std::fs::write(broken.join("SKILL.md"), "---\ndescription: no name\n---\nbody").unwrap();

        let skills = SkillLoader::new(dir.path()).load_all().unwrap();
        assert_eq!(skills.len(), 1);
        assert_eq!(skills[0].name, "weather");

        std::fs::write(
            weather.join("SKILL.md"),
            WEATHER.replace("你是天气助手。", "更新后的提示词"),
        )
        .unwrap();
        let prompt = load_prompt(&skills[0].prompt_source).await.unwrap();
        assert_eq!(prompt, "更新后的提示词");
    }
}
