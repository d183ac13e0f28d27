//! 技能系统
//!
//! 技能（Skill）是一段独立的系统提示词加上一组允许使用的远程工具。
//!
//! 目录结构：
//! ```text
//! config/skills/
//! ├── weather/
//! │   └── SKILL.md        # frontmatter（name / description / allowed-tools）+ 系统提示词
//! └── ...
//! ```

pub mod catalog;
pub mod index;
pub mod loader;
pub mod resolver;

pub use catalog::SkillCatalog;
pub use index::SkillIndex;
pub use loader::{load_prompt, PromptSource, SkillDefinition, SkillLoader};
pub use resolver::resolve_tools;
