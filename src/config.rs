//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `GATEWAY__*` 覆盖（双下划线表示嵌套，如 `GATEWAY__LLM__PROVIDER=openai`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub mcp: McpSection,
    pub skills: SkillsSection,
    pub engine: EngineSection,
    pub storage: StorageSection,
}

/// [app] 段：应用名、对话记忆窗口、路由历史窗口
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 意图识别时带入的最近对话条数
    pub router_history_messages: usize,
    /// 路由历史中助手回复的截断长度（字符）
    pub assistant_preview_chars: usize,
    /// 每个会话保留的对话条数（滑动窗口）
    pub chat_memory_max_messages: usize,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            router_history_messages: 16,
            assistant_preview_chars: 150,
            chat_memory_max_messages: 50,
        }
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LlmSection {
    /// 后端：deepseek / openai；优先级由 API Key 与 provider 共同决定
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default)]
    pub deepseek: LlmModelSection,
    #[serde(default)]
    pub openai: LlmModelSection,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

fn default_provider() -> String {
    "deepseek".to_string()
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LlmModelSection {
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    /// 单次 LLM 调用超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    60
}

/// [mcp] 段：Tool Server 列表（有序，决定同名工具的优先级）与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct McpSection {
    pub servers: Vec<McpServerSection>,
    /// 获取工具列表的快速超时（秒）
    pub fetch_timeout_secs: u64,
    /// 单次 RPC（含工具调用）超时（秒）
    pub request_timeout_secs: u64,
    /// 同时进行的 LLM / Tool Server I/O 上限
    pub max_concurrent_io: usize,
}

impl Default for McpSection {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            fetch_timeout_secs: 5,
            request_timeout_secs: 30,
            max_concurrent_io: 8,
        }
    }
}

/// [[mcp.servers]]：一个 Tool Server
#[derive(Debug, Clone, Deserialize)]
pub struct McpServerSection {
    pub name: String,
    pub url: String,
}

/// [skills] 段：技能目录、兜底技能、候选检索
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SkillsSection {
    pub dir: PathBuf,
    pub fallback: String,
    pub top_k: usize,
    pub embedding_enabled: bool,
    pub embedding_model: String,
}

impl Default for SkillsSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("config/skills"),
            fallback: "chitchat".to_string(),
            top_k: 5,
            embedding_enabled: false,
            embedding_model: "text-embedding-3-small".to_string(),
        }
    }
}

/// 单个意图的执行方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Plan → Execute → Observe → RePlan 循环
    #[default]
    PlanExecute,
    /// 一次带工具的调用直接回复
    Direct,
}

/// [engine] 段：Plan-and-Execute 的各类上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub mode: ExecutionMode,
    pub max_replan_rounds: usize,
    pub max_ask_user_rounds: usize,
    /// 单个步骤内最多连续调用工具的轮数
    pub max_tool_rounds_per_step: usize,
    /// Observer 看到的步骤结果最大字符数
    pub observation_preview_chars: usize,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::PlanExecute,
            max_replan_rounds: 3,
            max_ask_user_rounds: 4,
            max_tool_rounds_per_step: 5,
            observation_preview_chars: 500,
        }
    }
}

/// [storage] 段：SQLite 路径（启用 async-sqlite feature 时生效）
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StorageSection {
    pub sqlite_path: Option<PathBuf>,
}

/// 从 config 目录加载配置，环境变量 GATEWAY__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 GATEWAY__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("GATEWAY")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
