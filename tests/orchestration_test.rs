//! 端到端测试：SkillAgent + Mock LLM + 进程内假 Tool Server

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;

use skill_gateway::config::{AppConfig, McpServerSection};
use skill_gateway::core::{McpError, TaskScheduler};
use skill_gateway::llm::{LlmError, MockLlmClient};
use skill_gateway::mcp::{McpTool, ToolConnectionManager, ToolServerConnector, ToolServerSession};
use skill_gateway::memory::{
    ChatMemory, InMemoryChatMemory, InMemoryPendingIntentStore, PendingIntentStore, Role,
};
use skill_gateway::router::Intent;
use skill_gateway::skills::{SkillCatalog, SkillDefinition, SkillIndex, SkillLoader};
use skill_gateway::{AgentParts, OrchestrationEvent, SkillAgent};

/// 假 Tool Server：固定工具与回复，记录调用
#[derive(Clone, Default)]
struct FakeServer {
    tools: Vec<(&'static str, &'static str)>,
    calls: Arc<Mutex<Vec<String>>>,
}

struct FakeSession {
    server: FakeServer,
}

#[async_trait]
impl ToolServerSession for FakeSession {
    async fn list_tools(&self) -> Result<Vec<McpTool>, McpError> {
        Ok(self
            .server
            .tools
            .iter()
            .map(|(name, _)| McpTool {
                name: name.to_string(),
                description: format!("{name} 工具"),
                input_schema: serde_json::json!({"type": "object"}),
            })
            .collect())
    }

    async fn call_tool(&self, name: &str, _args: Value) -> Result<String, McpError> {
        self.server.calls.lock().unwrap().push(name.to_string());
        self.server
            .tools
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, reply)| reply.to_string())
            .ok_or_else(|| McpError::Rpc {
                code: -32601,
                message: format!("unknown tool {name}"),
            })
    }

    async fn close(&self) -> Result<(), McpError> {
        Ok(())
    }
}

#[derive(Default)]
struct FakeConnector {
    servers: HashMap<String, FakeServer>,
}

#[async_trait]
impl ToolServerConnector for FakeConnector {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn ToolServerSession>, McpError> {
        match self.servers.get(endpoint) {
            Some(server) => Ok(Arc::new(FakeSession {
                server: server.clone(),
            })),
            None => Err(McpError::Transport("connection refused".into())),
        }
    }
}

struct Harness {
    agent: SkillAgent,
    memory: Arc<InMemoryChatMemory>,
    pending: Arc<InMemoryPendingIntentStore>,
    tool_calls: Arc<Mutex<Vec<String>>>,
}

fn skills_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config/skills")
}

async fn harness_with(llm: MockLlmClient, catalog: SkillCatalog, servers_up: bool) -> Harness {
    let mut cfg = AppConfig::default();
    cfg.mcp.servers = vec![
        McpServerSection {
            name: "business".into(),
            url: "mem://business".into(),
        },
        McpServerSection {
            name: "weather".into(),
            url: "mem://weather".into(),
        },
    ];

    let calls = Arc::new(Mutex::new(Vec::new()));
    let mut connector = FakeConnector::default();
    if servers_up {
        connector.servers.insert(
            "mem://business".into(),
            FakeServer {
                tools: vec![
                    ("queryOrder", "订单 ORD20250201001：蓝牙耳机，¥299，已发货"),
                    ("applyRefund", "退款单 RF001 已创建，状态 PENDING"),
                    ("trackLogistics", "顺丰 SF1234567890，派送中，预计今天送达"),
                ],
                calls: calls.clone(),
            },
        );
        connector.servers.insert(
            "mem://weather".into(),
            FakeServer {
                tools: vec![("getWeather", "北京：晴，25°C，湿度 30%")],
                calls: calls.clone(),
            },
        );
    }

    let tools = Arc::new(ToolConnectionManager::new(
        &cfg.mcp,
        Arc::new(connector),
        TaskScheduler::default(),
    ));
    tools.connect_all().await;

    let memory = Arc::new(InMemoryChatMemory::new(50));
    let pending = Arc::new(InMemoryPendingIntentStore::new());
    let agent = SkillAgent::new(AgentParts {
        config: cfg,
        llm: Arc::new(llm),
        tools,
        catalog: Arc::new(catalog),
        index: SkillIndex::disabled(),
        memory: memory.clone(),
        pending: pending.clone(),
    });
    Harness {
        agent,
        memory,
        pending,
        tool_calls: calls,
    }
}

async fn harness(llm: MockLlmClient) -> Harness {
    let skills = SkillLoader::new(skills_dir()).load_all().unwrap();
    harness_with(llm, SkillCatalog::new(skills, "chitchat"), true).await
}

async fn collect(agent: &SkillAgent, conversation: &str, message: &str) -> Vec<OrchestrationEvent> {
    agent.handle_turn(conversation, message).collect().await
}

fn assert_single_done(events: &[OrchestrationEvent]) {
    let dones = events
        .iter()
        .filter(|e| matches!(e, OrchestrationEvent::Done))
        .count();
    assert_eq!(dones, 1, "events: {events:?}");
    assert_eq!(events.last(), Some(&OrchestrationEvent::Done));
}

fn last_result(events: &[OrchestrationEvent]) -> Option<&str> {
    events.iter().rev().find_map(|e| match e {
        OrchestrationEvent::Result { content } => Some(content.as_str()),
        _ => None,
    })
}

const ORDER: &str = "ORD20250201001";

#[test]
fn test_bundled_skills_load() {
    let skills = SkillLoader::new(skills_dir()).load_all().unwrap();
    let names: Vec<_> = skills.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["chitchat", "data-analysis", "logistics", "order-query", "refund", "weather"]
    );
    let weather = skills.iter().find(|s| s.name == "weather").unwrap();
    assert_eq!(weather.allowed_tools, vec!["getWeather", "getWeatherForecast"]);
    assert!(skills.iter().find(|s| s.name == "chitchat").unwrap().allowed_tools.is_empty());
}

#[tokio::test]
async fn test_weather_and_logistics_in_one_turn() {
    let llm = MockLlmClient::new()
        .on(
            "意图识别路由器",
            format!("weather|查询北京天气\nlogistics|查询订单{ORDER}的物流"),
        )
        .on(
            "用户一次提出了多个问题",
            format!("北京今天晴，25°C。订单{ORDER}已由顺丰发出，正在派送中。"),
        )
        .on_all(
            &["任务规划器", "北京"],
            "调用 getWeather 查询北京天气\n整理结果并回复用户",
        )
        .on_all(
            &["任务规划器", ORDER],
            "调用 trackLogistics 查询物流\n整理结果并回复用户",
        )
        .on("任务观察者", "OK: 结果正常")
        .on_all(&["最终完整回复", "北京"], "北京今天晴，25°C。")
        .on_all(
            &["最终完整回复", ORDER],
            format!("订单{ORDER}已由顺丰发出，正在派送中。"),
        )
        .on("工具 getWeather 返回", "北京：晴，25°C")
        .on("工具 trackLogistics 返回", "顺丰派送中")
        .on(
            "你正在执行以下步骤: 调用 getWeather",
            r#"{"tool": "getWeather", "args": {"city": "北京"}}"#,
        )
        .on(
            "你正在执行以下步骤: 调用 trackLogistics",
            format!(r#"{{"tool": "trackLogistics", "args": {{"orderNo": "{ORDER}"}}}}"#),
        )
        .on("你正在执行以下步骤", "已整理");
    let h = harness(llm).await;

    let message = format!("北京天气怎么样，还有帮我查一下{ORDER}的物流");
    let events = collect(&h.agent, "c1", &message).await;
    assert_single_done(&events);

    // 第一个意图的事件全部出现在第二个意图开始之前
    let starts: Vec<(usize, &str)> = events
        .iter()
        .enumerate()
        .filter_map(|(i, e)| match e {
            OrchestrationEvent::SkillStart { skill, .. } => Some((i, skill.as_str())),
            _ => None,
        })
        .collect();
    assert_eq!(starts.len(), 2);
    assert_eq!(starts[0].1, "weather");
    assert_eq!(starts[1].1, "logistics");
    let weather_result = events
        .iter()
        .position(|e| matches!(e, OrchestrationEvent::Result { content } if content == "北京今天晴，25°C。"))
        .unwrap();
    assert!(weather_result < starts[1].0);

    let reply = last_result(&events).unwrap();
    assert!(reply.contains("北京"));
    assert!(reply.contains(ORDER));
    assert_eq!(
        *h.tool_calls.lock().unwrap(),
        vec!["getWeather".to_string(), "trackLogistics".to_string()]
    );

    let transcript = h.memory.read("c1").await.unwrap();
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[0].role, Role::User);
    assert_eq!(transcript[1].content, reply);
}

#[tokio::test]
async fn test_clarifying_question_defers_remaining_intents() {
    let llm = MockLlmClient::new()
        .on("意图识别路由器", "refund|帮我退款\nweather|查询北京天气")
        .on("意图识别路由器", format!("refund|为订单{ORDER}申请退款"))
        .on("用户一次提出了多个问题", "退款已提交；北京晴")
        .on_all(&["任务规划器", "帮我退款"], "追问用户：请提供需要退款的订单号")
        .on("任务规划器", "回复用户")
        .on("任务观察者", "OK")
        .on_all(&["最终完整回复", ORDER], "退款已提交")
        .on_all(&["最终完整回复", "北京"], "北京晴")
        .on("你正在执行以下步骤", "已处理");
    let h = harness(llm).await;

    let first = h.agent.handle_turn_text("c2", "帮我退款，另外北京天气怎么样").await;
    assert_eq!(first, "请提供需要退款的订单号");
    assert_eq!(
        h.pending.get("c2").await.unwrap(),
        vec![Intent::new("weather", "查询北京天气")]
    );

    let events = collect(&h.agent, "c2", ORDER).await;
    assert_single_done(&events);
    let skills: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            OrchestrationEvent::SkillStart { skill, .. } => Some(skill.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(skills, vec!["refund", "weather"]);
    assert_eq!(last_result(&events), Some("退款已提交；北京晴"));
    assert!(h.pending.get("c2").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_planning_failure_reports_one_error() {
    let llm = MockLlmClient::new()
        .on("意图识别路由器", "weather|查询北京天气")
        .fail_on("任务规划器", LlmError::Request("503 Service Unavailable".into()));
    let h = harness(llm).await;

    let events = collect(&h.agent, "c3", "北京天气").await;
    assert_single_done(&events);
    let errors = events.iter().filter(|e| e.kind() == "error").count();
    assert_eq!(errors, 1);
    assert!(last_result(&events).is_none());
    // 没有回复时只记录用户消息
    assert_eq!(h.memory.read("c3").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_missing_fallback_skill_is_turn_error() {
    let llm = MockLlmClient::new().on("意图识别路由器", "完全无法理解");
    let catalog = SkillCatalog::new(
        vec![SkillDefinition::inline("weather", "天气", &["getWeather"], "你是天气助手。")],
        "chitchat",
    );
    let h = harness_with(llm, catalog, true).await;

    let events = collect(&h.agent, "c4", "随便说点什么").await;
    assert_single_done(&events);
    assert!(matches!(
        &events[events.len() - 2],
        OrchestrationEvent::Error { message } if message.contains("fallback")
    ));
}

#[tokio::test]
async fn test_unreachable_servers_degrade_to_no_tools() {
    let llm = MockLlmClient::new()
        .on("意图识别路由器", "weather")
        .on("任务规划器", "回复用户")
        .on("任务观察者", "OK")
        .on("最终完整回复", "抱歉，天气服务暂时不可用。")
        .on("你正在执行以下步骤", "无法查询");
    let skills = SkillLoader::new(skills_dir()).load_all().unwrap();
    let h = harness_with(llm, SkillCatalog::new(skills, "chitchat"), false).await;

    let reply = h.agent.handle_turn_text("c5", "北京天气").await;
    assert_eq!(reply, "抱歉，天气服务暂时不可用。");

    let health = h.agent.health().await;
    assert_eq!(health.status, "DEGRADED");
    assert_eq!(health.tool_count, 0);
    assert!(h.agent.list_available_tools().await.is_err());
}

#[tokio::test]
async fn test_operational_controls() {
    let h = harness(MockLlmClient::new()).await;

    let skills = h.agent.list_skills();
    assert_eq!(skills.len(), 6);
    assert!(skills.contains_key("logistics"));

    let tools: Vec<String> = h
        .agent
        .list_available_tools()
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.name)
        .collect();
    assert_eq!(
        tools,
        vec!["queryOrder", "applyRefund", "trackLogistics", "getWeather"]
    );

    assert_eq!(
        h.agent.reconnect(Some("weather")).await,
        vec![("weather".to_string(), true)]
    );
    assert_eq!(
        h.agent.reconnect(Some("weather")).await,
        vec![("weather".to_string(), true)]
    );
    assert_eq!(
        h.agent.reconnect(Some("nope")).await,
        vec![("nope".to_string(), false)]
    );
    assert_eq!(h.agent.reconnect(None).await.len(), 2);

    let health = h.agent.health().await;
    assert_eq!(health.status, "UP");
    assert_eq!(health.tool_count, 4);
    assert_eq!(health.fallback_skill, "chitchat");

    h.agent.shutdown().await;
    let events = collect(&h.agent, "c6", "你好").await;
    assert_single_done(&events);
    assert!(events.iter().any(|e| e.kind() == "error"));
}
