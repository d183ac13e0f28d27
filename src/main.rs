//! Skill Gateway 交互式入口
//!
//! 初始化日志、按配置构建 SkillAgent，然后在终端里逐行对话。
//! 命令：/tools、/skills、/health、/reconnect [server]、/new、/quit

use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use futures_util::StreamExt;
use skill_gateway::config::{load_config, AppConfig};
use skill_gateway::{observability, OrchestrationEvent, SkillAgent};
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "[Config] 配置加载失败，使用默认配置");
        AppConfig::default()
    });

    let agent = SkillAgent::from_config(&cfg)
        .await
        .context("Failed to create agent")?;
    let name = cfg.app.name.clone().unwrap_or_else(|| "Skill Gateway".to_string());
    println!("{name} 已启动，输入 /quit 退出");

    let mut conversation_id = uuid::Uuid::new_v4().to_string();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        std::io::stdout().flush().context("flush stdout")?;
        let Some(line) = lines.next_line().await.context("read stdin")? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line {
            "/quit" | "/exit" => break,
            "/new" => {
                conversation_id = uuid::Uuid::new_v4().to_string();
                println!("新会话: {conversation_id}");
            }
            "/skills" => {
                for (name, desc) in agent.list_skills() {
                    println!("  {name}: {desc}");
                }
            }
            "/tools" => match agent.list_available_tools().await {
                Ok(tools) => {
                    for t in tools {
                        println!("  {}: {}", t.name, t.description);
                    }
                }
                Err(e) => println!("获取工具列表失败: {e}"),
            },
            "/health" => {
                let report = agent.health().await;
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            cmd if cmd.starts_with("/reconnect") => {
                let target = cmd.trim_start_matches("/reconnect").trim();
                let target = (!target.is_empty()).then_some(target);
                for (server, ok) in agent.reconnect(target).await {
                    println!("  {server}: {}", if ok { "已重连" } else { "重连失败" });
                }
            }
            message => {
                let mut stream = agent.handle_turn(conversation_id.clone(), message);
                while let Some(event) = stream.next().await {
                    print_event(&event);
                }
            }
        }
    }

    agent.shutdown().await;
    Ok(())
}

fn print_event(event: &OrchestrationEvent) {
    match event {
        OrchestrationEvent::Planning { message } => println!("{message}"),
        OrchestrationEvent::Plan { steps } => {
            println!("📋 执行计划:");
            for (i, s) in steps.iter().enumerate() {
                println!("  {}. {s}", i + 1);
            }
        }
        OrchestrationEvent::SkillStart {
            current,
            total,
            skill,
            sub_task,
        } => println!("▶ [{current}/{total}] {skill}: {sub_task}"),
        OrchestrationEvent::ActionStart {
            step,
            total,
            description,
        } => println!("⚙ 步骤 {step}/{total}: {description}"),
        OrchestrationEvent::ActionDone { step, result, .. } => {
            println!("✓ 步骤 {step} 完成: {result}")
        }
        OrchestrationEvent::Observe { text, .. } => println!("👀 {text}"),
        OrchestrationEvent::Replan { reason, steps } => {
            println!("🔄 重新规划（{reason}）: {}", steps.join(" → "))
        }
        OrchestrationEvent::Result { content } => println!("\n{content}\n"),
        OrchestrationEvent::Error { message } => println!("❌ {message}"),
        OrchestrationEvent::Done => {}
    }
}
