//! 工具解析：把技能声明的短工具名绑定到在线工具
//!
//! 先精确匹配，再匹配以 `_<短名>` 结尾的工具名。在线工具按 Server 配置顺序排列，
//! 同名时取第一个（先配置的 Server 优先）。找不到的工具只记 warn，不影响执行。

use crate::mcp::ToolHandle;

pub fn resolve_tools(skill: &str, allowed: &[String], live: &[ToolHandle]) -> Vec<ToolHandle> {
    let mut bound: Vec<ToolHandle> = Vec::with_capacity(allowed.len());
    for short in allowed {
        match find_tool(short, live) {
            Some(handle) => {
                let duplicate = bound.iter().any(|b| {
                    b.qualified_name == handle.qualified_name && b.server == handle.server
                });
                if !duplicate {
                    bound.push(handle.clone());
                }
            }
            None => {
                tracing::warn!(
                    skill = %skill,
                    tool = %short,
                    "[Skills] 声明的工具在已连接的 Server 上不存在"
                );
            }
        }
    }
    tracing::debug!(
        skill = %skill,
        declared = allowed.len(),
        bound = bound.len(),
        "[Skills] 工具解析完成"
    );
    bound
}

fn find_tool<'a>(short: &str, live: &'a [ToolHandle]) -> Option<&'a ToolHandle> {
    let suffix = format!("_{short}");
    live.iter()
        .find(|t| t.qualified_name == short)
        .or_else(|| live.iter().find(|t| t.qualified_name.ends_with(&suffix)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(server: &str, name: &str) -> ToolHandle {
        ToolHandle {
            server: server.to_string(),
            qualified_name: name.to_string(),
            short_name: name.to_string(),
            description: String::new(),
            parameter_schema: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_suffix_match() {
        let live = vec![handle("srv", "srv_getWeather")];
        let out = resolve_tools("weather", &["getWeather".to_string()], &live);
        assert_eq!(out, vec![live[0].clone()]);
    }

    #[test]
    fn test_exact_match_wins_over_suffix() {
        let live = vec![handle("a", "a_getWeather"), handle("b", "getWeather")];
        let out = resolve_tools("weather", &["getWeather".to_string()], &live);
        assert_eq!(out, vec![live[1].clone()]);
    }

    #[test]
    fn test_first_configured_server_wins_and_missing_dropped() {
        let live = vec![
            handle("business", "business_queryOrder"),
            handle("backup", "backup_queryOrder"),
        ];
        let out = resolve_tools(
            "order-query",
            &["queryOrder".to_string(), "cancelOrder".to_string()],
            &live,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].server, "business");
    }

    #[test]
    fn test_suffix_requires_underscore_boundary() {
        let live = vec![handle("x", "xgetWeather")];
        assert!(resolve_tools("weather", &["getWeather".to_string()], &live).is_empty());
    }
}
