use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use opsgraph_core::config::ToolsConfig;
use opsgraph_core::error::{OpsError, Result};
use opsgraph_core::traits::Tool;
use opsgraph_core::types::{ToolContext, ToolDefinition, ToolResult};

use crate::builtin::{HealthScanTool, HttpProbeTool, RunbookTool};

/// Registry of available tools.
///
/// Every call made through the registry is bounded by a timeout: the
/// tool's own override, or the registry default.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    default_timeout_secs: u64,
}

impl ToolRegistry {
    pub fn new(default_timeout_secs: u64) -> Self {
        Self {
            tools: HashMap::new(),
            default_timeout_secs,
        }
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: impl Tool) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered tool names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Definitions for the named tools, in the given order. Unknown names are skipped.
    pub fn definitions_for(&self, names: &[String]) -> Vec<ToolDefinition> {
        names
            .iter()
            .filter_map(|n| self.tools.get(n))
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    fn timeout_for(&self, tool: &dyn Tool) -> u64 {
        tool.timeout_secs().unwrap_or(self.default_timeout_secs)
    }

    /// Execute a tool by name under its timeout.
    pub async fn execute(
        &self,
        name: &str,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolResult> {
        let tool = self
            .get(name)
            .ok_or_else(|| OpsError::ToolNotFound(name.to_string()))?;

        let timeout_secs = self.timeout_for(tool.as_ref());
        debug!(tool = name, node = %ctx.node, timeout_secs, "Executing tool");

        match tokio::time::timeout(Duration::from_secs(timeout_secs), tool.execute(input, ctx)).await
        {
            Ok(result) => result,
            Err(_) => Err(OpsError::ToolTimeout {
                tool: name.to_string(),
                timeout_secs,
            }),
        }
    }

    /// Registry with the built-in troubleshooting tools.
    pub fn with_builtins(config: &ToolsConfig) -> Self {
        let mut registry = Self::new(config.timeout_secs);
        registry.register(HttpProbeTool::new(config.timeout_secs));
        registry.register(HealthScanTool::from_config(config));
        registry.register(RunbookTool::new(config.runbooks.clone(), config.timeout_secs));
        registry
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::with_builtins(&ToolsConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsgraph_core::types::SessionId;
    use opsgraph_test_utils::{SlowTool, StubTool};

    fn ctx() -> ToolContext {
        ToolContext {
            session_id: SessionId::from_string("t-1"),
            node: "K8s_Specialist".into(),
        }
    }

    #[test]
    fn builtins_are_registered() {
        let registry = ToolRegistry::default();
        assert_eq!(registry.list(), vec!["health_scan", "http_probe", "run_runbook"]);
    }

    #[test]
    fn definitions_follow_requested_order() {
        let registry = ToolRegistry::default();
        let defs = registry.definitions_for(&[
            "run_runbook".to_string(),
            "missing".to_string(),
            "http_probe".to_string(),
        ]);
        let names: Vec<_> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["run_runbook", "http_probe"]);
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error() {
        let registry = ToolRegistry::new(10);
        let err = registry
            .execute("kubectl", serde_json::json!({}), ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, OpsError::ToolNotFound(name) if name == "kubectl"));
    }

    #[tokio::test]
    async fn executes_registered_tool() {
        let mut registry = ToolRegistry::new(10);
        registry.register(StubTool::new("pods", "3/3 running"));
        let result = registry
            .execute("pods", serde_json::json!({}), ctx())
            .await
            .unwrap();
        assert_eq!(result.content, "3/3 running");
        assert!(!result.is_error);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tool_times_out() {
        let mut registry = ToolRegistry::new(2);
        registry.register(SlowTool::new("metrics", Duration::from_secs(30)));
        let err = registry
            .execute("metrics", serde_json::json!({}), ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, OpsError::ToolTimeout { timeout_secs: 2, .. }));
    }
}
