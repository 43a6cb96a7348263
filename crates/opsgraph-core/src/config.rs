use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{OpsError, Result};

/// Top-level opsgraph configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub fallback_models: Vec<ModelConfig>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Worker roster. Empty means the built-in roster.
    #[serde(default)]
    pub nodes: Vec<NodeDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Ask the backend for a JSON object response (set per call by the supervisor).
    #[serde(default)]
    pub json_response: bool,
    #[serde(default)]
    pub extra_headers: BTreeMap<String, String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model_id: default_model_id(),
            base_url: None,
            api_key: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            json_response: false,
            extra_headers: BTreeMap::new(),
        }
    }
}

fn default_provider() -> String { "ollama".to_string() }
fn default_model_id() -> String { "llama3.1".to_string() }
fn default_max_tokens() -> u32 { 4096 }
fn default_temperature() -> f32 { 0.0 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

/// Graph execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hard cap on supervisor + worker steps per entry or resume call.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Capacity of the per-request event channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// Run the tool calls of one worker turn concurrently.
    #[serde(default = "default_parallel_tools")]
    pub parallel_tools: bool,
    #[serde(default = "default_checkpoint_path")]
    pub checkpoint_path: String,
    /// Suffix every routable worker name must carry.
    #[serde(default = "default_node_suffix")]
    pub node_suffix: String,
    /// Node the supervisor falls back to when its decision is unusable.
    #[serde(default = "default_fallback_node")]
    pub fallback_node: String,
    /// Iteration cap for nodes that do not set their own.
    #[serde(default = "default_max_iterations")]
    pub default_max_iterations: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            event_buffer: default_event_buffer(),
            parallel_tools: default_parallel_tools(),
            checkpoint_path: default_checkpoint_path(),
            node_suffix: default_node_suffix(),
            fallback_node: default_fallback_node(),
            default_max_iterations: default_max_iterations(),
        }
    }
}

fn default_max_steps() -> usize { 25 }
fn default_event_buffer() -> usize { 64 }
fn default_parallel_tools() -> bool { true }
fn default_checkpoint_path() -> String { "~/.opsgraph/checkpoints.db".to_string() }
fn default_node_suffix() -> String { "_Specialist".to_string() }
fn default_fallback_node() -> String { "Topology_Specialist".to_string() }
fn default_max_iterations() -> usize { 8 }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Replaces the built-in routing instructions.
    #[serde(default)]
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Default timeout for every external call.
    #[serde(default = "default_tool_timeout")]
    pub timeout_secs: u64,
    /// Worker-pool bound for fan-out dispatch.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Tool output beyond this is truncated before it enters the log.
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
    #[serde(default)]
    pub health_targets: Vec<HealthTarget>,
    #[serde(default)]
    pub runbooks: BTreeMap<String, RunbookConfig>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_tool_timeout(),
            max_concurrency: default_max_concurrency(),
            max_output_chars: default_max_output_chars(),
            health_targets: vec![],
            runbooks: BTreeMap::new(),
        }
    }
}

fn default_tool_timeout() -> u64 { 10 }
fn default_max_concurrency() -> usize { 4 }
fn default_max_output_chars() -> usize { 8000 }

/// One endpoint probed by the cross-domain health scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthTarget {
    pub name: String,
    /// Domain label shown in the report (e.g. "k8s", "gcp").
    #[serde(default)]
    pub domain: Option<String>,
    pub url: String,
    /// Status code considered healthy. Any 2xx when unset.
    #[serde(default)]
    pub expect_status: Option<u16>,
}

/// A named, pre-approved remediation command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunbookConfig {
    #[serde(default)]
    pub description: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String { "127.0.0.1:8000".to_string() }

/// A specialist worker: persona, capability and bound tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub name: String,
    pub capability: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub instructions: String,
    /// Stop and wait for a human before this node runs.
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub max_iterations: Option<usize>,
}

impl NodeDefinition {
    pub fn new(name: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capability: capability.into(),
            tools: vec![],
            instructions: String::new(),
            requires_approval: false,
            max_iterations: None,
        }
    }

    pub fn with_tools(mut self, tools: &[&str]) -> Self {
        self.tools = tools.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn gated(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    pub fn with_max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = Some(n);
        self
    }
}

/// The roster used when the config declares no `[[nodes]]`.
pub fn default_roster() -> Vec<NodeDefinition> {
    vec![
        NodeDefinition::new("K8s_Specialist", "Kubernetes workloads, pods, logs and cluster events")
            .with_tools(&["http_probe", "health_scan"]),
        NodeDefinition::new("GCP_Specialist", "Google Cloud: Compute Engine, Cloud SQL, managed Prometheus")
            .with_tools(&["http_probe", "health_scan"]),
        NodeDefinition::new("Datadog_Specialist", "Datadog metrics, monitors and active alerts")
            .with_tools(&["http_probe"]),
        NodeDefinition::new("Azion_Specialist", "Azion edge applications, CDN cache and edge functions")
            .with_tools(&["http_probe"]),
        NodeDefinition::new("Code_Specialist", "source code reading, bug analysis and proposed fixes"),
        NodeDefinition::new("CICD_Specialist", "CI/CD pipelines, builds, deployments and GitOps sync")
            .with_tools(&["http_probe"]),
        NodeDefinition::new("Incident_Specialist", "incident records, severity, on-call and postmortems"),
        NodeDefinition::new("Security_Specialist", "vulnerabilities, IAM policies and security posture"),
        NodeDefinition::new("Topology_Specialist", "service topology, dependencies and cross-domain health overview")
            .with_tools(&["health_scan", "http_probe"]),
        NodeDefinition::new("Automation_Specialist", "runbook execution and automated remediation")
            .with_tools(&["run_runbook"])
            .gated(),
    ]
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| OpsError::ConfigNotFound(path.display().to_string()))?;
        tracing::debug!(path = %path.display(), "Loading config");
        Self::from_toml_str(&content)
    }

    /// Parse configuration text, expanding `${ENV_VAR}` references first.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| OpsError::Config(e.to_string()))
    }

    /// The declared roster, or the built-in one.
    pub fn roster_definitions(&self) -> Vec<NodeDefinition> {
        if self.nodes.is_empty() {
            default_roster()
        } else {
            self.nodes.clone()
        }
    }

    /// Resolve the checkpoint database path (expand ~).
    pub fn checkpoint_path(&self) -> PathBuf {
        expand_home(&self.engine.checkpoint_path)
    }
}

fn expand_home(p: &str) -> PathBuf {
    if let Some(rest) = p.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(p)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Unset variables stay verbatim
                Err(_) => {
                    tracing::warn!(var = %var_name, "Config references an unset environment variable");
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_OPSGRAPH_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_OPSGRAPH_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_OPSGRAPH_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_OPSGRAPH_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_OPSGRAPH_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config = AppConfig::from_toml_str("").unwrap();
        assert_eq!(config.engine.max_steps, 25);
        assert_eq!(config.engine.fallback_node, "Topology_Specialist");
        assert_eq!(config.tools.timeout_secs, 10);
        assert_eq!(config.tools.max_concurrency, 4);
        assert_eq!(config.model.provider, "ollama");
        assert_eq!(config.roster_definitions().len(), 10);
    }

    #[test]
    fn test_default_roster_shape() {
        let roster = default_roster();
        assert!(roster.iter().all(|n| n.name.ends_with("_Specialist")));
        let gated: Vec<_> = roster.iter().filter(|n| n.requires_approval).collect();
        assert_eq!(gated.len(), 1);
        assert_eq!(gated[0].name, "Automation_Specialist");
    }

    #[test]
    fn test_declared_nodes_replace_default_roster() {
        let config = AppConfig::from_toml_str(
            r#"
[[nodes]]
name = "K8s_Specialist"
capability = "kubernetes"
tools = ["http_probe"]
max_iterations = 3

[[nodes]]
name = "Automation_Specialist"
capability = "runbooks"
requires_approval = true
"#,
        )
        .unwrap();
        let nodes = config.roster_definitions();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].max_iterations, Some(3));
        assert!(nodes[1].requires_approval);
        assert!(nodes[1].tools.is_empty());
    }

    #[test]
    fn test_checkpoint_path_expands_home() {
        let mut config = AppConfig::default();
        config.engine.checkpoint_path = "/var/lib/opsgraph/cp.db".into();
        assert_eq!(config.checkpoint_path(), PathBuf::from("/var/lib/opsgraph/cp.db"));
    }
}
