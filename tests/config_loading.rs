use std::io::Write;

use opsgraph_agent::Roster;
use opsgraph_core::config::AppConfig;
use opsgraph_test_utils::config_from_toml;
use opsgraph_tools::ToolRegistry;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[model]
provider = "vllm"
model_id = "qwen2.5-32b-instruct"
base_url = "http://gpu-01:8000/v1"
max_tokens = 2048
temperature = 0.1

[[fallback_models]]
provider = "ollama"
model_id = "llama3.1"

[retry]
max_retries = 5

[engine]
max_steps = 40
event_buffer = 128
parallel_tools = false
checkpoint_path = "/var/lib/opsgraph/checkpoints.db"

[supervisor]
instructions = "Prefer the K8s specialist for anything pod related."

[tools]
timeout_secs = 5
max_concurrency = 8

[[tools.health_targets]]
name = "frontend"
domain = "k8s"
url = "http://frontend.prod.svc/healthz"

[[tools.health_targets]]
name = "edge"
domain = "azion"
url = "https://edge.example.com/status"
expect_status = 204

[tools.runbooks.restart-frontend]
description = "Rolling restart of the frontend deployment"
command = "kubectl"
args = ["rollout", "restart", "deployment/frontend"]
timeout_secs = 60

[gateway]
bind = "0.0.0.0:9000"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.model.provider, "vllm");
    assert_eq!(config.model.model_id, "qwen2.5-32b-instruct");
    assert_eq!(config.model.base_url.as_deref(), Some("http://gpu-01:8000/v1"));
    assert_eq!(config.model.max_tokens, 2048);
    assert_eq!(config.fallback_models.len(), 1);
    assert_eq!(config.retry.max_retries, 5);
    assert_eq!(config.retry.initial_backoff_ms, 1000);

    assert_eq!(config.engine.max_steps, 40);
    assert_eq!(config.engine.event_buffer, 128);
    assert!(!config.engine.parallel_tools);
    assert_eq!(config.engine.fallback_node, "Topology_Specialist");
    assert!(config
        .supervisor
        .instructions
        .as_deref()
        .unwrap()
        .contains("K8s"));

    assert_eq!(config.tools.timeout_secs, 5);
    assert_eq!(config.tools.max_concurrency, 8);
    assert_eq!(config.tools.max_output_chars, 8000);
    assert_eq!(config.tools.health_targets.len(), 2);
    assert_eq!(config.tools.health_targets[1].expect_status, Some(204));
    let runbook = &config.tools.runbooks["restart-frontend"];
    assert_eq!(runbook.command, "kubectl");
    assert_eq!(runbook.args.len(), 3);
    assert_eq!(runbook.timeout_secs, Some(60));

    assert_eq!(config.gateway.bind, "0.0.0.0:9000");
    assert_eq!(config.roster_definitions().len(), 10);
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("OPSGRAPH_TEST_API_KEY", "sk-from-env");
    std::env::set_var("OPSGRAPH_TEST_MODEL", "gpt-4o-mini");

    let toml_content = r#"
[model]
provider = "openai"
model_id = "${OPSGRAPH_TEST_MODEL}"
api_key = "${OPSGRAPH_TEST_API_KEY}"
"#;

    let config = AppConfig::from_toml_str(toml_content).expect("parse config");
    assert_eq!(config.model.api_key.as_deref(), Some("sk-from-env"));
    assert_eq!(config.model.model_id, "gpt-4o-mini");

    std::env::remove_var("OPSGRAPH_TEST_API_KEY");
    std::env::remove_var("OPSGRAPH_TEST_MODEL");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let config = AppConfig::from_toml_str("").expect("parse empty config");

    assert_eq!(config.model.provider, "ollama");
    assert_eq!(config.engine.max_steps, 25);
    assert_eq!(config.engine.event_buffer, 64);
    assert!(config.engine.parallel_tools);
    assert_eq!(config.engine.node_suffix, "_Specialist");
    assert_eq!(config.tools.timeout_secs, 10);
    assert_eq!(config.tools.max_concurrency, 4);
    assert_eq!(config.gateway.bind, "127.0.0.1:8000");
}

#[test]
fn test_missing_file_is_reported() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/opsgraph.toml")).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
}

#[test]
fn test_declared_roster_is_validated_against_builtins() {
    let toml_content = r#"
[engine]
fallback_node = "Topology_Specialist"

[[nodes]]
name = "Topology_Specialist"
capability = "service dependency mapping"
tools = ["health_scan"]

[[nodes]]
name = "Database_Specialist"
capability = "postgres replication and locks"
tools = ["pg_locks"]
"#;
    let config = AppConfig::from_toml_str(toml_content).expect("parse config");
    let roster = Roster::new(config.roster_definitions(), &config.engine).expect("valid roster");
    assert_eq!(roster.nodes().len(), 2);

    let registry = ToolRegistry::with_builtins(&config.tools);
    let err = roster.check_tools(&registry).unwrap_err();
    assert!(err.to_string().contains("pg_locks"));
}

#[test]
fn test_roster_rejects_bad_names() {
    let toml_content = r#"
[[nodes]]
name = "Topology_Specialist"
capability = "maps"

[[nodes]]
name = "Supervisor"
capability = "should not be allowed"
"#;
    let config = config_from_toml(toml_content);
    assert!(Roster::new(config.roster_definitions(), &config.engine).is_err());
}
