//! Mocks and fixtures shared by the opsgraph test suites.

mod llm;
mod tools;

pub use llm::{RecordedCall, ScriptedLlm, Turn};
pub use tools::{FailingCheckpoints, FailingTool, SlowTool, StubTool};

use opsgraph_core::config::AppConfig;

/// Config parsed from TOML, panicking on invalid input.
pub fn config_from_toml(toml_text: &str) -> AppConfig {
    AppConfig::from_toml_str(toml_text).expect("test config should parse")
}

/// Default config with fast limits for engine tests.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.engine.max_steps = 12;
    config.engine.event_buffer = 256;
    config.tools.timeout_secs = 2;
    config
}
