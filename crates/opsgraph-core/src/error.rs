use thiserror::Error;

#[derive(Debug, Error)]
pub enum OpsError {
    // LLM errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM streaming error: {0}")]
    LlmStream(String),

    #[error("LLM response parse error: {0}")]
    LlmParse(String),

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool {tool} is not bound to node {node}")]
    ToolNotBound { tool: String, node: String },

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    #[error("Tool input validation failed: {0}")]
    ToolValidation(String),

    // Routing errors
    #[error("Supervisor backend failed: {0}")]
    DecisionFault(String),

    #[error("Supervisor chose an unknown route: {0}")]
    UnknownDecisionTarget(String),

    #[error("Step limit of {0} exceeded; supervisor and workers kept cycling without finishing")]
    StepLimitExceeded(usize),

    // Session errors
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session {0} is in an errored state and cannot continue")]
    SessionErrored(String),

    #[error("Failed to persist checkpoint: {0}")]
    Persistence(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, OpsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_limit_message_is_descriptive() {
        let msg = OpsError::StepLimitExceeded(12).to_string();
        assert!(msg.contains("12"));
        assert!(msg.contains("cycling"));
    }
}
