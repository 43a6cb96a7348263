use serde::{Deserialize, Serialize};

/// One line of the NDJSON event stream sent to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Activity {
        agent: String,
    },
    ToolCall {
        agent: String,
        tool: String,
        args: serde_json::Value,
    },
    ToolOutput {
        agent: String,
        tool: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
    Message {
        agent: String,
        content: String,
    },
    ApprovalRequired {
        thread_id: String,
    },
    Error {
        agent: String,
        content: String,
    },
    Final,
}

impl StreamEvent {
    /// Short tag, matching the `type` field on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Activity { .. } => "activity",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolOutput { .. } => "tool_output",
            Self::Message { .. } => "message",
            Self::ApprovalRequired { .. } => "approval_required",
            Self::Error { .. } => "error",
            Self::Final => "final",
        }
    }

    /// The node (or `system`) the event is attributed to, if any.
    pub fn agent(&self) -> Option<&str> {
        match self {
            Self::Activity { agent }
            | Self::ToolCall { agent, .. }
            | Self::ToolOutput { agent, .. }
            | Self::Message { agent, .. }
            | Self::Error { agent, .. } => Some(agent),
            Self::ApprovalRequired { .. } | Self::Final => None,
        }
    }

    /// Render as a single NDJSON line, newline included.
    pub fn to_line(&self) -> String {
        // Serializing this enum cannot fail: every field is a string or a JSON value.
        let mut line = serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"final"}"#.into());
        line.push('\n');
        line
    }
}
