use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{now, SessionId};

/// Name of the decision node.
pub const SUPERVISOR: &str = "Supervisor";
/// Reserved routing token that ends a run.
pub const FINISH: &str = "FINISH";
/// Author label for engine-generated warnings and errors.
pub const SYSTEM_AGENT: &str = "system";

/// Who wrote a message in the session log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Source {
    User,
    /// Assistant turns imported from client-supplied history.
    Assistant,
    Node(String),
    System,
}

impl Source {
    pub fn label(&self) -> &str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Node(name) => name,
            Self::System => SYSTEM_AGENT,
        }
    }

    pub fn is_node(&self, node: &str) -> bool {
        matches!(self, Self::Node(n) if n == node)
    }
}

/// A tool call requested by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub args: serde_json::Value,
}

/// Outcome of one tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum ToolOutcome {
    Ok(String),
    Err(String),
}

/// A completed tool call. Owned by the message that carries its result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub call_id: String,
    pub tool: String,
    pub args: serde_json::Value,
    pub outcome: ToolOutcome,
    pub duration_ms: u64,
}

impl ToolInvocation {
    pub fn is_error(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Err(_))
    }

    pub fn output(&self) -> &str {
        match &self.outcome {
            ToolOutcome::Ok(s) | ToolOutcome::Err(s) => s,
        }
    }
}

/// One entry of the append-only session log.
///
/// `seq` is assigned by the conversation store on append; values set by
/// callers are overwritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub seq: u64,
    pub source: Source,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolInvocation>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn with_source(source: Source, content: impl Into<String>) -> Self {
        Self {
            seq: 0,
            source,
            content: content.into(),
            tool_calls: vec![],
            tool_result: None,
            timestamp: now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_source(Source::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_source(Source::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_source(Source::System, content)
    }

    pub fn from_node(node: impl Into<String>, content: impl Into<String>) -> Self {
        Self::with_source(Source::Node(node.into()), content)
    }

    /// A node message carrying the result of one tool call.
    pub fn tool_output(node: impl Into<String>, invocation: ToolInvocation) -> Self {
        let mut msg = Self::with_source(Source::Node(node.into()), invocation.output());
        msg.tool_result = Some(invocation);
        msg
    }

    pub fn with_tool_calls(mut self, calls: Vec<ToolCallRequest>) -> Self {
        self.tool_calls = calls;
        self
    }
}

/// Routing cursor of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "node", rename_all = "snake_case")]
pub enum Cursor {
    Running(String),
    AwaitingApproval(String),
    Terminal,
    Errored,
}

impl Cursor {
    pub fn supervisor() -> Self {
        Self::Running(SUPERVISOR.to_string())
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running(node) => write!(f, "running({})", node),
            Self::AwaitingApproval(node) => write!(f, "awaiting-approval({})", node),
            Self::Terminal => write!(f, "terminal"),
            Self::Errored => write!(f, "errored"),
        }
    }
}

/// The supervisor's routing output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub reasoning: String,
    pub next_agent: String,
    /// Set when the route came from the fault policy, not the backend.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fallback: bool,
}

/// A troubleshooting conversation: its log, cursor and checkpoint revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub messages: Vec<Message>,
    pub cursor: Cursor,
    pub revision: u64,
    /// Next sequence number to hand out. Never moves backwards.
    pub next_seq: u64,
    #[serde(default)]
    pub last_decision: Option<Decision>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        let ts = now();
        Self {
            id,
            messages: vec![],
            cursor: Cursor::supervisor(),
            revision: 0,
            next_seq: 1,
            last_decision: None,
            created_at: ts,
            updated_at: ts,
        }
    }

    /// Sequence number of the most recent user message, or 0.
    pub fn latest_user_seq(&self) -> u64 {
        self.messages
            .iter()
            .rev()
            .find(|m| m.source == Source::User)
            .map(|m| m.seq)
            .unwrap_or(0)
    }

    /// Whether `node` has written to the log after sequence number `seq`.
    pub fn node_spoke_since(&self, node: &str, seq: u64) -> bool {
        self.messages
            .iter()
            .any(|m| m.seq > seq && m.source.is_node(node))
    }

    /// Whether the fault policy already sent this user turn to `node` and
    /// the node has answered since.
    pub fn fell_back_to(&self, node: &str) -> bool {
        let routed = self
            .last_decision
            .as_ref()
            .is_some_and(|d| d.fallback && d.next_agent == node);
        routed && self.node_spoke_since(node, self.latest_user_seq())
    }
}
