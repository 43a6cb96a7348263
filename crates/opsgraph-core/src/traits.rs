use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::config::ModelConfig;
use crate::error::Result;
use crate::session::Session;
use crate::types::*;

/// Reasoning backend client. Created once at startup and injected.
pub trait LlmClient: Send + Sync + 'static {
    /// Send a chat request and receive a stream of deltas.
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
        tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>>;
}

/// An external capability a worker can call.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (used in backend tool calls).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for tool input.
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool with given input and context.
    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>>;

    /// Timeout override in seconds. `None` uses the registry default.
    fn timeout_secs(&self) -> Option<u64> {
        None
    }
}

/// Durable snapshot storage for sessions.
pub trait CheckpointBackend: Send + Sync + 'static {
    /// Persist the full session snapshot, replacing any previous one.
    fn save(&self, session: &Session) -> Result<()>;

    /// Load the latest snapshot for a session.
    fn load(&self, id: &SessionId) -> Result<Option<Session>>;

    /// List every session id with a snapshot.
    fn list(&self) -> Result<Vec<SessionId>>;
}
