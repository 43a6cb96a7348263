use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use opsgraph_core::error::{OpsError, Result};
use opsgraph_core::session::Session;
use opsgraph_core::traits::{CheckpointBackend, Tool};
use opsgraph_core::types::{SessionId, ToolContext, ToolResult};

/// Tool that always returns the same output and counts its calls.
pub struct StubTool {
    name: String,
    output: String,
    calls: Arc<AtomicUsize>,
}

impl StubTool {
    pub fn new(name: &str, output: &str) -> Self {
        Self {
            name: name.to_string(),
            output: output.to_string(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared call counter, readable after the tool moves into a registry.
    pub fn counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl Tool for StubTool {
    fn name(&self) -> &str {
        &self.name
    }
    fn description(&self) -> &str {
        "stub tool"
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }
    fn execute(&self, _input: serde_json::Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let output = self.output.clone();
        Box::pin(async move { Ok(ToolResult::success(output)) })
    }
}

/// Tool whose execution always fails.
pub struct FailingTool {
    name: String,
    message: String,
}

impl FailingTool {
    pub fn new(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            message: message.to_string(),
        }
    }
}

impl Tool for FailingTool {
    fn name(&self) -> &str {
        &self.name
    }
    fn description(&self) -> &str {
        "always fails"
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }
    fn execute(&self, _input: serde_json::Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        let err = OpsError::ToolExecution {
            tool: self.name.clone(),
            message: self.message.clone(),
        };
        Box::pin(async move { Err(err) })
    }
}

/// Tool that sleeps before answering.
pub struct SlowTool {
    name: String,
    delay: Duration,
}

impl SlowTool {
    pub fn new(name: &str, delay: Duration) -> Self {
        Self {
            name: name.to_string(),
            delay,
        }
    }
}

impl Tool for SlowTool {
    fn name(&self) -> &str {
        &self.name
    }
    fn description(&self) -> &str {
        "slow tool"
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }
    fn execute(&self, _input: serde_json::Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        let delay = self.delay;
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            Ok(ToolResult::success("finally"))
        })
    }
}

/// Checkpoint backend that accepts the first `ok_saves` saves and fails after.
pub struct FailingCheckpoints {
    ok_saves: usize,
    saves: AtomicUsize,
}

impl FailingCheckpoints {
    pub fn new(ok_saves: usize) -> Self {
        Self {
            ok_saves,
            saves: AtomicUsize::new(0),
        }
    }
}

impl CheckpointBackend for FailingCheckpoints {
    fn save(&self, _session: &Session) -> Result<()> {
        let n = self.saves.fetch_add(1, Ordering::SeqCst);
        if n < self.ok_saves {
            Ok(())
        } else {
            Err(OpsError::Persistence("disk I/O error".into()))
        }
    }

    fn load(&self, _id: &SessionId) -> Result<Option<Session>> {
        Ok(None)
    }

    fn list(&self) -> Result<Vec<SessionId>> {
        Ok(vec![])
    }
}
