use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use tracing::{debug, info, warn};

use opsgraph_core::config::{AppConfig, ModelConfig, NodeDefinition};
use opsgraph_core::error::Result;
use opsgraph_core::session::{Message, Session, ToolCallRequest, ToolInvocation, ToolOutcome};
use opsgraph_core::traits::LlmClient;
use opsgraph_core::types::*;
use opsgraph_tools::ToolRegistry;

use crate::render;

/// Accumulator for streaming tool call deltas.
#[derive(Debug, Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    input_json: String,
}

/// One backend turn, fully accumulated.
#[derive(Debug, Default)]
struct TurnOutput {
    text: String,
    tool_calls: Vec<ToolCallAccumulator>,
}

/// Runs the bounded request/tool/response loop for any worker node.
pub struct Worker {
    llm: Arc<dyn LlmClient>,
    model: ModelConfig,
    tools: Arc<ToolRegistry>,
    parallel_tools: bool,
    max_output_chars: usize,
}

impl Worker {
    pub fn new(llm: Arc<dyn LlmClient>, tools: Arc<ToolRegistry>, config: &AppConfig) -> Self {
        let mut model = config.model.clone();
        model.json_response = false;
        Self {
            llm,
            model,
            tools,
            parallel_tools: config.engine.parallel_tools,
            max_output_chars: config.tools.max_output_chars,
        }
    }

    async fn turn(&self, messages: Vec<ChatMessage>, defs: &[ToolDefinition]) -> Result<TurnOutput> {
        let mut stream = self.llm.chat_stream(&self.model, messages, defs).await?;
        let mut out = TurnOutput::default();

        while let Some(delta) = stream.next().await {
            match delta? {
                StreamDelta::TextDelta(text) => out.text.push_str(&text),
                StreamDelta::ToolUseStart { index, id, name } => {
                    while out.tool_calls.len() <= index {
                        out.tool_calls.push(ToolCallAccumulator::default());
                    }
                    out.tool_calls[index].id = id;
                    out.tool_calls[index].name = name;
                }
                StreamDelta::ToolInputDelta { index, delta } => {
                    if let Some(tc) = out.tool_calls.get_mut(index) {
                        tc.input_json.push_str(&delta);
                    }
                }
                StreamDelta::Stop(reason) => debug!(?reason, "Worker turn stopped"),
                StreamDelta::Usage { .. } => {}
            }
        }
        // Gaps left by sparse indices
        out.tool_calls.retain(|tc| !tc.name.is_empty());
        Ok(out)
    }

    /// Execute one node invocation and return the messages it produced.
    ///
    /// Never fails: backend errors become a message from the node and tool
    /// errors become failed invocations.
    pub async fn run(&self, node: &NodeDefinition, max_iterations: usize, session: &Session) -> Vec<Message> {
        let started = Instant::now();
        let defs = self.tools.definitions_for(&node.tools);
        let ctx = ToolContext {
            session_id: session.id.clone(),
            node: node.name.clone(),
        };

        let mut prefix = vec![ChatMessage::system(render::worker_prompt(node))];
        prefix.extend(render::render_transcript(&session.messages));
        // Structured history of this invocation only
        let mut current: Vec<ChatMessage> = Vec::new();
        let mut produced: Vec<Message> = Vec::new();

        for iteration in 0..max_iterations {
            let mut request = prefix.clone();
            request.extend(current.iter().cloned());

            let turn = match self.turn(request, &defs).await {
                Ok(t) => t,
                Err(e) => {
                    warn!(session_id = %session.id, node = %node.name, iteration, error = %e, "Worker backend failed");
                    produced.push(Message::from_node(
                        &node.name,
                        format!("{} could not complete its analysis: {}", node.name, e),
                    ));
                    return produced;
                }
            };

            if turn.tool_calls.is_empty() {
                let answer = if turn.text.trim().is_empty() {
                    format!("{} finished without a textual answer.", node.name)
                } else {
                    turn.text
                };
                info!(
                    session_id = %session.id,
                    node = %node.name,
                    iterations = iteration + 1,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Worker answered"
                );
                produced.push(Message::from_node(&node.name, answer));
                return produced;
            }

            let requests: Vec<(ToolCallRequest, std::result::Result<serde_json::Value, String>)> = turn
                .tool_calls
                .into_iter()
                .enumerate()
                .map(|(i, tc)| {
                    let id = if tc.id.is_empty() {
                        format!("{}-{}-{}", node.name, iteration, i)
                    } else {
                        tc.id
                    };
                    let parsed = parse_args(&tc.input_json);
                    let request = ToolCallRequest {
                        id,
                        name: tc.name,
                        args: parsed.clone().unwrap_or(serde_json::Value::Null),
                    };
                    (request, parsed)
                })
                .collect();

            produced.push(
                Message::from_node(&node.name, turn.text.clone())
                    .with_tool_calls(requests.iter().map(|(r, _)| r.clone()).collect()),
            );

            let invocations = self.execute_all(node, &ctx, &requests).await;

            let mut assistant_blocks = Vec::new();
            if !turn.text.is_empty() {
                assistant_blocks.push(ContentBlock::Text { text: turn.text });
            }
            let mut result_blocks = Vec::new();
            for inv in invocations {
                assistant_blocks.push(ContentBlock::ToolUse {
                    id: inv.call_id.clone(),
                    name: inv.tool.clone(),
                    input: inv.args.clone(),
                });
                result_blocks.push(ContentBlock::ToolResult {
                    tool_use_id: inv.call_id.clone(),
                    content: inv.output().to_string(),
                    is_error: inv.is_error(),
                });
                produced.push(Message::tool_output(&node.name, inv));
            }
            current.push(ChatMessage {
                role: Role::Assistant,
                content: assistant_blocks,
            });
            current.push(ChatMessage {
                role: Role::User,
                content: result_blocks,
            });
        }

        warn!(session_id = %session.id, node = %node.name, max_iterations, "Worker hit iteration cap");
        produced.push(Message::from_node(
            &node.name,
            summarize_findings(&node.name, max_iterations, &produced),
        ));
        produced
    }

    async fn execute_all(
        &self,
        node: &NodeDefinition,
        ctx: &ToolContext,
        requests: &[(ToolCallRequest, std::result::Result<serde_json::Value, String>)],
    ) -> Vec<ToolInvocation> {
        if self.parallel_tools && requests.len() > 1 {
            let futs = requests
                .iter()
                .map(|(req, args)| self.execute_one(node, ctx.clone(), req, args));
            futures::future::join_all(futs).await
        } else {
            let mut out = Vec::with_capacity(requests.len());
            for (req, args) in requests {
                out.push(self.execute_one(node, ctx.clone(), req, args).await);
            }
            out
        }
    }

    async fn execute_one(
        &self,
        node: &NodeDefinition,
        ctx: ToolContext,
        req: &ToolCallRequest,
        args: &std::result::Result<serde_json::Value, String>,
    ) -> ToolInvocation {
        let started = Instant::now();
        let outcome = if !node.tools.iter().any(|t| t == &req.name) {
            ToolOutcome::Err(format!("tool '{}' is not available to {}", req.name, node.name))
        } else {
            match args {
                Err(e) => ToolOutcome::Err(format!("invalid tool arguments: {}", e)),
                Ok(input) => match self.tools.execute(&req.name, input.clone(), ctx).await {
                    Ok(result) if result.is_error => {
                        ToolOutcome::Err(truncate(&result.content, self.max_output_chars))
                    }
                    Ok(result) => ToolOutcome::Ok(truncate(&result.content, self.max_output_chars)),
                    Err(e) => ToolOutcome::Err(e.to_string()),
                },
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        if let ToolOutcome::Err(e) = &outcome {
            warn!(node = %node.name, tool = %req.name, duration_ms, error = %e, "Tool call failed");
        } else {
            debug!(node = %node.name, tool = %req.name, duration_ms, "Tool call succeeded");
        }

        ToolInvocation {
            call_id: req.id.clone(),
            tool: req.name.clone(),
            args: req.args.clone(),
            outcome,
            duration_ms,
        }
    }
}

fn parse_args(raw: &str) -> std::result::Result<serde_json::Value, String> {
    if raw.trim().is_empty() {
        return Ok(serde_json::json!({}));
    }
    serde_json::from_str(raw).map_err(|e| e.to_string())
}

/// Cut `s` to at most `max` characters, marking the cut.
pub(crate) fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        None => s.to_string(),
        Some((cut, _)) => format!("{}\n... (truncated, {} chars total)", &s[..cut], s.chars().count()),
    }
}

fn summarize_findings(node: &str, cap: usize, produced: &[Message]) -> String {
    let findings: Vec<String> = produced
        .iter()
        .filter_map(|m| m.tool_result.as_ref())
        .rev()
        .take(5)
        .map(|inv| {
            let first_line = inv.output().lines().next().unwrap_or("");
            let status = if inv.is_error() { "error" } else { "ok" };
            format!("- {} ({}): {}", inv.tool, status, truncate(first_line, 200))
        })
        .collect();

    if findings.is_empty() {
        format!("{} stopped after {} iterations without a final answer.", node, cap)
    } else {
        format!(
            "{} stopped after {} iterations without a final answer. Latest findings:\n{}",
            node,
            cap,
            findings.into_iter().rev().collect::<Vec<_>>().join("\n")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsgraph_core::types::SessionId;
    use opsgraph_test_utils::{test_config, FailingTool, ScriptedLlm, StubTool, Turn};

    fn session() -> Session {
        let mut s = Session::new(SessionId::from_string("t-worker"));
        let mut m = Message::user("frontend is crashing");
        m.seq = 1;
        s.messages.push(m);
        s.next_seq = 2;
        s
    }

    fn registry() -> Arc<ToolRegistry> {
        let mut r = ToolRegistry::new(2);
        r.register(StubTool::new("pods", "frontend-7d9 CrashLoopBackOff: dial tcp 10.0.0.5:5432: connection refused"));
        r.register(StubTool::new("events", "Back-off restarting failed container"));
        r.register(FailingTool::new("logs", "permission denied"));
        Arc::new(r)
    }

    fn node() -> NodeDefinition {
        NodeDefinition::new("K8s_Specialist", "kubernetes").with_tools(&["pods", "events", "logs"])
    }

    fn worker(llm: &ScriptedLlm) -> Worker {
        Worker::new(Arc::new(llm.clone()), registry(), &test_config())
    }

    #[tokio::test]
    async fn direct_answer() {
        let llm = ScriptedLlm::new().with_worker_turns([Turn::text("No pods found in namespace.")]);
        let msgs = worker(&llm).run(&node(), 8, &session()).await;
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].content, "No pods found in namespace.");
        assert!(msgs[0].source.is_node("K8s_Specialist"));
        assert_eq!(llm.worker_calls()[0].tools, vec!["pods", "events", "logs"]);
    }

    #[tokio::test]
    async fn tool_loop_then_answer() {
        let llm = ScriptedLlm::new().with_worker_turns([
            Turn::tool("pods", serde_json::json!({"namespace": "shop"})),
            Turn::text("frontend cannot reach the database on 5432."),
        ]);
        let msgs = worker(&llm).run(&node(), 8, &session()).await;
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0].tool_calls[0].name, "pods");
        assert_eq!(msgs[0].tool_calls[0].args["namespace"], "shop");
        let inv = msgs[1].tool_result.as_ref().unwrap();
        assert!(!inv.is_error());
        assert!(inv.output().contains("connection refused"));
        assert_eq!(msgs[2].content, "frontend cannot reach the database on 5432.");

        // Second request carries the structured tool exchange
        let second = &llm.worker_calls()[1];
        let last = second.messages.last().unwrap();
        assert_eq!(last.role, Role::User);
        assert!(matches!(&last.content[0], ContentBlock::ToolResult { is_error: false, .. }));
    }

    #[tokio::test]
    async fn unbound_and_failing_tools_are_recorded_not_raised() {
        let llm = ScriptedLlm::new().with_worker_turns([
            Turn::ToolCalls(vec![
                ("logs".into(), serde_json::json!({})),
                ("kubectl_delete".into(), serde_json::json!({})),
                ("events".into(), serde_json::json!({})),
            ]),
            Turn::text("partial view only"),
        ]);
        let msgs = worker(&llm).run(&node(), 8, &session()).await;
        let results: Vec<_> = msgs.iter().filter_map(|m| m.tool_result.as_ref()).collect();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].tool, "logs");
        assert!(results[0].output().contains("permission denied"));
        assert_eq!(results[1].tool, "kubectl_delete");
        assert!(results[1].output().contains("not available"));
        assert_eq!(results[2].tool, "events");
        assert!(!results[2].is_error());
    }

    #[tokio::test]
    async fn iteration_cap_synthesizes_summary() {
        let llm = ScriptedLlm::new().with_worker_turns([
            Turn::tool("pods", serde_json::json!({})),
            Turn::tool("events", serde_json::json!({})),
            Turn::tool("pods", serde_json::json!({})),
        ]);
        let msgs = worker(&llm).run(&node(), 2, &session()).await;
        assert_eq!(llm.worker_calls().len(), 2);
        let last = msgs.last().unwrap();
        assert!(last.content.contains("stopped after 2 iterations"));
        assert!(last.content.contains("- pods (ok): frontend-7d9 CrashLoopBackOff"));
        assert!(last.content.contains("- events (ok)"));
    }

    #[tokio::test]
    async fn backend_failure_becomes_node_message() {
        let llm = ScriptedLlm::new().with_worker_turns([Turn::fail("HTTP 503")]);
        let msgs = worker(&llm).run(&node(), 8, &session()).await;
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].content.contains("could not complete"));
        assert!(msgs[0].content.contains("HTTP 503"));
    }

    #[tokio::test]
    async fn broken_stream_is_a_backend_failure() {
        let llm = ScriptedLlm::new().with_worker_turns([Turn::BrokenStream("The pods are".into())]);
        let msgs = worker(&llm).run(&node(), 8, &session()).await;
        assert!(msgs[0].content.contains("connection reset"));
    }

    #[test]
    fn truncate_marks_cut() {
        assert_eq!(truncate("short", 10), "short");
        let cut = truncate("abcdefghij", 4);
        assert!(cut.starts_with("abcd\n... (truncated, 10 chars total)"));
    }

    #[test]
    fn invalid_json_arguments() {
        assert!(parse_args("{\"a\":").is_err());
        assert_eq!(parse_args("").unwrap(), serde_json::json!({}));
    }
}
