use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::stream::BoxStream;

use opsgraph_core::config::ModelConfig;
use opsgraph_core::error::{OpsError, Result};
use opsgraph_core::traits::LlmClient;
use opsgraph_core::types::*;

/// One scripted backend response.
#[derive(Debug, Clone)]
pub enum Turn {
    /// Plain text answer.
    Text(String),
    /// Tool calls as (tool name, arguments).
    ToolCalls(Vec<(String, serde_json::Value)>),
    /// The request itself fails.
    Fail(String),
    /// The stream opens, yields the text, then errors.
    BrokenStream(String),
}

impl Turn {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    pub fn tool(name: &str, args: serde_json::Value) -> Self {
        Self::ToolCalls(vec![(name.to_string(), args)])
    }

    /// A supervisor decision as the backend would return it.
    pub fn decide(next_agent: &str, reasoning: &str) -> Self {
        Self::Text(
            serde_json::json!({ "reasoning": reasoning, "next_agent": next_agent }).to_string(),
        )
    }

    pub fn fail(msg: impl Into<String>) -> Self {
        Self::Fail(msg.into())
    }
}

/// A request the scripted backend received.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub json_response: bool,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<String>,
}

impl RecordedCall {
    /// All text of the rendered request, for `contains` assertions.
    pub fn transcript(&self) -> String {
        self.messages
            .iter()
            .map(|m| {
                m.content
                    .iter()
                    .map(|b| match b {
                        ContentBlock::Text { text } => text.clone(),
                        ContentBlock::ToolUse { name, input, .. } => format!("{} {}", name, input),
                        ContentBlock::ToolResult { content, .. } => content.clone(),
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Default)]
struct Script {
    decisions: VecDeque<Turn>,
    worker_turns: VecDeque<Turn>,
    calls: Vec<RecordedCall>,
    next_call_id: usize,
}

/// Backend double with two queues: supervisor requests (JSON mode) and
/// worker requests. An empty supervisor queue answers FINISH; an empty
/// worker queue answers "done".
#[derive(Clone, Default)]
pub struct ScriptedLlm {
    script: Arc<Mutex<Script>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_decisions(self, turns: impl IntoIterator<Item = Turn>) -> Self {
        self.script.lock().unwrap().decisions.extend(turns);
        self
    }

    pub fn with_worker_turns(self, turns: impl IntoIterator<Item = Turn>) -> Self {
        self.script.lock().unwrap().worker_turns.extend(turns);
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.script.lock().unwrap().calls.clone()
    }

    pub fn supervisor_calls(&self) -> Vec<RecordedCall> {
        self.calls().into_iter().filter(|c| c.json_response).collect()
    }

    pub fn worker_calls(&self) -> Vec<RecordedCall> {
        self.calls().into_iter().filter(|c| !c.json_response).collect()
    }

    fn next_turn(&self, config: &ModelConfig, messages: Vec<ChatMessage>, tools: &[ToolDefinition]) -> (Turn, usize) {
        let mut script = self.script.lock().unwrap();
        script.calls.push(RecordedCall {
            json_response: config.json_response,
            messages,
            tools: tools.iter().map(|t| t.name.clone()).collect(),
        });
        let turn = if config.json_response {
            script
                .decisions
                .pop_front()
                .unwrap_or_else(|| Turn::decide("FINISH", "nothing left to do"))
        } else {
            script
                .worker_turns
                .pop_front()
                .unwrap_or_else(|| Turn::text("done"))
        };
        let id = script.next_call_id;
        script.next_call_id += 1;
        (turn, id)
    }
}

fn text_deltas(text: &str) -> Vec<Result<StreamDelta>> {
    // Split mid-text so consumers must accumulate
    let mid = text
        .char_indices()
        .map(|(i, _)| i)
        .nth(text.chars().count() / 2)
        .unwrap_or(0);
    let mut deltas = Vec::new();
    for part in [&text[..mid], &text[mid..]] {
        if !part.is_empty() {
            deltas.push(Ok(StreamDelta::TextDelta(part.to_string())));
        }
    }
    deltas
}

impl LlmClient for ScriptedLlm {
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
        tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        let (turn, call_no) = self.next_turn(config, messages, tools);

        Box::pin(async move {
            let deltas: Vec<Result<StreamDelta>> = match turn {
                Turn::Fail(msg) => return Err(OpsError::LlmRequest(msg)),
                Turn::Text(text) => {
                    let mut d = text_deltas(&text);
                    d.push(Ok(StreamDelta::Stop(StopReason::EndTurn)));
                    d
                }
                Turn::BrokenStream(text) => {
                    let mut d = text_deltas(&text);
                    d.push(Err(OpsError::LlmStream("connection reset".into())));
                    d
                }
                Turn::ToolCalls(calls) => {
                    let mut d = Vec::new();
                    for (index, (name, args)) in calls.into_iter().enumerate() {
                        let json = args.to_string();
                        let (head, tail) = json.split_at(json.len() / 2);
                        d.push(Ok(StreamDelta::ToolUseStart {
                            index,
                            id: format!("call_{}_{}", call_no, index),
                            name,
                        }));
                        d.push(Ok(StreamDelta::ToolInputDelta {
                            index,
                            delta: head.to_string(),
                        }));
                        d.push(Ok(StreamDelta::ToolInputDelta {
                            index,
                            delta: tail.to_string(),
                        }));
                    }
                    d.push(Ok(StreamDelta::Stop(StopReason::ToolUse)));
                    d
                }
            };
            Ok(Box::pin(futures::stream::iter(deltas)) as BoxStream<'_, Result<StreamDelta>>)
        })
    }
}
