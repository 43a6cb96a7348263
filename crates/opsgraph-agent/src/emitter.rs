use tokio::sync::mpsc;
use tracing::debug;

use opsgraph_core::event::StreamEvent;
use opsgraph_core::session::{Message, Source};

/// Write side of a client's event stream.
///
/// A dropped receiver never fails the engine; sends become no-ops and
/// [`EventEmitter::is_closed`] tells the engine to stop scheduling steps.
#[derive(Clone)]
pub struct EventEmitter {
    tx: mpsc::Sender<StreamEvent>,
}

impl EventEmitter {
    /// Create a bounded stream and return (emitter, receiver).
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }

    pub async fn send(&self, event: StreamEvent) {
        if self.tx.send(event).await.is_err() {
            debug!("Event receiver gone, dropping event");
        }
    }

    pub async fn send_all(&self, events: impl IntoIterator<Item = StreamEvent>) {
        for event in events {
            self.send(event).await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Wire events for one committed log message.
///
/// User and imported assistant turns are the client's own input and are
/// not echoed.
pub fn events_for_message(msg: &Message) -> Vec<StreamEvent> {
    let agent = match &msg.source {
        Source::User | Source::Assistant => return vec![],
        source => source.label().to_string(),
    };

    if let Some(inv) = &msg.tool_result {
        return vec![StreamEvent::ToolOutput {
            agent,
            tool: inv.tool.clone(),
            content: inv.output().to_string(),
            is_error: inv.is_error(),
        }];
    }

    let mut events = Vec::new();
    if !msg.tool_calls.is_empty() {
        if !msg.content.trim().is_empty() {
            events.push(StreamEvent::Message {
                agent: agent.clone(),
                content: msg.content.clone(),
            });
        }
        events.extend(msg.tool_calls.iter().map(|call| StreamEvent::ToolCall {
            agent: agent.clone(),
            tool: call.name.clone(),
            args: call.args.clone(),
        }));
        return events;
    }

    events.push(StreamEvent::Message {
        agent,
        content: msg.content.clone(),
    });
    events
}
