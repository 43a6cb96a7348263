use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use opsgraph_core::config::AppConfig;
use opsgraph_core::error::{OpsError, Result};
use opsgraph_core::event::StreamEvent;
use opsgraph_core::session::{Cursor, Decision, Message, Session, FINISH, SUPERVISOR, SYSTEM_AGENT};
use opsgraph_core::traits::LlmClient;
use opsgraph_core::types::{ChatRequest, HistoryEntry, ResumeAction, ResumeRequest, SessionId};
use opsgraph_tools::ToolRegistry;

use crate::emitter::{events_for_message, EventEmitter};
use crate::roster::Roster;
use crate::store::ConversationStore;
use crate::supervisor::Supervisor;
use crate::worker::Worker;

/// Drives sessions through the supervisor/worker state machine.
///
/// Every step commits in the same order: append the step's messages, move
/// the cursor, checkpoint. Only then are the step's events emitted, so a
/// client never sees anything that is not durable.
pub struct GraphEngine {
    roster: Arc<Roster>,
    supervisor: Supervisor,
    worker: Worker,
    store: Arc<ConversationStore>,
    max_steps: usize,
    event_buffer: usize,
}

impl GraphEngine {
    /// Build the engine. Fails if the roster is invalid or binds a tool
    /// the registry does not have.
    pub fn new(
        config: &AppConfig,
        llm: Arc<dyn LlmClient>,
        tools: Arc<ToolRegistry>,
        store: Arc<ConversationStore>,
    ) -> Result<Self> {
        let roster = Arc::new(Roster::new(config.roster_definitions(), &config.engine)?);
        roster.check_tools(&tools)?;

        let supervisor = Supervisor::new(
            llm.clone(),
            &config.model,
            roster.clone(),
            config.supervisor.instructions.clone(),
        );
        let worker = Worker::new(llm, tools, config);

        info!(
            nodes = roster.nodes().len(),
            fallback = roster.fallback(),
            max_steps = config.engine.max_steps,
            "Graph engine ready"
        );

        Ok(Self {
            roster,
            supervisor,
            worker,
            store,
            max_steps: config.engine.max_steps,
            event_buffer: config.engine.event_buffer,
        })
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    /// Run an entry call in a background task and return its event stream.
    pub fn spawn_chat(self: &Arc<Self>, mut req: ChatRequest) -> (SessionId, mpsc::Receiver<StreamEvent>) {
        let id = thread_or_new(req.thread_id.as_deref());
        req.thread_id = Some(id.to_string());

        let (emitter, rx) = EventEmitter::channel(self.event_buffer);
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.start(req, &emitter).await;
        });
        (id, rx)
    }

    /// Run a resume call in a background task and return its event stream.
    pub fn spawn_resume(self: &Arc<Self>, req: ResumeRequest) -> mpsc::Receiver<StreamEvent> {
        let (emitter, rx) = EventEmitter::channel(self.event_buffer);
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.resume(req, &emitter).await;
        });
        rx
    }

    /// Start or continue a session with a new user message.
    pub async fn start(&self, req: ChatRequest, events: &EventEmitter) {
        let id = thread_or_new(req.thread_id.as_deref());
        if req.message.trim().is_empty() {
            emit_fatal(events, "message must not be empty").await;
            return;
        }

        let _lane = self.store.lock(&id).await;

        let existing = match self.store.load(&id) {
            Ok(session) => Some(session),
            Err(OpsError::SessionNotFound(_)) => None,
            Err(e) => {
                emit_fatal(events, e).await;
                return;
            }
        };

        match existing.as_ref().map(|s| &s.cursor) {
            Some(Cursor::Errored) => {
                emit_fatal(events, OpsError::SessionErrored(id.to_string())).await;
                return;
            }
            Some(Cursor::AwaitingApproval(node)) => {
                info!(session_id = %id, node = %node, "Session still awaiting approval");
                events
                    .send(StreamEvent::ApprovalRequired {
                        thread_id: id.to_string(),
                    })
                    .await;
                return;
            }
            _ => {}
        }

        info!(session_id = %id, new = existing.is_none(), "Entry call");
        let opened = self.open_turn(&id, existing.is_none(), req);
        if let Err(e) = opened {
            self.fail(&id, e, events).await;
            return;
        }

        self.drive(&id, events).await;
    }

    fn open_turn(&self, id: &SessionId, is_new: bool, req: ChatRequest) -> Result<()> {
        let mut delta = Vec::new();
        if is_new {
            self.store.create(id)?;
            delta.extend(req.history.iter().filter_map(import_history));
        } else if !req.history.is_empty() {
            debug!(session_id = %id, entries = req.history.len(), "Ignoring history for existing session");
        }
        delta.push(Message::user(req.message));
        self.commit(id, delta, Cursor::supervisor(), None)?;
        Ok(())
    }

    /// Deliver an approve/deny decision to a parked session.
    pub async fn resume(&self, req: ResumeRequest, events: &EventEmitter) {
        let id = SessionId::from_string(req.thread_id.trim());
        let _lane = self.store.lock(&id).await;

        let session = match self.store.load(&id) {
            Ok(s) => s,
            Err(e) => {
                emit_fatal(events, e).await;
                return;
            }
        };

        let node = match session.cursor {
            Cursor::AwaitingApproval(node) => node,
            other => {
                info!(session_id = %id, cursor = %other, "Resume ignored, session not awaiting approval");
                events.send(StreamEvent::Final).await;
                return;
            }
        };

        let (note, cursor) = match req.action {
            ResumeAction::Approve => (
                Message::from_node(&node, "User approved the action."),
                Cursor::Running(node.clone()),
            ),
            ResumeAction::Deny => (
                Message::from_node(&node, "User denied the action."),
                Cursor::supervisor(),
            ),
        };
        info!(session_id = %id, node = %node, action = ?req.action, "Resuming session");

        match self.commit(&id, vec![note], cursor.clone(), None) {
            Ok(committed) => self.emit_step(events, &committed, &cursor).await,
            Err(e) => {
                self.fail(&id, e, events).await;
                return;
            }
        }

        self.drive(&id, events).await;
    }

    /// Step the session until it parks, finishes, errors, or the client leaves.
    async fn drive(&self, id: &SessionId, events: &EventEmitter) {
        let mut steps = 0usize;

        loop {
            let session = match self.store.load(id) {
                Ok(s) => s,
                Err(e) => {
                    self.fail(id, e, events).await;
                    return;
                }
            };

            let node = match &session.cursor {
                Cursor::Terminal => {
                    info!(session_id = %id, steps, "Session finished");
                    events.send(StreamEvent::Final).await;
                    return;
                }
                Cursor::Errored => {
                    emit_fatal(events, OpsError::SessionErrored(id.to_string())).await;
                    return;
                }
                Cursor::AwaitingApproval(node) => {
                    info!(session_id = %id, node = %node, "Parked for approval");
                    events
                        .send(StreamEvent::ApprovalRequired {
                            thread_id: id.to_string(),
                        })
                        .await;
                    return;
                }
                Cursor::Running(node) => node.clone(),
            };

            if events.is_closed() {
                info!(session_id = %id, cursor = %session.cursor, "Client disconnected, leaving session at cursor");
                return;
            }

            if steps >= self.max_steps {
                self.fail(id, OpsError::StepLimitExceeded(self.max_steps), events).await;
                return;
            }
            steps += 1;

            let result = if node == SUPERVISOR {
                self.supervisor_step(&session, events).await
            } else {
                self.worker_step(&session, &node, events).await
            };

            if let Err(e) = result {
                self.fail(id, e, events).await;
                return;
            }
        }
    }

    async fn supervisor_step(&self, session: &Session, events: &EventEmitter) -> Result<()> {
        let outcome = self.supervisor.decide(session).await;
        let next = outcome.decision.next_agent.clone();

        let cursor = if next == FINISH {
            Cursor::Terminal
        } else if self.roster.requires_approval(&next) {
            Cursor::AwaitingApproval(next)
        } else {
            Cursor::Running(next)
        };

        let delta: Vec<Message> = outcome.warning.into_iter().map(Message::system).collect();
        let committed = self.commit(&session.id, delta, cursor.clone(), Some(outcome.decision))?;
        self.emit_step(events, &committed, &cursor).await;
        Ok(())
    }

    async fn worker_step(&self, session: &Session, node: &str, events: &EventEmitter) -> Result<()> {
        let produced = match self.roster.get(node) {
            Some(def) => {
                debug!(session_id = %session.id, node, "Running worker");
                self.worker.run(def, self.roster.iteration_cap(def), session).await
            }
            None => {
                warn!(session_id = %session.id, node, "Cursor points at an unknown node");
                vec![Message::system(format!(
                    "Node {} is not part of the roster. Returning to the {}.",
                    node, SUPERVISOR
                ))]
            }
        };

        let cursor = Cursor::supervisor();
        let committed = self.commit(&session.id, produced, cursor.clone(), None)?;
        self.emit_step(events, &committed, &cursor).await;
        Ok(())
    }

    /// Merge a step's messages, move the cursor and make it durable.
    fn commit(
        &self,
        id: &SessionId,
        messages: Vec<Message>,
        cursor: Cursor,
        decision: Option<Decision>,
    ) -> Result<Vec<Message>> {
        let stored = self.store.append(id, messages)?;
        if let Some(decision) = decision {
            self.store.record_decision(id, decision)?;
        }
        self.store.set_cursor(id, cursor)?;
        self.store.checkpoint(id)?;
        Ok(stored)
    }

    async fn emit_step(&self, events: &EventEmitter, committed: &[Message], cursor: &Cursor) {
        events
            .send_all(committed.iter().flat_map(events_for_message))
            .await;
        if let Cursor::Running(node) = cursor {
            if node != SUPERVISOR {
                events
                    .send(StreamEvent::Activity {
                        agent: node.clone(),
                    })
                    .await;
            }
        }
    }

    /// Discard the failed step, mark the session errored and tell the client.
    async fn fail(&self, id: &SessionId, cause: OpsError, events: &EventEmitter) {
        error!(session_id = %id, error = %cause, "Session failed");

        let marked = self
            .store
            .rollback(id)
            .and_then(|_| self.store.set_cursor(id, Cursor::Errored))
            .and_then(|_| self.store.checkpoint(id));
        if let Err(e) = marked {
            warn!(session_id = %id, error = %e, "Could not persist errored state");
        }

        emit_fatal(events, cause).await;
    }
}

async fn emit_fatal(events: &EventEmitter, cause: impl std::fmt::Display) {
    events
        .send(StreamEvent::Error {
            agent: SYSTEM_AGENT.to_string(),
            content: cause.to_string(),
        })
        .await;
    events.send(StreamEvent::Final).await;
}

fn thread_or_new(thread_id: Option<&str>) -> SessionId {
    match thread_id.map(str::trim) {
        Some(t) if !t.is_empty() => SessionId::from_string(t),
        _ => SessionId::new(),
    }
}

fn import_history(entry: &HistoryEntry) -> Option<Message> {
    match entry.role.to_ascii_lowercase().as_str() {
        "user" | "human" => Some(Message::user(&entry.content)),
        "assistant" | "ai" => Some(Message::assistant(&entry.content)),
        "system" => Some(Message::system(&entry.content)),
        other => {
            debug!(role = other, "Skipping history entry with unknown role");
            None
        }
    }
}
