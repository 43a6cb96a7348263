use opsgraph_core::config::NodeDefinition;
use opsgraph_core::session::{Message, Source};
use opsgraph_core::types::ChatMessage;

use crate::roster::Roster;

/// Flatten the session log into backend messages with each entry
/// attributed to its author.
pub fn render_transcript(messages: &[Message]) -> Vec<ChatMessage> {
    messages.iter().map(render_entry).collect()
}

fn render_entry(msg: &Message) -> ChatMessage {
    match &msg.source {
        Source::User => ChatMessage::user(msg.content.clone()),
        Source::Assistant => ChatMessage::assistant_text(msg.content.clone()),
        Source::Node(_) | Source::System => {
            ChatMessage::user(format!("[{}] {}", msg.source.label(), describe(msg)))
        }
    }
}

fn describe(msg: &Message) -> String {
    if let Some(inv) = &msg.tool_result {
        let status = if inv.is_error() { "failed" } else { "returned" };
        return format!("tool {} {}: {}", inv.tool, status, inv.output());
    }
    if !msg.tool_calls.is_empty() {
        let calls = msg
            .tool_calls
            .iter()
            .map(|c| format!("{}({})", c.name, c.args))
            .collect::<Vec<_>>()
            .join(", ");
        return if msg.content.is_empty() {
            format!("calling {}", calls)
        } else {
            format!("{}\n(calling {})", msg.content, calls)
        };
    }
    msg.content.clone()
}

const DEFAULT_SUPERVISOR_INSTRUCTIONS: &str = "You are the Supervisor of an infrastructure troubleshooting team. \
Read the conversation and decide which specialist acts next, or FINISH once the user's request has been answered.

Rules:
- Route to the specialist whose domain matches the open question.
- If a specialist reports an error that involves another domain (for example a connection refused to a database or an edge cache miss), route to that domain's specialist.
- Do not send the same question to the same specialist twice in a row without new information.
- Choose FINISH when the latest specialist answer resolves the request or nothing useful is left to do.";

/// System prompt for the decision step.
pub fn supervisor_prompt(roster: &Roster, instructions: Option<&str>) -> String {
    let team = roster
        .nodes()
        .iter()
        .map(|n| {
            let gate = if n.requires_approval {
                " (requires human approval)"
            } else {
                ""
            };
            format!("- {}: {}{}", n.name, n.capability, gate)
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "{}\n\nTeam:\n{}\n\nRespond with a single JSON object: {{\"reasoning\": \"<why>\", \"next_agent\": \"<one of: {}>\"}}",
        instructions.unwrap_or(DEFAULT_SUPERVISOR_INSTRUCTIONS),
        team,
        roster.legal_targets().join(", ")
    )
}

/// Closing request appended after the transcript for the decision step.
pub fn supervisor_question(roster: &Roster) -> String {
    format!(
        "Who should act next? Answer with the JSON object only; next_agent must be one of: {}.",
        roster.legal_targets().join(", ")
    )
}

/// System prompt for a worker node.
pub fn worker_prompt(node: &NodeDefinition) -> String {
    let mut prompt = format!(
        "You are {}, a specialist in {}.\n\
         Work on the latest user request using your tools when they help. \
         Report concrete findings (names, status codes, error lines). \
         If the problem points at another domain, say so explicitly so it can be handed over.",
        node.name, node.capability
    );
    if !node.instructions.is_empty() {
        prompt.push_str("\n\n");
        prompt.push_str(&node.instructions);
    }
    prompt
}
