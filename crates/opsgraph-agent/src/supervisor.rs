use std::sync::Arc;

use futures::StreamExt;
use tracing::{info, warn};

use opsgraph_core::config::ModelConfig;
use opsgraph_core::error::{OpsError, Result};
use opsgraph_core::session::{Decision, Session, FINISH};
use opsgraph_core::traits::LlmClient;
use opsgraph_core::types::{ChatMessage, StreamDelta};

use crate::render;
use crate::roster::Roster;

/// Raw routing answer before validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDecision {
    pub reasoning: String,
    pub candidate: String,
}

/// Pull `reasoning` / `next_agent` out of a backend answer.
///
/// Accepts a bare JSON object, one wrapped in code fences or prose, and
/// `next` as an alias. Anything else is taken as the candidate verbatim.
pub fn parse_decision(text: &str) -> ParsedDecision {
    let trimmed = text.trim();
    let object = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => {
            serde_json::from_str::<serde_json::Value>(&trimmed[start..=end]).ok()
        }
        _ => None,
    };

    match object {
        Some(serde_json::Value::Object(map)) => {
            let field = |k: &str| map.get(k).and_then(|v| v.as_str()).map(str::to_string);
            ParsedDecision {
                reasoning: field("reasoning").unwrap_or_default(),
                candidate: field("next_agent").or_else(|| field("next")).unwrap_or_default(),
            }
        }
        _ => ParsedDecision {
            reasoning: String::new(),
            candidate: trimmed.to_string(),
        },
    }
}

/// Result of one decision step.
#[derive(Debug, Clone)]
pub struct SupervisorOutcome {
    pub decision: Decision,
    /// Set when the decision came from the fallback policy.
    pub warning: Option<String>,
}

/// The decision node: asks the backend who acts next and validates the answer.
pub struct Supervisor {
    llm: Arc<dyn LlmClient>,
    model: ModelConfig,
    roster: Arc<Roster>,
    instructions: Option<String>,
}

impl Supervisor {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        model: &ModelConfig,
        roster: Arc<Roster>,
        instructions: Option<String>,
    ) -> Self {
        let mut model = model.clone();
        model.json_response = true;
        Self {
            llm,
            model,
            roster,
            instructions,
        }
    }

    async fn ask(&self, session: &Session) -> Result<String> {
        let mut messages = vec![ChatMessage::system(render::supervisor_prompt(
            &self.roster,
            self.instructions.as_deref(),
        ))];
        messages.extend(render::render_transcript(&session.messages));
        messages.push(ChatMessage::user(render::supervisor_question(&self.roster)));

        let mut stream = self.llm.chat_stream(&self.model, messages, &[]).await?;
        let mut text = String::new();
        while let Some(delta) = stream.next().await {
            if let StreamDelta::TextDelta(chunk) = delta? {
                text.push_str(&chunk);
            }
        }
        Ok(text)
    }

    /// Decide the next node. Never fails: backend errors and unusable
    /// answers go through the fallback policy.
    pub async fn decide(&self, session: &Session) -> SupervisorOutcome {
        let fault = match self.ask(session).await {
            Ok(text) => {
                let parsed = parse_decision(&text);
                match self.roster.normalize(&parsed.candidate) {
                    Some(next_agent) => {
                        info!(
                            session_id = %session.id,
                            next = %next_agent,
                            reasoning = %parsed.reasoning,
                            "Supervisor decision"
                        );
                        return SupervisorOutcome {
                            decision: Decision {
                                reasoning: parsed.reasoning,
                                next_agent,
                                fallback: false,
                            },
                            warning: None,
                        };
                    }
                    None => OpsError::UnknownDecisionTarget(parsed.candidate),
                }
            }
            Err(e) => OpsError::DecisionFault(e.to_string()),
        };
        self.fall_back(session, fault)
    }

    fn fall_back(&self, session: &Session, fault: OpsError) -> SupervisorOutcome {
        let fallback = self.roster.fallback();
        // A second fault after the fallback answered this turn stops instead of cycling
        let repeated = session.fell_back_to(fallback);
        let target = if repeated { FINISH } else { fallback };

        warn!(
            session_id = %session.id,
            error = %fault,
            next = target,
            repeated,
            "Supervisor fault, using fallback route"
        );

        SupervisorOutcome {
            decision: Decision {
                reasoning: format!("fallback after supervisor fault: {}", fault),
                next_agent: target.to_string(),
                fallback: true,
            },
            warning: Some(format!("{}. Falling back to {}.", fault, target)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsgraph_core::config::{default_roster, EngineConfig};
    use opsgraph_core::session::Message;
    use opsgraph_core::types::SessionId;
    use opsgraph_test_utils::{ScriptedLlm, Turn};

    fn session_with(msgs: Vec<Message>) -> Session {
        let mut s = Session::new(SessionId::from_string("t-sup"));
        for mut m in msgs {
            m.seq = s.next_seq;
            s.next_seq += 1;
            s.messages.push(m);
        }
        s
    }

    fn supervisor(llm: ScriptedLlm) -> Supervisor {
        let roster = Arc::new(Roster::new(default_roster(), &EngineConfig::default()).unwrap());
        Supervisor::new(Arc::new(llm), &ModelConfig::default(), roster, None)
    }

    #[test]
    fn parse_variants() {
        let cases: &[(&str, &str, &str)] = &[
            (r#"{"reasoning":"pods","next_agent":"K8s_Specialist"}"#, "pods", "K8s_Specialist"),
            ("```json\n{\"reasoning\": \"db\", \"next_agent\": \"GCP\"}\n```", "db", "GCP"),
            ("Sure! Here you go: {\"next\": \"FINISH\"} hope that helps", "", "FINISH"),
            ("Datadog_Specialist", "", "Datadog_Specialist"),
            (r#"{"reasoning":"no target"}"#, "no target", ""),
            ("{not json} Topology", "", "{not json} Topology"),
        ];
        for (input, reasoning, candidate) in cases {
            let parsed = parse_decision(input);
            assert_eq!(parsed.reasoning, *reasoning, "reasoning of {:?}", input);
            assert_eq!(parsed.candidate, *candidate, "candidate of {:?}", input);
        }
    }

    #[tokio::test]
    async fn valid_decision_passes_through() {
        let llm = ScriptedLlm::new().with_decisions([Turn::decide("k8s", "pods are restarting")]);
        let sup = supervisor(llm.clone());
        let out = sup.decide(&session_with(vec![Message::user("frontend is crashing")])).await;
        assert_eq!(out.decision.next_agent, "K8s_Specialist");
        assert_eq!(out.decision.reasoning, "pods are restarting");
        assert!(out.warning.is_none());

        let call = &llm.supervisor_calls()[0];
        assert!(call.json_response);
        assert!(call.tools.is_empty());
        assert!(call.transcript().contains("frontend is crashing"));
    }

    #[tokio::test]
    async fn backend_error_falls_back_with_warning() {
        let llm = ScriptedLlm::new().with_decisions([Turn::fail("HTTP 500: model crashed")]);
        let out = supervisor(llm)
            .decide(&session_with(vec![Message::user("why is checkout slow")]))
            .await;
        assert_eq!(out.decision.next_agent, "Topology_Specialist");
        let warning = out.warning.unwrap();
        assert!(warning.contains("HTTP 500: model crashed"));
        assert!(warning.contains("Falling back to Topology_Specialist"));
    }

    #[tokio::test]
    async fn unknown_target_falls_back() {
        let llm = ScriptedLlm::new().with_decisions([Turn::decide("Network_Specialist", "dns")]);
        let out = supervisor(llm)
            .decide(&session_with(vec![Message::user("dns broken")]))
            .await;
        assert_eq!(out.decision.next_agent, "Topology_Specialist");
        assert!(out.warning.unwrap().contains("Network_Specialist"));
    }

    fn routed_to(next_agent: &str, fallback: bool) -> Option<Decision> {
        Some(Decision {
            reasoning: String::new(),
            next_agent: next_agent.to_string(),
            fallback,
        })
    }

    #[tokio::test]
    async fn repeated_fault_after_fallback_finishes() {
        let llm = ScriptedLlm::new().with_decisions([Turn::fail("timeout")]);
        let mut session = session_with(vec![
            Message::user("is anything down?"),
            Message::system("Supervisor fault: timeout. Falling back to Topology_Specialist."),
            Message::from_node("Topology_Specialist", "all green"),
        ]);
        session.last_decision = routed_to("Topology_Specialist", true);
        let out = supervisor(llm).decide(&session).await;
        assert_eq!(out.decision.next_agent, FINISH);
        assert!(out.decision.fallback);
        assert!(out.warning.unwrap().contains("Falling back to FINISH"));
    }

    #[tokio::test]
    async fn fault_after_routed_fallback_node_still_falls_back() {
        let llm = ScriptedLlm::new().with_decisions([
            Turn::decide("Network_Specialist", "check dns"),
            Turn::fail("HTTP 503"),
        ]);
        let sup = supervisor(llm);
        let mut session = session_with(vec![
            Message::user("map the dependencies"),
            Message::from_node("Topology_Specialist", "frontend -> api -> cloudsql"),
        ]);
        session.last_decision = routed_to("Topology_Specialist", false);

        let out = sup.decide(&session).await;
        assert_eq!(out.decision.next_agent, "Topology_Specialist");
        assert!(out.decision.fallback);
        assert!(out.warning.unwrap().contains("Network_Specialist"));

        // A legitimate route in between clears the guard
        session.last_decision = routed_to("K8s_Specialist", false);
        let out = sup.decide(&session).await;
        assert_eq!(out.decision.next_agent, "Topology_Specialist");
    }

    fn swap_case(s: &str) -> String {
        s.chars()
            .map(|c| {
                if c.is_ascii_uppercase() {
                    c.to_ascii_lowercase()
                } else {
                    c.to_ascii_uppercase()
                }
            })
            .collect()
    }

    fn json_answer(s: &str) -> String {
        serde_json::json!({ "reasoning": "checked the transcript", "next_agent": s }).to_string()
    }

    #[tokio::test]
    async fn malformed_answers_always_yield_legal_routes() {
        let roster = Roster::new(default_roster(), &EngineConfig::default()).unwrap();
        let legal: Vec<String> = roster.legal_targets().iter().map(|t| t.to_string()).collect();
        let unknown = ["Network_Specialist", "Supervisor", "Specialist", "", "???", "K8s_Specialist or GCP_Specialist"];

        let cases: [fn(&str) -> String; 3] = [
            |s| s.to_string(),
            |s| s.to_ascii_lowercase(),
            |s| swap_case(s),
        ];
        let wrappers: [fn(&str) -> String; 11] = [
            |s| s.to_string(),
            |s| format!("\"{}\"", s),
            |s| format!("'{}'", s),
            |s| format!("`{}`", s),
            |s| format!("**{}**", s),
            |s| format!("  {}.\n", s),
            |s| format!("{}!?", s),
            |s| format!("I would route this to {} next.", s),
            |s| json_answer(s),
            |s| format!("```json\n{}\n```", json_answer(s)),
            |s| format!("Here is my answer: {} hope that helps", json_answer(s)),
        ];

        let session = session_with(vec![Message::user("checkout is failing")]);
        let tokens = legal.iter().map(String::as_str).chain(unknown);
        for token in tokens {
            for case in cases {
                for wrap in wrappers {
                    let raw = wrap(&case(token));
                    let llm = ScriptedLlm::new().with_decisions([Turn::text(raw.clone())]);
                    let out = supervisor(llm).decide(&session).await;
                    let next = out.decision.next_agent.as_str();

                    assert!(legal.iter().any(|l| l == next), "{:?} -> {}", raw, next);
                    if legal.iter().any(|l| l == token) {
                        assert_eq!(next, token, "{:?}", raw);
                        assert!(out.warning.is_none(), "{:?}", raw);
                    } else {
                        assert_eq!(next, "Topology_Specialist", "{:?}", raw);
                        assert!(out.decision.fallback, "{:?}", raw);
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn fallback_resets_on_new_user_turn() {
        let llm = ScriptedLlm::new().with_decisions([Turn::fail("timeout")]);
        let session = session_with(vec![
            Message::user("is anything down?"),
            Message::from_node("Topology_Specialist", "all green"),
            Message::user("check again please"),
        ]);
        let out = supervisor(llm).decide(&session).await;
        assert_eq!(out.decision.next_agent, "Topology_Specialist");
    }
}
