use std::collections::HashMap;

use opsgraph_core::config::{EngineConfig, NodeDefinition};
use opsgraph_core::error::{OpsError, Result};
use opsgraph_core::session::{FINISH, SUPERVISOR, SYSTEM_AGENT};
use opsgraph_tools::ToolRegistry;

/// The fixed set of worker nodes, indexed by name.
///
/// Built once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct Roster {
    nodes: Vec<NodeDefinition>,
    index: HashMap<String, usize>,
    fallback: String,
    default_max_iterations: usize,
}

impl Roster {
    /// Validate and index the node definitions.
    pub fn new(nodes: Vec<NodeDefinition>, engine: &EngineConfig) -> Result<Self> {
        if nodes.is_empty() {
            return Err(OpsError::Config("roster has no nodes".into()));
        }

        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            let reserved = [SUPERVISOR, FINISH, SYSTEM_AGENT];
            if reserved.iter().any(|r| r.eq_ignore_ascii_case(&node.name)) {
                return Err(OpsError::Config(format!(
                    "node name '{}' is reserved",
                    node.name
                )));
            }
            if !node.name.ends_with(&engine.node_suffix) || node.name == engine.node_suffix {
                return Err(OpsError::Config(format!(
                    "node '{}' must be named <Domain>{}",
                    node.name, engine.node_suffix
                )));
            }
            if index.insert(node.name.clone(), i).is_some() {
                return Err(OpsError::Config(format!("duplicate node '{}'", node.name)));
            }
        }

        let fallback = match index.get(&engine.fallback_node) {
            Some(&i) if nodes[i].requires_approval => {
                return Err(OpsError::Config(format!(
                    "fallback node '{}' cannot require approval",
                    engine.fallback_node
                )))
            }
            Some(_) => engine.fallback_node.clone(),
            None => {
                return Err(OpsError::Config(format!(
                    "fallback node '{}' is not in the roster",
                    engine.fallback_node
                )))
            }
        };

        Ok(Self {
            nodes,
            index,
            fallback,
            default_max_iterations: engine.default_max_iterations.max(1),
        })
    }

    /// Every tool bound to a node must exist in the registry.
    pub fn check_tools(&self, registry: &ToolRegistry) -> Result<()> {
        for node in &self.nodes {
            if let Some(missing) = node.tools.iter().find(|t| !registry.contains(t)) {
                return Err(OpsError::Config(format!(
                    "node '{}' binds unknown tool '{}'",
                    node.name, missing
                )));
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&NodeDefinition> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    pub fn nodes(&self) -> &[NodeDefinition] {
        &self.nodes
    }

    pub fn fallback(&self) -> &str {
        &self.fallback
    }

    pub fn requires_approval(&self, name: &str) -> bool {
        self.get(name).map(|n| n.requires_approval).unwrap_or(false)
    }

    pub fn iteration_cap(&self, node: &NodeDefinition) -> usize {
        node.max_iterations.unwrap_or(self.default_max_iterations).max(1)
    }

    /// Legal routing targets: every node name plus the terminal marker.
    pub fn legal_targets(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .map(|n| n.name.as_str())
            .chain(std::iter::once(FINISH))
            .collect()
    }

    /// Map a raw routing candidate onto a legal target.
    ///
    /// Tries an exact match, then a case-insensitive one, then substring
    /// containment in either direction. Substring matching must be
    /// unambiguous.
    pub fn normalize(&self, candidate: &str) -> Option<String> {
        let cleaned = clean_candidate(candidate);
        if cleaned.is_empty() {
            return None;
        }
        let legal = self.legal_targets();

        if let Some(hit) = legal.iter().find(|l| **l == cleaned) {
            return Some(hit.to_string());
        }
        if let Some(hit) = legal.iter().find(|l| l.eq_ignore_ascii_case(cleaned)) {
            return Some(hit.to_string());
        }

        let lowered = cleaned.to_ascii_lowercase();
        let hits: Vec<&str> = legal
            .iter()
            .copied()
            .filter(|l| {
                let l = l.to_ascii_lowercase();
                lowered.contains(&l) || l.contains(&lowered)
            })
            .collect();

        match hits.as_slice() {
            [only] => Some(only.to_string()),
            _ => None,
        }
    }
}

fn clean_candidate(raw: &str) -> &str {
    raw.trim()
        .trim_matches(|c: char| {
            c.is_whitespace() || matches!(c, '"' | '\'' | '`' | '*' | '.' | ',' | ';' | ':' | '!' | '?')
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsgraph_core::config::default_roster;

    fn roster() -> Roster {
        Roster::new(default_roster(), &EngineConfig::default()).unwrap()
    }

    #[test]
    fn default_roster_is_valid() {
        let r = roster();
        assert_eq!(r.nodes().len(), 10);
        assert_eq!(r.fallback(), "Topology_Specialist");
        assert!(r.requires_approval("Automation_Specialist"));
        assert!(!r.requires_approval("K8s_Specialist"));
        assert_eq!(r.legal_targets().last(), Some(&FINISH));
        r.check_tools(&ToolRegistry::default()).unwrap();
    }

    #[test]
    fn normalizer_table() {
        let r = roster();
        let cases: &[(&str, Option<&str>)] = &[
            ("K8s_Specialist", Some("K8s_Specialist")),
            ("k8s_specialist", Some("K8s_Specialist")),
            ("  \"GCP_Specialist\". ", Some("GCP_Specialist")),
            ("`Datadog_Specialist`", Some("Datadog_Specialist")),
            ("**Azion_Specialist**", Some("Azion_Specialist")),
            ("finish", Some("FINISH")),
            ("FINISH.", Some("FINISH")),
            ("K8s", Some("K8s_Specialist")),
            ("topology", Some("Topology_Specialist")),
            ("I would route this to the Security_Specialist next", Some("Security_Specialist")),
            ("Specialist", None),
            ("K8s_Specialist or GCP_Specialist", None),
            ("Supervisor", None),
            ("", None),
            ("???", None),
            ("Network_Specialist", None),
        ];
        for (input, expected) in cases {
            assert_eq!(
                r.normalize(input).as_deref(),
                *expected,
                "normalize({:?})",
                input
            );
        }
    }

    #[test]
    fn decorated_targets_normalize_back() {
        let r = roster();
        for target in r.legal_targets() {
            let lower = target.to_ascii_lowercase();
            let upper = target.to_ascii_uppercase();
            for variant in [&lower, &upper] {
                for raw in [
                    format!("'{}'", variant),
                    format!("`{}`,", variant),
                    format!("  {}?!", variant),
                    format!("send it to {} please", variant),
                ] {
                    assert_eq!(r.normalize(&raw).as_deref(), Some(target), "{:?}", raw);
                }
            }
            let stem = target.trim_end_matches("_Specialist");
            if stem != target {
                assert_eq!(r.normalize(stem).as_deref(), Some(target), "{:?}", stem);
            }
        }
    }

    #[test]
    fn rejects_bad_rosters() {
        let engine = EngineConfig::default();
        let bad_suffix = vec![NodeDefinition::new("Kubernetes", "k8s")];
        assert!(Roster::new(bad_suffix, &engine).is_err());

        let dup = vec![
            NodeDefinition::new("Topology_Specialist", "a"),
            NodeDefinition::new("Topology_Specialist", "b"),
        ];
        assert!(Roster::new(dup, &engine).is_err());

        let no_fallback = vec![NodeDefinition::new("K8s_Specialist", "k8s")];
        let err = Roster::new(no_fallback, &engine).unwrap_err();
        assert!(err.to_string().contains("fallback"));

        let gated_fallback = vec![NodeDefinition::new("Topology_Specialist", "t").gated()];
        assert!(Roster::new(gated_fallback, &engine).is_err());
    }

    #[test]
    fn unknown_tool_binding_is_rejected() {
        let nodes = vec![NodeDefinition::new("Topology_Specialist", "t").with_tools(&["kubectl"])];
        let r = Roster::new(nodes, &EngineConfig::default()).unwrap();
        let err = r.check_tools(&ToolRegistry::default()).unwrap_err();
        assert!(err.to_string().contains("kubectl"));
    }

    #[test]
    fn iteration_cap_defaults() {
        let nodes = vec![
            NodeDefinition::new("Topology_Specialist", "t"),
            NodeDefinition::new("K8s_Specialist", "k").with_max_iterations(3),
        ];
        let r = Roster::new(nodes, &EngineConfig::default()).unwrap();
        assert_eq!(r.iteration_cap(r.get("Topology_Specialist").unwrap()), 8);
        assert_eq!(r.iteration_cap(r.get("K8s_Specialist").unwrap()), 3);
    }
}
