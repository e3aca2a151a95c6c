//! The transition function of the turn graph.

use crate::capability::{CapabilityRegistry, ExecutionSite};
use crate::delegation::{DelegationParser, DelegationResult};
use crate::stream::ClientAction;
use crate::types::{CapabilityInvocation, ReasoningOutput};

/// Where the graph goes after one reasoning output. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum RoutingDecision {
    /// Execute `remote` in order; `deferred` are local invocations held for the terminal event.
    ExecuteRemote {
        remote: Vec<CapabilityInvocation>,
        deferred: Vec<CapabilityInvocation>,
    },
    /// Only local invocations: hand them to the client.
    ClientAction { local: Vec<CapabilityInvocation> },
    Delegate {
        target: String,
        instruction: String,
        expanded: String,
    },
    Search { query: String },
    Terminate { text: String },
}

impl RoutingDecision {
    pub fn kind(&self) -> &'static str {
        match self {
            RoutingDecision::ExecuteRemote { .. } => "execute-remote",
            RoutingDecision::ClientAction { .. } => "client-action",
            RoutingDecision::Delegate { .. } => "delegate",
            RoutingDecision::Search { .. } => "search",
            RoutingDecision::Terminate { .. } => "terminate",
        }
    }
}

/// Read-only inputs of [`route`].
pub struct RouteContext<'a> {
    pub registry: &'a CapabilityRegistry,
    pub parser: &'a DelegationParser,
    pub search_handoff: &'a str,
    pub local_prefix: &'a str,
    /// Search query fallback when the handoff carries none.
    pub utterance: &'a str,
}

impl RouteContext<'_> {
    /// Registered site wins; unregistered names fall back to the prefix convention.
    pub fn site_of(&self, name: &str) -> ExecutionSite {
        self.registry.site_of(name).unwrap_or_else(|| {
            if name.starts_with(self.local_prefix) {
                ExecutionSite::LocalDevice
            } else {
                ExecutionSite::RemoteService
            }
        })
    }

    pub fn client_action(&self, invocation: &CapabilityInvocation) -> ClientAction {
        let action = invocation
            .name
            .strip_prefix(self.local_prefix)
            .unwrap_or(&invocation.name);
        ClientAction::new(action, invocation.arguments.clone())
    }
}

pub fn route(output: &ReasoningOutput, cx: &RouteContext<'_>) -> RoutingDecision {
    if output.has_invocations() {
        if let Some(handoff) = output
            .invocations
            .iter()
            .find(|i| i.name == cx.search_handoff)
        {
            let query = handoff
                .arguments
                .get("query")
                .and_then(|q| q.as_str())
                .map(str::trim)
                .filter(|q| !q.is_empty())
                .unwrap_or(cx.utterance);
            return RoutingDecision::Search {
                query: query.to_string(),
            };
        }

        let (local, remote): (Vec<_>, Vec<_>) = output
            .invocations
            .iter()
            .cloned()
            .partition(|i| cx.site_of(&i.name) == ExecutionSite::LocalDevice);

        if remote.is_empty() {
            return RoutingDecision::ClientAction { local };
        }
        return RoutingDecision::ExecuteRemote {
            remote,
            deferred: local,
        };
    }

    match cx.parser.parse(&output.text) {
        DelegationResult::Delegate {
            target,
            instruction,
            expanded,
        } => RoutingDecision::Delegate {
            target,
            instruction,
            expanded,
        },
        DelegationResult::Search { query } => RoutingDecision::Search { query },
        DelegationResult::Plain => RoutingDecision::Terminate {
            text: output.text.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityDescriptor;
    use serde_json::json;

    fn registry() -> CapabilityRegistry {
        let mut r = CapabilityRegistry::new();
        r.register(CapabilityDescriptor::remote("save_memory", "Save a note", json!({})));
        r.register(CapabilityDescriptor::remote("transfer_to_search", "Search the web", json!({})));
        r.register(CapabilityDescriptor::local("client_set_alarm", "Set an alarm", json!({})));
        r
    }

    fn decide(output: ReasoningOutput) -> RoutingDecision {
        let registry = registry();
        let parser = DelegationParser::default();
        let cx = RouteContext {
            registry: &registry,
            parser: &parser,
            search_handoff: "transfer_to_search",
            local_prefix: "client_",
            utterance: "what's the weather",
        };
        route(&output, &cx)
    }

    fn with_calls(calls: Vec<CapabilityInvocation>) -> ReasoningOutput {
        ReasoningOutput {
            text: String::new(),
            invocations: calls,
        }
    }

    #[test]
    fn plain_text_terminates() {
        assert_eq!(
            decide(ReasoningOutput::text("Hi!")),
            RoutingDecision::Terminate { text: "Hi!".into() }
        );
    }

    #[test]
    fn delegation_marker_delegates() {
        let decision = decide(ReasoningOutput::text(
            "||DELEGATE||: TASK SYS - add milk to groceries",
        ));
        assert!(matches!(decision, RoutingDecision::Delegate { ref target, .. } if target == "TASK SYS"));
    }

    #[test]
    fn search_marker_searches() {
        assert_eq!(
            decide(ReasoningOutput::text("||SEARCH||: pune weather")),
            RoutingDecision::Search {
                query: "pune weather".into()
            }
        );
    }

    #[test]
    fn search_handoff_wins_and_defaults_query() {
        let decision = decide(with_calls(vec![
            CapabilityInvocation::new("save_memory", json!({})),
            CapabilityInvocation::new("transfer_to_search", json!({})),
        ]));
        assert_eq!(
            decision,
            RoutingDecision::Search {
                query: "what's the weather".into()
            }
        );
    }

    #[test]
    fn local_only_is_client_action() {
        let decision = decide(with_calls(vec![CapabilityInvocation::new(
            "client_set_alarm",
            json!({"time": "07:00"}),
        )]));
        assert!(matches!(decision, RoutingDecision::ClientAction { ref local } if local.len() == 1));
    }

    #[test]
    fn mixed_defers_local() {
        let decision = decide(with_calls(vec![
            CapabilityInvocation::new("client_set_alarm", json!({})),
            CapabilityInvocation::new("save_memory", json!({})),
        ]));
        match decision {
            RoutingDecision::ExecuteRemote { remote, deferred } => {
                assert_eq!(remote[0].name, "save_memory");
                assert_eq!(deferred[0].name, "client_set_alarm");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unregistered_prefixed_names_are_local() {
        let registry = registry();
        let parser = DelegationParser::default();
        let cx = RouteContext {
            registry: &registry,
            parser: &parser,
            search_handoff: "transfer_to_search",
            local_prefix: "client_",
            utterance: "",
        };
        assert_eq!(cx.site_of("client_call_contact"), ExecutionSite::LocalDevice);
        assert_eq!(cx.site_of("get_tasks"), ExecutionSite::RemoteService);
        let action = cx.client_action(&CapabilityInvocation::new("client_set_alarm", json!({"time": "7"})));
        assert_eq!(action.action, "set_alarm");
    }
}
