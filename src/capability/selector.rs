//! Per-stage capability selection.
//!
//! A reasoning backend cannot request a capability it was never shown, so after
//! top-K retrieval a fixed set of implications is applied to the retrieved name set.
//! They cover multi-step intents ("log an expense and remind me") that retrieval
//! alone would leave half-actionable.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{CapabilityRegistry, CapabilitySet};

/// Names of the capabilities the injection rules and the orchestrator reason about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityNames {
    pub create_record: String,
    pub persist_note: String,
    pub log_nutrition: String,
    pub health_summary: String,
    pub search_handoff: String,
    pub critical_alarm: String,
}

impl Default for CapabilityNames {
    fn default() -> Self {
        Self {
            create_record: "create_task".into(),
            persist_note: "save_memory".into(),
            log_nutrition: "log_meal".into(),
            health_summary: "get_health_dashboard".into(),
            search_handoff: "transfer_to_search".into(),
            critical_alarm: "client_schedule_critical_memory".into(),
        }
    }
}

pub struct CapabilitySelector {
    registry: Arc<CapabilityRegistry>,
    names: CapabilityNames,
}

impl CapabilitySelector {
    pub fn new(registry: Arc<CapabilityRegistry>, names: CapabilityNames) -> Self {
        Self { registry, names }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn names(&self) -> &CapabilityNames {
        &self.names
    }

    /// Top-`k` relevant capabilities for `instruction` plus injected safety nets.
    pub fn select(&self, instruction: &str, k: usize) -> CapabilitySet {
        if self.registry.is_empty() {
            return CapabilitySet::new();
        }

        let retrieved = match self.registry.relevant(instruction, k) {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "capability index unavailable, proceeding without capabilities");
                return CapabilitySet::new();
            }
        };

        let mut set: CapabilitySet = retrieved.into_iter().collect();
        let retrieved_names: Vec<String> = set.names().iter().map(|n| n.to_string()).collect();
        let has = |name: &str| retrieved_names.iter().any(|n| n == name);

        let mut injections: Vec<&str> = Vec::new();
        if has(self.names.create_record.as_str()) && !has(self.names.persist_note.as_str()) {
            injections.push(self.names.persist_note.as_str());
        }
        if has(self.names.persist_note.as_str()) && !has(self.names.create_record.as_str()) {
            injections.push(self.names.create_record.as_str());
        }
        if has(self.names.log_nutrition.as_str()) && !has(self.names.health_summary.as_str()) {
            injections.push(self.names.health_summary.as_str());
        }
        injections.push(self.names.search_handoff.as_str());

        for name in injections {
            if let Some(descriptor) = self.registry.lookup(name) {
                if set.insert(descriptor) {
                    debug!(capability = name, "injected safety-net capability");
                }
            }
        }

        debug!(
            instruction,
            selected = ?set.names(),
            "capability set selected"
        );
        set
    }
}
