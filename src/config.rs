//! Orchestrator configuration, loaded from JSON with defaults for every field.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::capability::CapabilityNames;
use crate::delegation::{default_subsystems, SubsystemKeywords};
use crate::error::{DexError, DexResult};
use crate::provider::BackendRegistry;

/// Shape of the reasoning graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// Router stage plus a delegated action stage.
    Split,
    /// One stage that reasons and acts.
    Single,
}

/// What to do when a critical note is saved without the matching device alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriticalReminderPolicy {
    /// Nudge the backend once, then record the violation.
    Reprompt,
    /// Record the violation only.
    Flag,
    /// Ignore.
    Accept,
}

/// Backend registry keys for each stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageBackends {
    pub router: String,
    pub action: String,
    pub reason_act: String,
    pub search: String,
}

impl Default for StageBackends {
    fn default() -> Self {
        Self {
            router: "router".into(),
            action: "action".into(),
            reason_act: "reason_act".into(),
            search: "search".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_topology")]
    pub topology: Topology,
    #[serde(default)]
    pub backends: StageBackends,
    /// Top-K for the single-stage topology.
    #[serde(default = "default_reason_act_k")]
    pub reason_act_k: usize,
    /// Top-K for the delegated action stage.
    #[serde(default = "default_action_k")]
    pub action_k: usize,
    #[serde(default = "default_max_hops")]
    pub max_hops: usize,
    /// Prior exchanges sent to a stage.
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    /// Bound on a single backend attempt.
    #[serde(default = "default_backend_timeout_ms")]
    pub backend_timeout_ms: u64,
    #[serde(default = "default_capability_timeout_ms")]
    pub capability_timeout_ms: u64,
    /// Bound on each context source fetched before the first stage.
    #[serde(default = "default_prefetch_timeout_ms")]
    pub prefetch_timeout_ms: u64,
    /// Display truncation for capability input and output.
    #[serde(default = "default_max_payload_chars")]
    pub max_payload_chars: usize,
    /// Name prefix stripped from local-device capabilities in client actions.
    #[serde(default = "default_local_prefix")]
    pub local_prefix: String,
    #[serde(default = "default_critical_policy")]
    pub critical_policy: CriticalReminderPolicy,
    /// How long before the due time a critical alarm may ring.
    #[serde(default = "default_alarm_lead_minutes")]
    pub alarm_lead_minutes: i64,
    #[serde(default)]
    pub capability_names: CapabilityNames,
    #[serde(default = "default_subsystems")]
    pub subsystems: Vec<SubsystemKeywords>,
    #[serde(default = "default_fallback_reply")]
    pub fallback_reply: String,
    #[serde(default = "default_extract_facts")]
    pub extract_facts: bool,
}

/// One week.
const MAX_ALARM_LEAD_MINUTES: i64 = 7 * 24 * 60;

fn default_topology() -> Topology {
    Topology::Split
}
fn default_reason_act_k() -> usize {
    5
}
fn default_action_k() -> usize {
    10
}
fn default_max_hops() -> usize {
    8
}
fn default_max_history() -> usize {
    6
}
fn default_backend_timeout_ms() -> u64 {
    30_000
}
fn default_capability_timeout_ms() -> u64 {
    15_000
}
fn default_prefetch_timeout_ms() -> u64 {
    5_000
}
fn default_max_payload_chars() -> usize {
    200
}
fn default_local_prefix() -> String {
    "client_".into()
}
fn default_critical_policy() -> CriticalReminderPolicy {
    CriticalReminderPolicy::Reprompt
}
fn default_alarm_lead_minutes() -> i64 {
    60
}
fn default_fallback_reply() -> String {
    "Sorry, I'm having trouble right now. Please try again in a moment.".into()
}
fn default_extract_facts() -> bool {
    true
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            topology: default_topology(),
            backends: StageBackends::default(),
            reason_act_k: default_reason_act_k(),
            action_k: default_action_k(),
            max_hops: default_max_hops(),
            max_history: default_max_history(),
            backend_timeout_ms: default_backend_timeout_ms(),
            capability_timeout_ms: default_capability_timeout_ms(),
            prefetch_timeout_ms: default_prefetch_timeout_ms(),
            max_payload_chars: default_max_payload_chars(),
            local_prefix: default_local_prefix(),
            critical_policy: default_critical_policy(),
            alarm_lead_minutes: default_alarm_lead_minutes(),
            capability_names: CapabilityNames::default(),
            subsystems: default_subsystems(),
            fallback_reply: default_fallback_reply(),
            extract_facts: default_extract_facts(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_json_str(json: &str) -> DexResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn from_file(path: impl AsRef<Path>) -> DexResult<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_json_str(&content)
    }

    pub fn validate(&self) -> DexResult<()> {
        if self.reason_act_k == 0 || self.action_k == 0 {
            return Err(DexError::Config("top-K values must be at least 1".into()));
        }
        if self.max_hops == 0 {
            return Err(DexError::Config("max_hops must be at least 1".into()));
        }
        if self.backend_timeout_ms == 0
            || self.capability_timeout_ms == 0
            || self.prefetch_timeout_ms == 0
        {
            return Err(DexError::Config("timeouts must be non-zero".into()));
        }
        if !(0..=MAX_ALARM_LEAD_MINUTES).contains(&self.alarm_lead_minutes) {
            return Err(DexError::Config(format!(
                "alarm_lead_minutes must be between 0 and {MAX_ALARM_LEAD_MINUTES}"
            )));
        }
        if self.local_prefix.is_empty() {
            return Err(DexError::Config("local_prefix must not be empty".into()));
        }
        Ok(())
    }

    /// Registry keys the configured topology needs.
    pub fn required_backends(&self) -> Vec<&str> {
        match self.topology {
            Topology::Split => vec![self.backends.router.as_str(), self.backends.action.as_str()],
            Topology::Single => vec![self.backends.reason_act.as_str()],
        }
    }

    /// Every backend the topology needs is registered.
    pub fn check_backends(&self, registry: &BackendRegistry) -> DexResult<()> {
        for key in self.required_backends() {
            if !registry.has(key) {
                return Err(DexError::Config(format!(
                    "backend '{key}' required by {:?} topology is not registered",
                    self.topology
                )));
            }
        }
        if !registry.has_search(&self.backends.search) {
            return Err(DexError::Config(format!(
                "search backend '{}' is not registered",
                self.backends.search
            )));
        }
        Ok(())
    }
}
