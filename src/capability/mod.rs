//! Capabilities offered to reasoning backends.
//!
//! - [`CapabilityRegistry`] owns every descriptor and a semantic index over them
//! - [`CapabilitySelector`] builds the per-stage [`CapabilitySet`] with safety-net injection

pub mod index;
pub mod selector;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::DexResult;

pub use index::{ScoredKey, SemanticIndex, TfIdfIndex};
pub use selector::{CapabilityNames, CapabilitySelector};

/// Where an invocation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionSite {
    /// Executed by the calling client; never by the server.
    LocalDevice,
    /// Executed server-side against a persistence or external-API collaborator.
    RemoteService,
}

/// A capability a reasoning backend may request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    pub site: ExecutionSite,
}

impl CapabilityDescriptor {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: serde_json::Value,
        site: ExecutionSite,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            site,
        }
    }

    pub fn local(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: serde_json::Value,
    ) -> Self {
        Self::new(name, description, input_schema, ExecutionSite::LocalDevice)
    }

    pub fn remote(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: serde_json::Value,
    ) -> Self {
        Self::new(name, description, input_schema, ExecutionSite::RemoteService)
    }

    pub fn is_local(&self) -> bool {
        self.site == ExecutionSite::LocalDevice
    }

    /// Text the semantic index sees.
    pub fn index_text(&self) -> String {
        format!("{}: {}", self.name, self.description)
    }

    /// Arguments must be an object holding every `required` key of the schema.
    pub fn validate_arguments(&self, arguments: &serde_json::Value) -> Result<(), String> {
        let Some(obj) = arguments.as_object() else {
            return Err(format!(
                "arguments for '{}' must be a JSON object",
                self.name
            ));
        };
        let missing: Vec<&str> = self
            .input_schema
            .get("required")
            .and_then(|r| r.as_array())
            .map(|required| {
                required
                    .iter()
                    .filter_map(|k| k.as_str())
                    .filter(|k| obj.get(*k).map_or(true, |v| v.is_null()))
                    .collect()
            })
            .unwrap_or_default();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(format!(
                "missing required argument(s) for '{}': {}",
                self.name,
                missing.join(", ")
            ))
        }
    }
}

/// Ordered, name-deduplicated descriptors bound to one backend invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapabilitySet {
    items: Vec<Arc<CapabilityDescriptor>>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Append unless a capability with the same name is present. Returns whether it was added.
    pub fn insert(&mut self, descriptor: Arc<CapabilityDescriptor>) -> bool {
        if self.contains(&descriptor.name) {
            return false;
        }
        self.items.push(descriptor);
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.items.iter().any(|d| d.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.items.iter().map(|d| d.name.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<CapabilityDescriptor>> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl FromIterator<Arc<CapabilityDescriptor>> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Arc<CapabilityDescriptor>>>(iter: I) -> Self {
        let mut set = CapabilitySet::new();
        for descriptor in iter {
            set.insert(descriptor);
        }
        set
    }
}

/// Every capability known to the process, registered at startup.
pub struct CapabilityRegistry {
    descriptors: Vec<Arc<CapabilityDescriptor>>,
    by_name: HashMap<String, usize>,
    index: Box<dyn SemanticIndex>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::with_index(Box::new(TfIdfIndex::new()))
    }

    pub fn with_index(index: Box<dyn SemanticIndex>) -> Self {
        Self {
            descriptors: Vec::new(),
            by_name: HashMap::new(),
            index,
        }
    }

    /// Register a descriptor. Idempotent by name: a second registration is ignored.
    pub fn register(&mut self, descriptor: CapabilityDescriptor) -> bool {
        if self.by_name.contains_key(&descriptor.name) {
            warn!(capability = %descriptor.name, "capability already registered, ignoring");
            return false;
        }
        let key = self.descriptors.len();
        self.index.insert(key, &descriptor.index_text());
        self.by_name.insert(descriptor.name.clone(), key);
        self.descriptors.push(Arc::new(descriptor));
        true
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<CapabilityDescriptor>> {
        self.by_name
            .get(name)
            .map(|&key| Arc::clone(&self.descriptors[key]))
    }

    /// Up to `k` descriptors by descending similarity, ties in registration order.
    pub fn relevant(&self, query: &str, k: usize) -> DexResult<Vec<Arc<CapabilityDescriptor>>> {
        let scored = self.index.query(query, k)?;
        Ok(scored
            .into_iter()
            .filter_map(|s| self.descriptors.get(s.key).cloned())
            .collect())
    }

    pub fn site_of(&self, name: &str) -> Option<ExecutionSite> {
        self.lookup(name).map(|d| d.site)
    }

    pub fn names(&self) -> Vec<&str> {
        self.descriptors.iter().map(|d| d.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}
