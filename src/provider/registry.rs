use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{DexError, DexResult};

use super::traits::{ReasoningBackend, SearchBackend};

/// Named backend clients, selected by configuration key.
pub struct BackendRegistry {
    reasoning: HashMap<String, Arc<dyn ReasoningBackend>>,
    search: HashMap<String, Arc<dyn SearchBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            reasoning: HashMap::new(),
            search: HashMap::new(),
        }
    }

    pub fn register(&mut self, key: impl Into<String>, backend: Arc<dyn ReasoningBackend>) {
        self.reasoning.insert(key.into(), backend);
    }

    pub fn register_search(&mut self, key: impl Into<String>, backend: Arc<dyn SearchBackend>) {
        self.search.insert(key.into(), backend);
    }

    pub fn get(&self, key: &str) -> DexResult<Arc<dyn ReasoningBackend>> {
        self.reasoning
            .get(key)
            .cloned()
            .ok_or_else(|| DexError::BackendNotFound { name: key.into() })
    }

    pub fn get_search(&self, key: &str) -> DexResult<Arc<dyn SearchBackend>> {
        self.search
            .get(key)
            .cloned()
            .ok_or_else(|| DexError::BackendNotFound { name: key.into() })
    }

    pub fn has(&self, key: &str) -> bool {
        self.reasoning.contains_key(key)
    }

    pub fn has_search(&self, key: &str) -> bool {
        self.search.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.reasoning.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
