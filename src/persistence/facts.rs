//! Fire-and-forget fact extraction from completed turns.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use crate::error::{DexError, DexResult};
use crate::provider::{ReasoningBackend, ReasoningRequest};
use crate::types::Message;

use super::TurnRecord;

/// Extractor reply meaning the exchange held nothing worth remembering.
pub const NO_FACTS: &str = "NO_FACTS";

const ARCHIVIST_DIRECTIVE: &str = "You are a memory archivist.";

/// Long-term store for extracted facts.
#[async_trait]
pub trait FactStore: Send + Sync {
    async fn store(&self, user_id: &str, fact: &str) -> DexResult<()>;
}

#[async_trait]
pub trait FactExtractor: Send + Sync {
    /// Returns the stored fact, or `None` when nothing was worth keeping.
    async fn extract(&self, record: &TurnRecord) -> DexResult<Option<String>>;
}

#[derive(Default)]
pub struct InMemoryFactStore {
    facts: Mutex<HashMap<String, Vec<String>>>,
}

impl InMemoryFactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn facts_for(&self, user_id: &str) -> Vec<String> {
        self.facts
            .lock()
            .ok()
            .and_then(|f| f.get(user_id).cloned())
            .unwrap_or_default()
    }
}

#[async_trait]
impl FactStore for InMemoryFactStore {
    async fn store(&self, user_id: &str, fact: &str) -> DexResult<()> {
        let mut facts = self
            .facts
            .lock()
            .map_err(|e| DexError::Log(format!("fact store lock poisoned: {e}")))?;
        facts
            .entry(user_id.to_string())
            .or_default()
            .push(fact.to_string());
        Ok(())
    }
}

/// Asks a reasoning backend to distil the exchange into one concise fact.
pub struct SummarizingFactExtractor {
    backend: Arc<dyn ReasoningBackend>,
    store: Arc<dyn FactStore>,
}

impl SummarizingFactExtractor {
    pub fn new(backend: Arc<dyn ReasoningBackend>, store: Arc<dyn FactStore>) -> Self {
        Self { backend, store }
    }

    fn prompt(record: &TurnRecord) -> String {
        format!(
            "Analyze this interaction between User and AI.\n\
             User: \"{}\"\n\
             AI: \"{}\"\n\n\
             Task: Extract any meaningful facts, preferences, plans, or completed actions.\n\
             - If it's just chit-chat (e.g., \"Hi\", \"Thanks\"), return \"{NO_FACTS}\".\n\
             - If it's a specific fact, summarize it concisely.\n\n\
             Example Output: \"User prefers Python for backend.\"",
            record.utterance, record.reply
        )
    }
}

#[async_trait]
impl FactExtractor for SummarizingFactExtractor {
    async fn extract(&self, record: &TurnRecord) -> DexResult<Option<String>> {
        let request = ReasoningRequest::new(vec![Message::user(Self::prompt(record))], ARCHIVIST_DIRECTIVE);
        let reply = self.backend.complete(&request).await?;
        let fact = reply.text_content().trim().trim_matches('"').trim().to_string();

        if fact.is_empty() || fact == NO_FACTS {
            debug!(user_id = %record.user_id, "no facts in exchange");
            return Ok(None);
        }

        self.store.store(&record.user_id, &fact).await?;
        debug!(user_id = %record.user_id, fact = %fact, "fact stored");
        Ok(Some(fact))
    }
}
