//! Collaborators that outlive a turn: the conversation log and fact extraction.

mod facts;
mod jsonl;

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DexError, DexResult};

pub use facts::{FactExtractor, FactStore, InMemoryFactStore, SummarizingFactExtractor, NO_FACTS};
pub use jsonl::JsonlConversationLog;

/// One completed turn as the conversation log stores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub user_id: String,
    pub utterance: String,
    pub reply: String,
    pub timestamp: DateTime<Utc>,
}

impl TurnRecord {
    pub fn new(
        user_id: impl Into<String>,
        utterance: impl Into<String>,
        reply: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            utterance: utterance.into(),
            reply: reply.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Append-only record of completed turns, one entry per turn.
#[async_trait]
pub trait ConversationLog: Send + Sync {
    async fn append(&self, record: &TurnRecord) -> DexResult<()>;

    /// Most recent `limit` records for `user_id`, oldest first.
    async fn recent(&self, user_id: &str, limit: usize) -> DexResult<Vec<TurnRecord>>;
}

#[derive(Default)]
pub struct InMemoryConversationLog {
    records: Mutex<HashMap<String, Vec<TurnRecord>>>,
}

impl InMemoryConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .map(|r| r.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ConversationLog for InMemoryConversationLog {
    async fn append(&self, record: &TurnRecord) -> DexResult<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|e| DexError::Log(format!("log lock poisoned: {e}")))?;
        records
            .entry(record.user_id.clone())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn recent(&self, user_id: &str, limit: usize) -> DexResult<Vec<TurnRecord>> {
        let records = self
            .records
            .lock()
            .map_err(|e| DexError::Log(format!("log lock poisoned: {e}")))?;
        let all = records.get(user_id).map(Vec::as_slice).unwrap_or(&[]);
        let skip = all.len().saturating_sub(limit);
        Ok(all[skip..].to_vec())
    }
}
