use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::error::DexResult;

use super::{ConversationLog, TurnRecord};

/// JSONL conversation log, one file per user under `base_dir`.
pub struct JsonlConversationLog {
    base_dir: PathBuf,
}

impl JsonlConversationLog {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Hex of the id's bytes: distinct ids never share a file and none escapes `base_dir`.
    fn user_path(&self, user_id: &str) -> PathBuf {
        let encoded: String = user_id.bytes().map(|b| format!("{b:02x}")).collect();
        self.base_dir.join(format!("{encoded}.jsonl"))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

#[async_trait]
impl ConversationLog for JsonlConversationLog {
    async fn append(&self, record: &TurnRecord) -> DexResult<()> {
        tokio::fs::create_dir_all(&self.base_dir).await?;
        let path = self.user_path(&record.user_id);
        let line = serde_json::to_string(record)? + "\n";

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    async fn recent(&self, user_id: &str, limit: usize) -> DexResult<Vec<TurnRecord>> {
        let path = self.user_path(user_id);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(Vec::new());
        }

        let content = tokio::fs::read_to_string(&path).await?;
        let records: Vec<TurnRecord> = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str::<TurnRecord>(line).ok())
            .filter(|r| r.user_id == user_id)
            .collect();
        let skip = records.len().saturating_sub(limit);
        Ok(records.into_iter().skip(skip).collect())
    }
}
