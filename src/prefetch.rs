//! Context gathered concurrently before the first stage of a turn.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::warn;

use crate::error::DexResult;
use crate::types::TurnContext;

/// A source of extra directive context (e.g. today's tasks, recent transactions).
#[async_trait]
pub trait ContextSource: Send + Sync {
    fn name(&self) -> &str;

    /// `None` or an empty string contributes nothing.
    async fn fetch(&self, ctx: &TurnContext) -> DexResult<Option<String>>;
}

/// Fetch every source concurrently, each bounded by `limit`. Results keep source
/// order; failures and sources that run past `limit` are skipped.
pub async fn prefetch(
    sources: &[Arc<dyn ContextSource>],
    ctx: &TurnContext,
    limit: Duration,
) -> Vec<String> {
    let results = join_all(
        sources
            .iter()
            .map(|s| tokio::time::timeout(limit, s.fetch(ctx))),
    )
    .await;
    sources
        .iter()
        .zip(results)
        .filter_map(|(source, result)| match result {
            Ok(Ok(Some(text))) if !text.trim().is_empty() => Some(text),
            Ok(Ok(_)) => None,
            Ok(Err(e)) => {
                warn!(source = source.name(), error = %e, "context source failed, skipping");
                None
            }
            Err(_) => {
                warn!(
                    source = source.name(),
                    limit_ms = limit.as_millis() as u64,
                    "context source timed out, skipping"
                );
                None
            }
        })
        .collect()
}
