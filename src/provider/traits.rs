use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::capability::CapabilitySet;
use crate::error::DexResult;
use crate::types::*;

/// Everything one stage invocation sends to a reasoning backend.
#[derive(Debug, Clone)]
pub struct ReasoningRequest {
    pub messages: Vec<Message>,
    pub system: String,
    pub capabilities: CapabilitySet,
}

impl ReasoningRequest {
    pub fn new(messages: Vec<Message>, system: impl Into<String>) -> Self {
        Self {
            messages,
            system: system.into(),
            capabilities: CapabilitySet::new(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = capabilities;
        self
    }
}

/// Chat-model communication for one reasoning stage
#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    /// Name used in logs and errors
    fn name(&self) -> &str;

    /// Stream a completion, sending deltas through the channel
    async fn stream(
        &self,
        request: &ReasoningRequest,
        delta_tx: mpsc::UnboundedSender<StreamDelta>,
    ) -> DexResult<Message>;

    /// Non-streaming completion (default impl collects the stream)
    async fn complete(&self, request: &ReasoningRequest) -> DexResult<Message> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = self.stream(request, tx).await?;
        while rx.try_recv().is_ok() {}
        Ok(result)
    }
}

/// Web-grounded answering. Output is free text only, never capability invocations.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn search(&self, query: &str, directive: &str) -> DexResult<String>;
}

/// Search through a reasoning backend whose model answers from the web on its own
/// (no capabilities bound).
pub struct ReasoningSearch {
    backend: Arc<dyn ReasoningBackend>,
}

impl ReasoningSearch {
    pub fn new(backend: Arc<dyn ReasoningBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl SearchBackend for ReasoningSearch {
    fn name(&self) -> &str {
        self.backend.name()
    }

    async fn search(&self, query: &str, directive: &str) -> DexResult<String> {
        let request = ReasoningRequest::new(vec![Message::user(query)], directive);
        let message = self.backend.complete(&request).await?;
        Ok(message.text_content())
    }
}
