//! HTTP executor: forwards invocations to the persistence service.

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::capability::CapabilityDescriptor;
use crate::error::{DexError, DexResult};
use crate::types::CapabilityInvocation;

use super::CapabilityExecutor;

/// POSTs `{capability, arguments, user_id}` to `{base_url}/capabilities/{name}`.
///
/// A JSON response with a string `result` field yields that string; any other
/// success body is passed through verbatim.
pub struct HttpExecutor {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpExecutor {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    fn endpoint(&self, capability: &str) -> String {
        format!("{}/capabilities/{}", self.base_url, capability)
    }
}

fn result_text(body: String) -> String {
    match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(value) => match value.get("result").and_then(|v| v.as_str()) {
            Some(result) => result.to_string(),
            None => body,
        },
        Err(_) => body,
    }
}

#[async_trait]
impl CapabilityExecutor for HttpExecutor {
    async fn execute(
        &self,
        descriptor: &CapabilityDescriptor,
        invocation: &CapabilityInvocation,
        user_id: &str,
    ) -> DexResult<String> {
        let url = self.endpoint(&descriptor.name);
        let payload = json!({
            "capability": descriptor.name,
            "arguments": invocation.arguments,
            "user_id": user_id,
        });

        let mut builder = self.client.post(&url).json(&payload);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| DexError::CapabilityExecution {
            capability: descriptor.name.clone(),
            message: format!("HTTP request failed: {e}"),
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| DexError::CapabilityExecution {
                capability: descriptor.name.clone(),
                message: format!("Failed to read response body: {e}"),
            })?;

        debug!(capability = %descriptor.name, status = status.as_u16(), "capability executed");

        if status.is_success() {
            Ok(result_text(body))
        } else {
            Err(DexError::CapabilityExecution {
                capability: descriptor.name.clone(),
                message: format!("HTTP {}: {}", status.as_u16(), body),
            })
        }
    }

    fn executor_name(&self) -> &str {
        "http"
    }
}
