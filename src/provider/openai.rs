use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::debug;

use crate::capability::CapabilitySet;
use crate::error::{DexError, DexResult};
use crate::types::*;

use super::traits::{ReasoningBackend, ReasoningRequest};

/// Connection settings for an OpenAI-compatible chat-completions endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenAiCompatConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_output_tokens: usize,
}

impl OpenAiCompatConfig {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            temperature: None,
            max_output_tokens: 0,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

pub struct OpenAiCompatBackend {
    client: Client,
    config: OpenAiCompatConfig,
}

impl OpenAiCompatBackend {
    pub fn new(config: OpenAiCompatConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    fn build_body(&self, messages: &[Message], system: &str, capabilities: &CapabilitySet) -> serde_json::Value {
        let mut api_messages = vec![json!({"role": "system", "content": system})];

        for msg in messages {
            api_messages.push(message_to_api(msg));
        }

        let mut body = json!({
            "model": self.config.model,
            "messages": api_messages,
            "stream": true,
        });

        if self.config.max_output_tokens > 0 {
            body["max_tokens"] = json!(self.config.max_output_tokens);
        }
        if let Some(t) = self.config.temperature {
            body["temperature"] = json!(t);
        }

        if !capabilities.is_empty() {
            let api_tools: Vec<serde_json::Value> = capabilities
                .iter()
                .map(|d| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": d.name,
                            "description": d.description,
                            "parameters": d.input_schema,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(api_tools);
            body["tool_choice"] = json!("auto");
        }

        body
    }
}

/// 429 and 5xx are worth a retry; any other 4xx is the request's own fault.
fn status_error(model: &str, status: u16, body: &str) -> DexError {
    match status {
        429 => DexError::RateLimited {
            backend: model.to_string(),
            retry_after_ms: 5000,
        },
        400..=499 => DexError::Api {
            backend: model.to_string(),
            status,
            message: body.to_string(),
        },
        _ => DexError::backend(model, format!("API error {status}: {body}")),
    }
}

fn message_to_api(msg: &Message) -> serde_json::Value {
    match msg.role {
        Role::Assistant => {
            let mut result = json!({"role": "assistant"});
            let mut content_text = String::new();
            let mut tool_calls: Vec<serde_json::Value> = Vec::new();

            for block in &msg.content {
                match block {
                    ContentBlock::Text { text } => content_text.push_str(text),
                    ContentBlock::CapabilityCall { id, name, arguments } => {
                        tool_calls.push(json!({
                            "id": id,
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": arguments.to_string(),
                            }
                        }));
                    }
                    ContentBlock::CapabilityResult { .. } => {}
                }
            }

            if !content_text.is_empty() || tool_calls.is_empty() {
                result["content"] = json!(content_text);
            }
            if !tool_calls.is_empty() {
                result["tool_calls"] = json!(tool_calls);
            }
            result
        }
        Role::Tool => match msg.content.first() {
            Some(ContentBlock::CapabilityResult { call_id, content, .. }) => json!({
                "role": "tool",
                "tool_call_id": call_id,
                "content": content,
            }),
            _ => json!({"role": "user", "content": msg.text_content()}),
        },
        Role::User => json!({"role": "user", "content": msg.text_content()}),
        Role::System => json!({"role": "system", "content": msg.text_content()}),
    }
}

/// Accumulates one streamed completion out of `data:` lines.
#[derive(Default)]
struct StreamAccumulator {
    content_text: String,
    // (id, name, args)
    tool_calls: Vec<(String, String, String)>,
    usage: Option<TokenUsage>,
}

impl StreamAccumulator {
    /// Returns false once the stream signals completion.
    fn feed_line(&mut self, line: &str, delta_tx: &mpsc::UnboundedSender<StreamDelta>) -> bool {
        let Some(data_str) = line.strip_prefix("data:") else {
            return true;
        };
        let data_str = data_str.trim();
        if data_str == "[DONE]" {
            return false;
        }
        let Ok(data) = serde_json::from_str::<serde_json::Value>(data_str) else {
            return true;
        };

        if let Some(delta) = data
            .get("choices")
            .and_then(|v| v.as_array())
            .and_then(|c| c.first())
            .and_then(|c| c.get("delta"))
        {
            if let Some(content) = delta.get("content").and_then(|v| v.as_str()) {
                self.content_text.push_str(content);
                let _ = delta_tx.send(StreamDelta::TextDelta {
                    text: content.to_string(),
                });
            }

            if let Some(tcs) = delta.get("tool_calls").and_then(|v| v.as_array()) {
                for tc in tcs {
                    let idx = tc.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                    while self.tool_calls.len() <= idx {
                        self.tool_calls
                            .push((String::new(), String::new(), String::new()));
                    }
                    let entry = &mut self.tool_calls[idx];
                    if let Some(id) = tc.get("id").and_then(|v| v.as_str()) {
                        entry.0 = id.to_string();
                    }
                    if let Some(func) = tc.get("function") {
                        if let Some(name) = func.get("name").and_then(|v| v.as_str()) {
                            entry.1 = name.to_string();
                        }
                        if let Some(args) = func.get("arguments").and_then(|v| v.as_str()) {
                            entry.2.push_str(args);
                            let _ = delta_tx.send(StreamDelta::CapabilityCallDelta {
                                id: entry.0.clone(),
                                name: entry.1.clone(),
                                arguments_delta: args.to_string(),
                            });
                        }
                    }
                }
            }
        }

        if let Some(u) = data.get("usage").filter(|u| !u.is_null()) {
            let input = u.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
            let output = u.get("completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
            self.usage = Some(TokenUsage::new(input as usize, output as usize));
        }
        true
    }

    fn finish(self, model: &str) -> Message {
        let mut content_blocks: Vec<ContentBlock> = Vec::new();
        if !self.content_text.is_empty() {
            content_blocks.push(ContentBlock::text(self.content_text));
        }
        for (id, name, args_str) in self.tool_calls {
            if name.is_empty() {
                continue;
            }
            // Unparseable arguments surface as a non-object and fail validation downstream.
            let args = if args_str.trim().is_empty() {
                json!({})
            } else {
                serde_json::from_str(&args_str).unwrap_or(serde_json::Value::String(args_str))
            };
            let id = if id.is_empty() {
                uuid::Uuid::new_v4().to_string()
            } else {
                id
            };
            content_blocks.push(ContentBlock::capability_call(id, name, args));
        }

        let mut msg = Message::new(Role::Assistant, content_blocks);
        msg.model = Some(model.to_string());
        msg.usage = self.usage;
        msg
    }
}

#[async_trait]
impl ReasoningBackend for OpenAiCompatBackend {
    fn name(&self) -> &str {
        &self.config.model
    }

    async fn stream(
        &self,
        request: &ReasoningRequest,
        delta_tx: mpsc::UnboundedSender<StreamDelta>,
    ) -> DexResult<Message> {
        let body = self.build_body(&request.messages, &request.system, &request.capabilities);
        let url = format!(
            "{}/v1/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();

            return Err(status_error(&self.config.model, status.as_u16(), &body));
        }

        let bytes = response.bytes().await?;
        let text = String::from_utf8_lossy(&bytes);

        let mut acc = StreamAccumulator::default();
        for line in text.lines() {
            if !acc.feed_line(line, &delta_tx) {
                break;
            }
        }

        let msg = acc.finish(&self.config.model);
        debug!(
            backend = %self.config.model,
            calls = msg.has_capability_calls(),
            "completion received"
        );
        Ok(msg)
    }
}
