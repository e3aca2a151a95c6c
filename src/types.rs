use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Message Types ──────────────────────────────────────────────────────────

/// Role in a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A content block within a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    CapabilityCall {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
    CapabilityResult {
        call_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

impl ContentBlock {
    pub fn text(s: impl Into<String>) -> Self {
        ContentBlock::Text { text: s.into() }
    }

    pub fn capability_call(
        id: impl Into<String>,
        name: impl Into<String>,
        args: serde_json::Value,
    ) -> Self {
        ContentBlock::CapabilityCall {
            id: id.into(),
            name: name.into(),
            arguments: args,
        }
    }

    pub fn capability_result(
        call_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        ContentBlock::CapabilityResult {
            call_id: call_id.into(),
            content: content.into(),
            is_error,
        }
    }
}

/// A message in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: Vec<ContentBlock>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl Message {
    pub fn new(role: Role, content: Vec<ContentBlock>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            timestamp: Utc::now(),
            model: None,
            usage: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentBlock::text(text)])
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![ContentBlock::text(text)])
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![ContentBlock::text(text)])
    }

    pub fn capability_result(
        call_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::new(
            Role::Tool,
            vec![ContentBlock::capability_result(call_id, content, is_error)],
        )
    }

    /// Check if this message requests any capability invocations
    pub fn has_capability_calls(&self) -> bool {
        self.content
            .iter()
            .any(|c| matches!(c, ContentBlock::CapabilityCall { .. }))
    }

    /// Get text content concatenated
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

// ─── Token Usage ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

impl TokenUsage {
    pub fn new(input: usize, output: usize) -> Self {
        Self {
            input_tokens: input,
            output_tokens: output,
        }
    }

    pub fn total(&self) -> usize {
        self.input_tokens + self.output_tokens
    }
}

// ─── Streaming Deltas ────────────────────────────────────────────────────────

/// Delta updates produced by a backend while streaming
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamDelta {
    TextDelta {
        text: String,
    },
    CapabilityCallDelta {
        id: String,
        name: String,
        arguments_delta: String,
    },
}

// ─── Reasoning Output ────────────────────────────────────────────────────────

/// One capability invocation requested by a reasoning backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityInvocation {
    pub call_id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

impl CapabilityInvocation {
    pub fn new(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            call_id: Uuid::new_v4().to_string(),
            name: name.into(),
            arguments,
        }
    }
}

/// The result of one stage invocation: free text plus any capability invocations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningOutput {
    pub text: String,
    #[serde(default)]
    pub invocations: Vec<CapabilityInvocation>,
}

impl ReasoningOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            invocations: Vec::new(),
        }
    }

    pub fn from_message(message: &Message) -> Self {
        let invocations = message
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::CapabilityCall {
                    id,
                    name,
                    arguments,
                } => Some(CapabilityInvocation {
                    call_id: id.clone(),
                    name: name.clone(),
                    arguments: arguments.clone(),
                }),
                _ => None,
            })
            .collect();
        Self {
            text: message.text_content(),
            invocations,
        }
    }

    /// Rebuild the assistant message so the output can be replayed as history.
    pub fn to_message(&self) -> Message {
        let mut content = Vec::new();
        if !self.text.is_empty() {
            content.push(ContentBlock::text(&self.text));
        }
        for inv in &self.invocations {
            content.push(ContentBlock::capability_call(
                &inv.call_id,
                &inv.name,
                inv.arguments.clone(),
            ));
        }
        Message::new(Role::Assistant, content)
    }

    pub fn has_invocations(&self) -> bool {
        !self.invocations.is_empty()
    }

    /// Identity of the output ignoring call ids, used to detect a stage repeating itself.
    pub fn fingerprint(&self) -> String {
        let calls: Vec<String> = self
            .invocations
            .iter()
            .map(|i| format!("{}({})", i.name, i.arguments))
            .collect();
        format!("{}|{}", self.text.trim(), calls.join(","))
    }
}

// ─── Stages ──────────────────────────────────────────────────────────────────

/// A reasoning step of the turn graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    /// Split topology: answers directly or hands off with a sentinel marker.
    Router,
    /// Split topology: executes a delegated instruction.
    Action,
    /// Single topology: reasons and acts in one stage.
    ReasonAct,
    Search,
}

impl Stage {
    /// Human-readable progress line for the client.
    pub fn status_text(&self) -> &'static str {
        match self {
            Stage::Router => "Thinking...",
            Stage::Action => "Working on it...",
            Stage::ReasonAct => "Thinking...",
            Stage::Search => "Searching the web...",
        }
    }
}

// ─── Turn Context ────────────────────────────────────────────────────────────

/// One prior user/assistant exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exchange {
    pub user: String,
    pub assistant: String,
}

impl Exchange {
    pub fn new(user: impl Into<String>, assistant: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            assistant: assistant.into(),
        }
    }
}

/// Immutable input of one conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnContext {
    pub user_id: String,
    pub utterance: String,
    /// Most recent last.
    #[serde(default)]
    pub history: Vec<Exchange>,
    #[serde(default)]
    pub profile: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_time: Option<DateTime<FixedOffset>>,
    /// Relevance order.
    #[serde(default)]
    pub memories: Vec<String>,
}

impl TurnContext {
    pub fn new(user_id: impl Into<String>, utterance: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            utterance: utterance.into(),
            history: Vec::new(),
            profile: String::new(),
            local_time: None,
            memories: Vec::new(),
        }
    }

    pub fn with_history(mut self, history: Vec<Exchange>) -> Self {
        self.history = history;
        self
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = profile.into();
        self
    }

    pub fn with_local_time(mut self, local_time: DateTime<FixedOffset>) -> Self {
        self.local_time = Some(local_time);
        self
    }

    pub fn with_memories(mut self, memories: Vec<String>) -> Self {
        self.memories = memories;
        self
    }

    /// Conversation as backend messages: the last `max_history` exchanges then the utterance.
    pub fn to_messages(&self, max_history: usize) -> Vec<Message> {
        let skip = self.history.len().saturating_sub(max_history);
        let mut messages = Vec::with_capacity((self.history.len() - skip) * 2 + 1);
        for exchange in self.history.iter().skip(skip) {
            messages.push(Message::user(&exchange.user));
            messages.push(Message::assistant(&exchange.assistant));
        }
        messages.push(Message::user(&self.utterance));
        messages
    }
}
