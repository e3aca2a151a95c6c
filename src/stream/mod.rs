//! Event stream translation.
//!
//! The orchestrator emits [`TurnEvent`]s on an unbounded channel while a turn runs.
//! [`EventTranslator`] turns them into the external [`StreamEvent`] sequence: progress
//! events in order followed by exactly one terminal `response` or `client-action`.

mod links;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::DexResult;
use crate::types::{Stage, StreamDelta};

pub use links::linkify_bare_urls;

/// A device action the client must perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientAction {
    /// Capability name with the local-site prefix stripped.
    pub action: String,
    pub arguments: serde_json::Value,
}

impl ClientAction {
    pub fn new(action: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            action: action.into(),
            arguments,
        }
    }
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TerminalOutput {
    Reply {
        text: String,
    },
    ClientAction {
        actions: Vec<ClientAction>,
        /// Reply text accompanying deferred actions.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
}

impl TerminalOutput {
    pub fn reply(text: impl Into<String>) -> Self {
        TerminalOutput::Reply { text: text.into() }
    }

    /// What the conversation log records as the assistant side of the exchange.
    pub fn log_text(&self) -> String {
        match self {
            TerminalOutput::Reply { text } => text.clone(),
            TerminalOutput::ClientAction { actions, text } => {
                let names: Vec<&str> = actions.iter().map(|a| a.action.as_str()).collect();
                match text {
                    Some(t) if !t.is_empty() => format!("{t} [actions: {}]", names.join(", ")),
                    _ => format!("[actions: {}]", names.join(", ")),
                }
            }
        }
    }
}

/// Internal execution events, in the order they happen.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    StageStart {
        stage: Stage,
    },
    Delta {
        stage: Stage,
        delta: StreamDelta,
    },
    CapabilityStart {
        call_id: String,
        name: String,
        arguments: serde_json::Value,
    },
    CapabilityEnd {
        call_id: String,
        name: String,
        output: String,
        is_error: bool,
    },
    Finished(TerminalOutput),
}

/// External wire event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    Status {
        message: String,
    },
    CapabilityStart {
        name: String,
        input: String,
    },
    CapabilityEnd {
        name: String,
        output: String,
        #[serde(default)]
        is_error: bool,
    },
    Response {
        text: String,
    },
    ClientAction {
        actions: Vec<ClientAction>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamEvent::Response { .. } | StreamEvent::ClientAction { .. }
        )
    }
}

/// One event as a single JSON line (no trailing newline).
pub fn to_json_line(event: &StreamEvent) -> DexResult<String> {
    Ok(serde_json::to_string(event)?)
}

/// Cut `text` to at most `max_chars` characters, marking the cut.
pub fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

/// Stateful translator from [`TurnEvent`] to [`StreamEvent`].
pub struct EventTranslator {
    max_payload_chars: usize,
    terminated: bool,
}

impl EventTranslator {
    pub fn new(max_payload_chars: usize) -> Self {
        Self {
            max_payload_chars,
            terminated: false,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// External event for `event`, if any. Nothing is produced after the terminal event.
    pub fn translate(&mut self, event: TurnEvent) -> Option<StreamEvent> {
        if self.terminated {
            debug!("dropping event after terminal");
            return None;
        }
        match event {
            TurnEvent::StageStart { stage } => Some(StreamEvent::Status {
                message: stage.status_text().to_string(),
            }),
            // Token deltas are not part of the wire protocol.
            TurnEvent::Delta { .. } => None,
            TurnEvent::CapabilityStart {
                name, arguments, ..
            } => Some(StreamEvent::CapabilityStart {
                name,
                input: truncate(&arguments.to_string(), self.max_payload_chars),
            }),
            TurnEvent::CapabilityEnd {
                name,
                output,
                is_error,
                ..
            } => Some(StreamEvent::CapabilityEnd {
                name,
                output: truncate(&output, self.max_payload_chars),
                is_error,
            }),
            TurnEvent::Finished(terminal) => {
                self.terminated = true;
                Some(match terminal {
                    TerminalOutput::Reply { text } => StreamEvent::Response { text },
                    TerminalOutput::ClientAction { actions, text } => {
                        StreamEvent::ClientAction { actions, text }
                    }
                })
            }
        }
    }
}

impl Default for EventTranslator {
    fn default() -> Self {
        Self::new(200)
    }
}

/// Destination of external events. `emit` returns false once the transport is gone.
pub trait EventSink: Send {
    fn emit(&mut self, event: StreamEvent) -> bool;
}

impl EventSink for mpsc::UnboundedSender<StreamEvent> {
    fn emit(&mut self, event: StreamEvent) -> bool {
        self.send(event).is_ok()
    }
}

impl EventSink for Vec<StreamEvent> {
    fn emit(&mut self, event: StreamEvent) -> bool {
        self.push(event);
        true
    }
}

/// Drive `rx` through `translator` into `sink` until the terminal event, the end of
/// the channel, or a closed sink. Returns the number of events emitted.
///
/// Dropping `rx` on a closed sink is how the orchestrator learns the client is gone.
pub async fn pump<S: EventSink>(
    mut rx: mpsc::UnboundedReceiver<TurnEvent>,
    mut translator: EventTranslator,
    sink: &mut S,
) -> usize {
    let mut emitted = 0;
    while let Some(event) = rx.recv().await {
        let Some(external) = translator.translate(event) else {
            continue;
        };
        if !sink.emit(external) {
            debug!("event sink closed, stopping translation");
            break;
        }
        emitted += 1;
        if translator.is_terminated() {
            break;
        }
    }
    emitted
}
