//! # dex-core
//!
//! Conversation turn orchestration for a personal-assistant backend. One user
//! utterance goes in; a stream of progress events and exactly one terminal reply
//! or client action comes out.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dex_core::capability::{CapabilityDescriptor, CapabilityRegistry};
//! use dex_core::config::OrchestratorConfig;
//! use dex_core::executor::{ExecutorRegistry, HttpExecutor};
//! use dex_core::orchestrator::TurnOrchestrator;
//! use dex_core::provider::{BackendRegistry, OpenAiCompatBackend, OpenAiCompatConfig, ReasoningSearch};
//! use dex_core::stream::StreamEvent;
//! use dex_core::types::TurnContext;
//!
//! # async fn run() -> dex_core::error::DexResult<()> {
//! let mut capabilities = CapabilityRegistry::new();
//! capabilities.register(CapabilityDescriptor::remote(
//!     "add_transaction",
//!     "Record an expense or income",
//!     serde_json::json!({"type": "object", "required": ["amount"]}),
//! ));
//!
//! let llm = |model: &str| {
//!     Arc::new(OpenAiCompatBackend::new(OpenAiCompatConfig::new(
//!         "https://api.openai.com/v1",
//!         "sk-...",
//!         model,
//!     )))
//! };
//! let mut backends = BackendRegistry::new();
//! backends.register("router", llm("gpt-4o-mini"));
//! backends.register("action", llm("gpt-4o"));
//! backends.register_search("search", Arc::new(ReasoningSearch::new(llm("gpt-4o-search-preview"))));
//!
//! let mut executors = ExecutorRegistry::new();
//! executors.set_fallback(Arc::new(HttpExecutor::new("http://localhost:8080")));
//!
//! let orchestrator = TurnOrchestrator::new(
//!     OrchestratorConfig::default(),
//!     Arc::new(backends),
//!     Arc::new(capabilities),
//!     Arc::new(executors),
//! )?;
//!
//! let mut events: Vec<StreamEvent> = Vec::new();
//! let outcome = orchestrator
//!     .run_to_sink(&TurnContext::new("u1", "spent 500 on groceries"), &mut events)
//!     .await;
//! # let _ = outcome;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`types`] | Messages, reasoning outputs, stages and the per-turn context |
//! | [`capability`] | Capability registry, semantic index and per-stage selection with injection rules |
//! | [`delegation`] | `||DELEGATE||:` / `||SEARCH||:` marker parsing and keyword expansion |
//! | [`provider`] | Reasoning and search backends, OpenAI-compatible SSE streaming |
//! | [`executor`] | Server-side capability execution over HTTP or closures |
//! | [`orchestrator`] | The turn state machine, routing and the critical-reminder check |
//! | [`stream`] | Translation of internal events into the external event stream |
//! | [`persistence`] | Conversation log and background fact extraction |
//! | [`prefetch`] | Concurrent context gathering before the first stage |
//! | [`config`] | Orchestrator configuration |
//! | [`error`] | Error types with thiserror |

pub mod capability;
pub mod config;
pub mod delegation;
pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod persistence;
pub mod prefetch;
pub mod provider;
pub mod stream;
pub mod types;

pub use error::{DexError, DexResult};
pub use orchestrator::{TurnOrchestrator, TurnOutcome};
pub use types::*;
