use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use serde_json::json;
use tokio::sync::mpsc;

use dex_core::capability::{CapabilityDescriptor, CapabilityRegistry};
use dex_core::config::{CriticalReminderPolicy, OrchestratorConfig, Topology};
use dex_core::error::{DexError, DexResult};
use dex_core::executor::{CapabilityExecutor, ExecutorRegistry};
use dex_core::orchestrator::{ContractViolation, TurnOrchestrator, TurnOutcome, SEARCH_DIRECTIVE};
use dex_core::persistence::{
    ConversationLog, InMemoryConversationLog, InMemoryFactStore, JsonlConversationLog,
    SummarizingFactExtractor,
};
use dex_core::prefetch::ContextSource;
use dex_core::provider::{BackendRegistry, ReasoningBackend, ReasoningRequest, SearchBackend};
use dex_core::stream::{to_json_line, ClientAction, EventSink, StreamEvent};
use dex_core::types::*;

// ─── Mock Backends ──────────────────────────────────────────────────────────

/// Replays queued replies in order and records every request.
struct ScriptedBackend {
    replies: Mutex<Vec<DexResult<Message>>>,
    requests: Mutex<Vec<ReasoningRequest>>,
    delay: Duration,
}

impl ScriptedBackend {
    fn new(replies: Vec<DexResult<Message>>) -> Arc<Self> {
        Self::with_delay(replies, Duration::ZERO)
    }

    fn with_delay(replies: Vec<DexResult<Message>>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies),
            requests: Mutex::new(Vec::new()),
            delay,
        })
    }

    fn requests(&self) -> Vec<ReasoningRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReasoningBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream(
        &self,
        request: &ReasoningRequest,
        delta_tx: mpsc::UnboundedSender<StreamDelta>,
    ) -> DexResult<Message> {
        self.requests.lock().unwrap().push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = {
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                return Err(DexError::Config("script exhausted".into()));
            }
            replies.remove(0)
        };
        if let Ok(msg) = &next {
            for block in &msg.content {
                if let ContentBlock::Text { text } = block {
                    let _ = delta_tx.send(StreamDelta::TextDelta { text: text.clone() });
                }
            }
        }
        next
    }
}

/// Hangs on the first call, answers on the second.
struct SlowOnceBackend {
    calls: AtomicUsize,
}

#[async_trait]
impl ReasoningBackend for SlowOnceBackend {
    fn name(&self) -> &str {
        "slow-once"
    }

    async fn stream(
        &self,
        _request: &ReasoningRequest,
        _delta_tx: mpsc::UnboundedSender<StreamDelta>,
    ) -> DexResult<Message> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_secs(600)).await;
        }
        Ok(Message::assistant("Back online."))
    }
}

struct RecordingSearch {
    answer: String,
    queries: Mutex<Vec<(String, String)>>,
}

impl RecordingSearch {
    fn new(answer: &str) -> Arc<Self> {
        Arc::new(Self {
            answer: answer.into(),
            queries: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl SearchBackend for RecordingSearch {
    fn name(&self) -> &str {
        "recording-search"
    }

    async fn search(&self, query: &str, directive: &str) -> DexResult<String> {
        self.queries
            .lock()
            .unwrap()
            .push((query.to_string(), directive.to_string()));
        Ok(self.answer.clone())
    }
}

// ─── Test Executor ──────────────────────────────────────────────────────────

#[derive(Default)]
struct RecordingExecutor {
    calls: Mutex<Vec<(String, serde_json::Value, String)>>,
}

impl RecordingExecutor {
    fn names(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|c| c.0.clone()).collect()
    }
}

#[async_trait]
impl CapabilityExecutor for RecordingExecutor {
    async fn execute(
        &self,
        descriptor: &CapabilityDescriptor,
        invocation: &CapabilityInvocation,
        user_id: &str,
    ) -> DexResult<String> {
        self.calls.lock().unwrap().push((
            descriptor.name.clone(),
            invocation.arguments.clone(),
            user_id.to_string(),
        ));
        Ok(json!({"status": "ok", "capability": descriptor.name}).to_string())
    }

    fn executor_name(&self) -> &str {
        "recording"
    }
}

// ─── Fixtures ───────────────────────────────────────────────────────────────

fn capabilities() -> Arc<CapabilityRegistry> {
    let object = |required: &[&str]| json!({"type": "object", "required": required});
    let mut r = CapabilityRegistry::new();
    r.register(CapabilityDescriptor::remote(
        "add_transaction",
        "Record an expense or income transaction with amount and payee",
        object(&["amount"]),
    ));
    r.register(CapabilityDescriptor::remote(
        "get_transactions",
        "List recent financial transactions",
        object(&[]),
    ));
    r.register(CapabilityDescriptor::remote(
        "create_task",
        "Create a task with a title and optional due date",
        object(&["title"]),
    ));
    r.register(CapabilityDescriptor::remote(
        "save_memory",
        "Save a note or memory, optionally critical with a due date and time",
        object(&["title", "content"]),
    ));
    r.register(CapabilityDescriptor::remote(
        "log_meal",
        "Log a meal with its calories",
        object(&["description"]),
    ));
    r.register(CapabilityDescriptor::remote(
        "get_health_dashboard",
        "Summary of water, sleep and nutrition for today",
        object(&[]),
    ));
    r.register(CapabilityDescriptor::remote(
        "transfer_to_search",
        "Search the web for real-time information such as news or weather",
        object(&[]),
    ));
    r.register(CapabilityDescriptor::local(
        "client_set_alarm",
        "Set an alarm on the phone",
        object(&["time"]),
    ));
    r.register(CapabilityDescriptor::local(
        "client_schedule_critical_memory",
        "Schedule the phone alarm for a critical reminder",
        object(&["title", "timestamp"]),
    ));
    Arc::new(r)
}

struct Harness {
    orchestrator: TurnOrchestrator,
    executor: Arc<RecordingExecutor>,
    log: Arc<InMemoryConversationLog>,
}

fn harness_with(
    config: OrchestratorConfig,
    reasoning: Arc<dyn ReasoningBackend>,
    search: Arc<dyn SearchBackend>,
) -> Harness {
    let mut backends = BackendRegistry::new();
    backends.register("router", reasoning.clone());
    backends.register("action", reasoning.clone());
    backends.register("reason_act", reasoning);
    backends.register_search("search", search);

    let executor = Arc::new(RecordingExecutor::default());
    let mut executors = ExecutorRegistry::new();
    executors.set_fallback(executor.clone());

    let log = Arc::new(InMemoryConversationLog::new());
    let orchestrator = TurnOrchestrator::new(
        config,
        Arc::new(backends),
        capabilities(),
        Arc::new(executors),
    )
    .unwrap()
    .with_log(log.clone());

    Harness {
        orchestrator,
        executor,
        log,
    }
}

fn harness(config: OrchestratorConfig, reasoning: Arc<dyn ReasoningBackend>) -> Harness {
    harness_with(config, reasoning, RecordingSearch::new("No results."))
}

fn single() -> OrchestratorConfig {
    OrchestratorConfig {
        topology: Topology::Single,
        ..OrchestratorConfig::default()
    }
}

fn calls(text: &str, calls: Vec<(&str, serde_json::Value)>) -> DexResult<Message> {
    let mut content = Vec::new();
    if !text.is_empty() {
        content.push(ContentBlock::text(text));
    }
    for (i, (name, args)) in calls.into_iter().enumerate() {
        content.push(ContentBlock::capability_call(format!("call_{i}"), name, args));
    }
    Ok(Message::new(Role::Assistant, content))
}

fn reply(text: &str) -> DexResult<Message> {
    Ok(Message::assistant(text))
}

fn evening_in_pune() -> DateTime<chrono::FixedOffset> {
    DateTime::parse_from_rfc3339("2026-10-18T18:30:00+05:30").unwrap()
}

async fn run(h: &Harness, ctx: TurnContext) -> (TurnOutcome, Vec<StreamEvent>) {
    let mut events: Vec<StreamEvent> = Vec::new();
    let outcome = h.orchestrator.run_to_sink(&ctx, &mut events).await;
    (outcome, events)
}

fn assert_single_terminal(events: &[StreamEvent]) {
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    assert!(events.last().unwrap().is_terminal());
}

// ─── Split Topology ─────────────────────────────────────────────────────────

#[tokio::test]
async fn conversational_reply_answers_directly() {
    let backend = ScriptedBackend::new(vec![reply("Hey! How can I help?")]);
    let h = harness(OrchestratorConfig::default(), backend.clone());

    let (outcome, events) = run(&h, TurnContext::new("u1", "hi")).await;

    assert_eq!(
        events,
        vec![
            StreamEvent::Status {
                message: "Thinking...".into()
            },
            StreamEvent::Response {
                text: "Hey! How can I help?".into()
            },
        ]
    );
    assert_eq!(outcome.hops, 1);
    assert!(h.executor.names().is_empty());
    assert_eq!(h.log.len(), 1);
}

#[tokio::test]
async fn finance_delegation_selects_with_keyword_expansion() {
    let backend = ScriptedBackend::new(vec![
        reply("||DELEGATE||: FINANCE SYS - Log an expense of 500 for groceries today"),
        calls(
            "",
            vec![("add_transaction", json!({"amount": 500, "payee": "groceries"}))],
        ),
        reply("Logged 500 for groceries."),
    ]);
    let h = harness(OrchestratorConfig::default(), backend.clone());

    let (outcome, events) = run(&h, TurnContext::new("u42", "spent 500 on groceries")).await;

    assert_single_terminal(&events);
    assert_eq!(outcome.hops, 3);
    assert_eq!(
        outcome.terminal,
        Some(dex_core::stream::TerminalOutput::reply("Logged 500 for groceries."))
    );

    let requests = backend.requests();
    let action = &requests[1];
    assert!(action.capabilities.contains("add_transaction"));
    assert!(action.capabilities.contains("transfer_to_search"));
    assert!(action.system.contains("Log an expense of 500 for groceries today"));

    let executed = h.executor.calls.lock().unwrap().clone();
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].0, "add_transaction");
    assert_eq!(executed[0].2, "u42");

    let statuses: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Status { message } => Some(message.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(statuses, vec!["Thinking...", "Working on it...", "Working on it..."]);
    assert!(events.iter().any(|e| matches!(
        e,
        StreamEvent::CapabilityEnd { name, is_error: false, .. } if name == "add_transaction"
    )));
}

#[tokio::test]
async fn router_search_marker_reaches_search_backend() {
    let backend = ScriptedBackend::new(vec![reply("||SEARCH||: pune weather today")]);
    let search = RecordingSearch::new("Light rain, 24°C. Source: https://www.weather.example/pune.");
    let h = harness_with(OrchestratorConfig::default(), backend, search.clone());

    let (_, events) = run(&h, TurnContext::new("u1", "will it rain in pune?")).await;

    assert_single_terminal(&events);
    assert_eq!(
        events.last(),
        Some(&StreamEvent::Response {
            text: "Light rain, 24°C. Source: [weather.example](https://www.weather.example/pune).".into()
        })
    );
    assert!(events.contains(&StreamEvent::Status {
        message: "Searching the web...".into()
    }));
    let queries = search.queries.lock().unwrap().clone();
    assert_eq!(queries, vec![("pune weather today".to_string(), SEARCH_DIRECTIVE.to_string())]);
}

// ─── Single Topology ────────────────────────────────────────────────────────

#[tokio::test]
async fn search_handoff_without_query_uses_utterance() {
    let backend = ScriptedBackend::new(vec![calls("", vec![("transfer_to_search", json!({}))])]);
    let search = RecordingSearch::new("See [Example](https://example.com) for details.");
    let h = harness_with(single(), backend, search.clone());

    let (_, events) = run(&h, TurnContext::new("u1", "latest rust release")).await;

    assert_eq!(
        events.last(),
        Some(&StreamEvent::Response {
            text: "See [Example](https://example.com) for details.".into()
        })
    );
    assert_eq!(search.queries.lock().unwrap()[0].0, "latest rust release");
    assert!(h.executor.names().is_empty());
}

#[tokio::test]
async fn local_only_invocation_becomes_client_action() {
    let backend = ScriptedBackend::new(vec![calls(
        "Alarm set for 7 AM.",
        vec![("client_set_alarm", json!({"time": "07:00"}))],
    )]);
    let h = harness(single(), backend.clone());

    let (outcome, events) = run(&h, TurnContext::new("u1", "wake me at 7")).await;

    assert_single_terminal(&events);
    assert_eq!(
        events.last(),
        Some(&StreamEvent::ClientAction {
            actions: vec![ClientAction::new("set_alarm", json!({"time": "07:00"}))],
            text: Some("Alarm set for 7 AM.".into()),
        })
    );
    assert_eq!(outcome.hops, 1);
    assert!(h.executor.names().is_empty());

    let logged = h.log.recent("u1", 10).await.unwrap();
    assert_eq!(logged[0].reply, "Alarm set for 7 AM. [actions: set_alarm]");
}

#[tokio::test]
async fn mixed_invocations_run_remote_and_defer_local() {
    let backend = ScriptedBackend::new(vec![
        calls(
            "",
            vec![
                ("client_set_alarm", json!({"time": "06:30"})),
                ("create_task", json!({"title": "Gym"})),
            ],
        ),
        reply("Task added and alarm set."),
    ]);
    let h = harness(single(), backend.clone());

    let (outcome, events) = run(&h, TurnContext::new("u1", "gym at 6:30, set an alarm")).await;

    assert_single_terminal(&events);
    assert_eq!(h.executor.names(), vec!["create_task"]);
    assert_eq!(
        outcome.terminal,
        Some(dex_core::stream::TerminalOutput::ClientAction {
            actions: vec![ClientAction::new("set_alarm", json!({"time": "06:30"}))],
            text: Some("Task added and alarm set.".into()),
        })
    );

    // Every invocation gets a result message before the next stage.
    let second = &backend.requests()[1];
    let results = second
        .messages
        .iter()
        .filter(|m| m.role == Role::Tool)
        .count();
    assert_eq!(results, 2);
    assert!(!events.iter().any(|e| matches!(
        e,
        StreamEvent::CapabilityStart { name, .. } if name == "client_set_alarm"
    )));
}

#[tokio::test]
async fn capability_payloads_are_truncated_for_display() {
    let long_title = "x".repeat(500);
    let backend = ScriptedBackend::new(vec![
        calls("", vec![("create_task", json!({"title": long_title}))]),
        reply("Done."),
    ]);
    let config = OrchestratorConfig {
        max_payload_chars: 40,
        ..single()
    };
    let h = harness(config, backend);

    let (_, events) = run(&h, TurnContext::new("u1", "add a long task")).await;

    let input = events
        .iter()
        .find_map(|e| match e {
            StreamEvent::CapabilityStart { input, .. } => Some(input.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(input.chars().count(), 43);
    assert!(input.ends_with("..."));
    // The executor still sees the full arguments.
    let executed = h.executor.calls.lock().unwrap().clone();
    assert_eq!(executed[0].1["title"].as_str().unwrap().len(), 500);
}

// ─── Critical Reminders ─────────────────────────────────────────────────────

fn critical_note() -> (&'static str, serde_json::Value) {
    (
        "save_memory",
        json!({
            "title": "Take BP pills",
            "content": "Take BP pills",
            "is_critical": true,
            "due_time": "21:00"
        }),
    )
}

fn critical_alarm(at: &str) -> (&'static str, serde_json::Value) {
    let ms = DateTime::parse_from_rfc3339(at).unwrap().timestamp_millis();
    (
        "client_schedule_critical_memory",
        json!({"title": "Take BP pills", "timestamp": ms}),
    )
}

#[tokio::test]
async fn critical_reminder_with_alarm_satisfies_contract() {
    let backend = ScriptedBackend::new(vec![
        calls(
            "",
            vec![critical_note(), critical_alarm("2026-10-18T20:30:00+05:30")],
        ),
        reply("I'll remind you at 9 PM."),
    ]);
    let h = harness(single(), backend);
    let ctx = TurnContext::new("u1", "remind me to take BP pills at 9 PM, it's critical")
        .with_local_time(evening_in_pune());

    let (outcome, events) = run(&h, ctx).await;

    assert_single_terminal(&events);
    assert!(outcome.contract_violations.is_empty());
    assert_eq!(h.executor.names(), vec!["save_memory"]);
    match outcome.terminal {
        Some(dex_core::stream::TerminalOutput::ClientAction { actions, text }) => {
            assert_eq!(actions[0].action, "schedule_critical_memory");
            assert_eq!(text.as_deref(), Some("I'll remind you at 9 PM."));
        }
        other => panic!("unexpected terminal {other:?}"),
    }
}

#[tokio::test]
async fn missing_alarm_is_flagged_without_reprompt() {
    let backend = ScriptedBackend::new(vec![calls("", vec![critical_note()]), reply("Saved.")]);
    let config = OrchestratorConfig {
        critical_policy: CriticalReminderPolicy::Flag,
        ..single()
    };
    let h = harness(config, backend.clone());
    let ctx = TurnContext::new("u1", "critical: pills at 9 PM").with_local_time(evening_in_pune());

    let (outcome, _) = run(&h, ctx).await;

    assert_eq!(backend.requests().len(), 2);
    assert_eq!(
        outcome.contract_violations,
        vec![ContractViolation::MissingAlarm {
            title: "Take BP pills".into()
        }]
    );
    assert_eq!(
        outcome.terminal,
        Some(dex_core::stream::TerminalOutput::reply("Saved."))
    );
}

#[tokio::test]
async fn missing_alarm_is_reprompted_once() {
    let backend = ScriptedBackend::new(vec![
        calls("", vec![critical_note()]),
        reply("Saved."),
        calls("", vec![critical_alarm("2026-10-18T21:00:00+05:30")]),
    ]);
    let h = harness(single(), backend.clone());
    let ctx = TurnContext::new("u1", "critical: pills at 9 PM").with_local_time(evening_in_pune());

    let (outcome, events) = run(&h, ctx).await;

    assert_single_terminal(&events);
    assert!(outcome.contract_violations.is_empty());
    let requests = backend.requests();
    assert_eq!(requests.len(), 3);
    let nudge = requests[2].messages.last().unwrap();
    assert_eq!(nudge.role, Role::User);
    assert!(nudge.text_content().contains("client_schedule_critical_memory"));
    assert_eq!(
        outcome.terminal,
        Some(dex_core::stream::TerminalOutput::ClientAction {
            actions: vec![ClientAction::new(
                "schedule_critical_memory",
                critical_alarm("2026-10-18T21:00:00+05:30").1
            )],
            text: Some("Saved.".into()),
        })
    );
}

#[tokio::test]
async fn ignored_reprompt_is_recorded_as_violation() {
    let backend = ScriptedBackend::new(vec![
        calls("", vec![critical_note()]),
        reply("Saved."),
        reply("All set."),
    ]);
    let h = harness(single(), backend.clone());
    let ctx = TurnContext::new("u1", "critical: pills at 9 PM").with_local_time(evening_in_pune());

    let (outcome, _) = run(&h, ctx).await;

    assert_eq!(backend.requests().len(), 3);
    assert_eq!(outcome.contract_violations.len(), 1);
    assert_eq!(
        outcome.terminal,
        Some(dex_core::stream::TerminalOutput::reply("All set."))
    );
}

// ─── Failures ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn transport_failure_is_retried_once() {
    let backend = ScriptedBackend::new(vec![
        Err(DexError::backend("scripted", "connection reset")),
        reply("Hello again."),
    ]);
    let h = harness(single(), backend.clone());

    let (outcome, events) = run(&h, TurnContext::new("u1", "hello")).await;

    assert_single_terminal(&events);
    assert!(!outcome.degraded);
    assert_eq!(backend.requests().len(), 2);
    assert_eq!(h.log.len(), 1);
    assert_eq!(
        events.last(),
        Some(&StreamEvent::Response {
            text: "Hello again.".into()
        })
    );
}

#[tokio::test]
async fn second_failure_degrades_to_fallback_reply() {
    let backend = ScriptedBackend::new(vec![
        Err(DexError::backend("scripted", "connection reset")),
        Err(DexError::RateLimited {
            backend: "scripted".into(),
            retry_after_ms: 1000,
        }),
    ]);
    let h = harness(single(), backend.clone());

    let (outcome, events) = run(&h, TurnContext::new("u1", "hello")).await;

    assert_single_terminal(&events);
    assert!(outcome.degraded);
    assert_eq!(
        events.last(),
        Some(&StreamEvent::Response {
            text: OrchestratorConfig::default().fallback_reply
        })
    );
    // A degraded turn is still a completed turn.
    assert_eq!(h.log.len(), 1);
}

#[tokio::test]
async fn backend_failure_keeps_deferred_device_actions() {
    let backend = ScriptedBackend::new(vec![
        calls(
            "",
            vec![
                ("client_set_alarm", json!({"time": "06:30"})),
                ("create_task", json!({"title": "Gym"})),
            ],
        ),
        Err(DexError::backend("scripted", "connection reset")),
        Err(DexError::backend("scripted", "connection reset")),
    ]);
    let h = harness(single(), backend.clone());

    let (outcome, events) = run(&h, TurnContext::new("u1", "gym at 6:30, set an alarm")).await;

    assert_single_terminal(&events);
    assert!(outcome.degraded);
    assert_eq!(h.executor.names(), vec!["create_task"]);
    assert_eq!(
        events.last(),
        Some(&StreamEvent::ClientAction {
            actions: vec![ClientAction::new("set_alarm", json!({"time": "06:30"}))],
            text: Some(OrchestratorConfig::default().fallback_reply),
        })
    );
    assert_eq!(h.log.len(), 1);
}

#[tokio::test]
async fn out_of_range_alarm_timestamp_still_finishes_turn() {
    let backend = ScriptedBackend::new(vec![
        calls(
            "",
            vec![
                critical_note(),
                (
                    "client_schedule_critical_memory",
                    json!({"title": "Take BP pills", "timestamp": i64::MIN}),
                ),
            ],
        ),
        reply("Reminder saved."),
    ]);
    let h = harness(single(), backend);
    let ctx = TurnContext::new("u1", "critical: pills at 9 PM").with_local_time(evening_in_pune());

    let (outcome, events) = run(&h, ctx).await;

    assert_single_terminal(&events);
    assert!(outcome.terminal.is_some());
    assert!(matches!(
        &outcome.contract_violations[..],
        [ContractViolation::AlarmOutsideWindow { .. }]
    ));
}

#[tokio::test(start_paused = true)]
async fn hung_backend_times_out_and_retries() {
    let backend = Arc::new(SlowOnceBackend {
        calls: AtomicUsize::new(0),
    });
    let config = OrchestratorConfig {
        backend_timeout_ms: 1_000,
        ..single()
    };
    let h = harness(config, backend.clone());

    let (outcome, events) = run(&h, TurnContext::new("u1", "ping")).await;

    assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    assert!(!outcome.degraded);
    assert_eq!(
        events.last(),
        Some(&StreamEvent::Response {
            text: "Back online.".into()
        })
    );
}

#[tokio::test]
async fn capability_failure_is_fed_back_not_fatal() {
    let backend = ScriptedBackend::new(vec![
        calls("", vec![("add_transaction", json!({"payee": "cafe"}))]),
        reply("I need the amount to log that."),
    ]);
    let h = harness(single(), backend.clone());

    let (outcome, events) = run(&h, TurnContext::new("u1", "log coffee")).await;

    assert!(h.executor.names().is_empty());
    assert!(!outcome.degraded);
    assert!(events.iter().any(|e| matches!(
        e,
        StreamEvent::CapabilityEnd { is_error: true, output, .. } if output.contains("amount")
    )));
    assert_eq!(
        events.last(),
        Some(&StreamEvent::Response {
            text: "I need the amount to log that.".into()
        })
    );
}

/// Accepts the first event, then reports the transport as gone.
struct DroppingSink {
    accepted: usize,
}

impl EventSink for DroppingSink {
    fn emit(&mut self, _event: StreamEvent) -> bool {
        if self.accepted == 0 {
            self.accepted += 1;
            true
        } else {
            false
        }
    }
}

#[tokio::test(start_paused = true)]
async fn disconnect_stops_turn_without_logging() {
    let backend = ScriptedBackend::with_delay(
        vec![
            reply("||DELEGATE||: TASK SYS - add milk to groceries list"),
            calls("", vec![("create_task", json!({"title": "milk"}))]),
            reply("Added."),
        ],
        Duration::from_millis(50),
    );
    let h = harness(OrchestratorConfig::default(), backend.clone());

    let mut sink = DroppingSink { accepted: 0 };
    let outcome = h
        .orchestrator
        .run_to_sink(&TurnContext::new("u1", "add milk"), &mut sink)
        .await;

    assert!(outcome.disconnected);
    assert!(outcome.terminal.is_none());
    assert!(h.log.is_empty());
    assert!(h.executor.names().is_empty());
    assert!(backend.requests().len() <= 2);
}

// ─── Persistence and Context ────────────────────────────────────────────────

#[tokio::test]
async fn completed_turns_append_to_jsonl_and_extract_facts() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(JsonlConversationLog::new(dir.path()));
    let facts = Arc::new(InMemoryFactStore::new());
    let summarizer = ScriptedBackend::new(vec![reply("\"User is vegetarian.\"")]);

    let backend = ScriptedBackend::new(vec![reply("Noted, no meat then.")]);
    let mut backends = BackendRegistry::new();
    backends.register("reason_act", backend);
    backends.register_search("search", RecordingSearch::new("none"));
    let orchestrator = TurnOrchestrator::new(
        single(),
        Arc::new(backends),
        capabilities(),
        Arc::new(ExecutorRegistry::new()),
    )
    .unwrap()
    .with_log(log.clone())
    .with_fact_extractor(Arc::new(SummarizingFactExtractor::new(
        summarizer,
        facts.clone(),
    )));

    let mut events: Vec<StreamEvent> = Vec::new();
    orchestrator
        .run_to_sink(&TurnContext::new("u7", "I'm vegetarian"), &mut events)
        .await;

    let records = log.recent("u7", 10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].utterance, "I'm vegetarian");
    assert_eq!(records[0].reply, "Noted, no meat then.");

    for _ in 0..50 {
        if !facts.facts_for("u7").is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(facts.facts_for("u7"), vec!["User is vegetarian."]);
}

struct TodaysTasks;

#[async_trait]
impl ContextSource for TodaysTasks {
    fn name(&self) -> &str {
        "todays-tasks"
    }

    async fn fetch(&self, ctx: &TurnContext) -> DexResult<Option<String>> {
        Ok(Some(format!("Tasks due today for {}: Pay rent", ctx.user_id)))
    }
}

#[tokio::test]
async fn prefetched_context_reaches_first_stage() {
    let backend = ScriptedBackend::new(vec![reply("You still need to pay rent.")]);
    let h = harness(OrchestratorConfig::default(), backend.clone());
    let orchestrator = h.orchestrator.with_context_source(Arc::new(TodaysTasks));

    let ctx = TurnContext::new("u1", "anything left today?")
        .with_history(vec![Exchange::new("hi", "Hello!")])
        .with_profile("Lives in Pune");
    let mut events: Vec<StreamEvent> = Vec::new();
    orchestrator.run_to_sink(&ctx, &mut events).await;

    let first = &backend.requests()[0];
    assert!(first.system.contains("Tasks due today for u1: Pay rent"));
    assert!(first.system.contains("User Profile: Lives in Pune"));
    assert_eq!(first.messages.len(), 3);
}

#[tokio::test]
async fn wire_events_serialize_as_json_lines() {
    let backend = ScriptedBackend::new(vec![calls(
        "",
        vec![("client_set_alarm", json!({"time": "07:00"}))],
    )]);
    let h = harness(single(), backend);

    let (_, events) = run(&h, TurnContext::new("u1", "alarm at 7")).await;
    let lines: Vec<String> = events.iter().map(|e| to_json_line(e).unwrap()).collect();

    assert_eq!(lines[0], r#"{"type":"status","message":"Thinking..."}"#);
    assert_eq!(
        lines[1],
        r#"{"type":"client-action","actions":[{"action":"set_alarm","arguments":{"time":"07:00"}}]}"#
    );
}
