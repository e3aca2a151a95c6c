//! The conversation turn orchestrator.
//!
//! One call to [`TurnOrchestrator::run_turn`] drives a single utterance through the
//! reasoning graph:
//!
//! ```text
//! Reason ──plain text──────────────► Terminate(reply)
//!   │ ├──delegation marker──► Delegate ──► Reason (action stage)
//!   │ ├──search marker/handoff──► Search ──► Terminate(reply)
//!   │ ├──remote invocations──► ExecuteCapability ──► Reason (same stage)
//!   │ └──local invocations only──► Terminate(client-action)
//! ```
//!
//! Progress is emitted as [`TurnEvent`]s; exactly one `Finished` event closes a turn
//! unless the consumer went away first.

mod prompt;
mod reminder;
mod router;

pub use prompt::SEARCH_DIRECTIVE;
pub use reminder::{parse_clock, ContractViolation, ReminderTracker};
pub use router::{route, RouteContext, RoutingDecision};

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::capability::{CapabilityRegistry, CapabilitySelector, CapabilitySet};
use crate::config::{CriticalReminderPolicy, OrchestratorConfig, Topology};
use crate::delegation::DelegationParser;
use crate::error::{DexError, DexResult};
use crate::executor::ExecutorRegistry;
use crate::persistence::{ConversationLog, FactExtractor, TurnRecord};
use crate::prefetch::{prefetch, ContextSource};
use crate::provider::{BackendRegistry, ReasoningRequest};
use crate::stream::{self, linkify_bare_urls, EventSink, EventTranslator, TerminalOutput, TurnEvent};
use crate::types::*;

use prompt::{action_directive, missing_alarm_nudge, router_directive, DEFERRED_RESULT};

/// One identical retry for transport failures.
const MAX_ATTEMPTS: usize = 2;

/// What happened during one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    /// `None` only when the client disconnected.
    pub terminal: Option<TerminalOutput>,
    /// Reasoning stage invocations.
    pub hops: usize,
    pub contract_violations: Vec<ContractViolation>,
    /// A backend failed twice and the fallback reply was used.
    pub degraded: bool,
    pub disconnected: bool,
}

struct ActiveStage {
    stage: Stage,
    backend: String,
    system: String,
    capabilities: CapabilitySet,
    messages: Vec<Message>,
}

struct TurnState {
    hops: usize,
    seen: HashSet<(Stage, String)>,
    deferred: Vec<CapabilityInvocation>,
    tracker: ReminderTracker,
    reprompted: bool,
    last_text: String,
    degraded: bool,
}

enum Flow {
    Done(TerminalOutput),
    Disconnected,
}

pub struct TurnOrchestrator {
    config: OrchestratorConfig,
    backends: Arc<BackendRegistry>,
    selector: CapabilitySelector,
    executors: Arc<ExecutorRegistry>,
    parser: DelegationParser,
    log: Option<Arc<dyn ConversationLog>>,
    fact_extractor: Option<Arc<dyn FactExtractor>>,
    context_sources: Vec<Arc<dyn ContextSource>>,
}

impl TurnOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        backends: Arc<BackendRegistry>,
        registry: Arc<CapabilityRegistry>,
        executors: Arc<ExecutorRegistry>,
    ) -> DexResult<Self> {
        config.validate()?;
        config.check_backends(&backends)?;
        let selector = CapabilitySelector::new(registry, config.capability_names.clone());
        let parser = DelegationParser::new(config.subsystems.clone());
        Ok(Self {
            config,
            backends,
            selector,
            executors,
            parser,
            log: None,
            fact_extractor: None,
            context_sources: Vec::new(),
        })
    }

    pub fn with_log(mut self, log: Arc<dyn ConversationLog>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn with_fact_extractor(mut self, extractor: Arc<dyn FactExtractor>) -> Self {
        self.fact_extractor = Some(extractor);
        self
    }

    pub fn with_context_source(mut self, source: Arc<dyn ContextSource>) -> Self {
        self.context_sources.push(source);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn translator(&self) -> EventTranslator {
        EventTranslator::new(self.config.max_payload_chars)
    }

    /// Run a turn and translate its events into `sink` concurrently.
    pub async fn run_to_sink<S: EventSink>(&self, ctx: &TurnContext, sink: &mut S) -> TurnOutcome {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (outcome, emitted) = tokio::join!(
            self.run_turn(ctx, event_tx),
            stream::pump(event_rx, self.translator(), sink)
        );
        debug!(emitted, "turn events delivered");
        outcome
    }

    /// Run one turn. Never fails: errors resolve to a terminal reply.
    pub async fn run_turn(
        &self,
        ctx: &TurnContext,
        event_tx: mpsc::UnboundedSender<TurnEvent>,
    ) -> TurnOutcome {
        info!(user_id = %ctx.user_id, topology = ?self.config.topology, "turn started");

        let extra = prefetch(
            &self.context_sources,
            ctx,
            Duration::from_millis(self.config.prefetch_timeout_ms),
        )
        .await;
        let mut state = TurnState {
            hops: 0,
            seen: HashSet::new(),
            deferred: Vec::new(),
            tracker: ReminderTracker::new(
                &self.config.capability_names,
                self.config.alarm_lead_minutes,
                ctx.local_time,
            ),
            reprompted: false,
            last_text: String::new(),
            degraded: false,
        };

        let flow = self.drive(ctx, &extra, &mut state, &event_tx).await;

        let contract_violations = match self.config.critical_policy {
            CriticalReminderPolicy::Accept => Vec::new(),
            CriticalReminderPolicy::Reprompt | CriticalReminderPolicy::Flag => {
                state.tracker.violations()
            }
        };
        for violation in &contract_violations {
            warn!(user_id = %ctx.user_id, %violation, "critical reminder contract violated");
        }

        let terminal = match flow {
            Flow::Done(terminal) if !event_tx.is_closed() => terminal,
            _ => {
                info!(user_id = %ctx.user_id, hops = state.hops, "client disconnected, discarding turn");
                return TurnOutcome {
                    terminal: None,
                    hops: state.hops,
                    contract_violations,
                    degraded: state.degraded,
                    disconnected: true,
                };
            }
        };

        let _ = event_tx.send(TurnEvent::Finished(terminal.clone()));
        self.record(ctx, &terminal, state.degraded).await;

        info!(
            user_id = %ctx.user_id,
            hops = state.hops,
            degraded = state.degraded,
            violations = contract_violations.len(),
            "turn finished"
        );
        TurnOutcome {
            terminal: Some(terminal),
            hops: state.hops,
            contract_violations,
            degraded: state.degraded,
            disconnected: false,
        }
    }

    async fn drive(
        &self,
        ctx: &TurnContext,
        extra: &[String],
        state: &mut TurnState,
        event_tx: &mpsc::UnboundedSender<TurnEvent>,
    ) -> Flow {
        let mut active = self.initial_stage(ctx, extra);

        loop {
            if event_tx.is_closed() {
                return Flow::Disconnected;
            }
            if state.hops >= self.config.max_hops {
                warn!(hops = state.hops, "hop ceiling reached, terminating");
                return Flow::Done(self.finish(ctx, state, None));
            }
            state.hops += 1;
            let _ = event_tx.send(TurnEvent::StageStart {
                stage: active.stage,
            });

            let output = match self.reason(&active, event_tx).await {
                Ok(output) => output,
                Err(e) => {
                    warn!(stage = ?active.stage, error = %e, "reasoning backend failed");
                    state.degraded = true;
                    return Flow::Done(self.fallback(ctx, state));
                }
            };
            if event_tx.is_closed() {
                return Flow::Disconnected;
            }

            if !state.seen.insert((active.stage, output.fingerprint())) {
                warn!(stage = ?active.stage, "stage repeated an identical output, terminating");
                return Flow::Done(self.finish(ctx, state, None));
            }
            state.tracker.observe_all(&output.invocations);

            let decision = route(&output, &self.route_context(ctx));
            debug!(stage = ?active.stage, decision = decision.kind(), "routing decision");

            match decision {
                RoutingDecision::ExecuteRemote { remote, deferred } => {
                    remember_text(state, &output.text);
                    active.messages.push(output.to_message());
                    for invocation in &output.invocations {
                        let result = if remote.iter().any(|r| r.call_id == invocation.call_id) {
                            self.execute(invocation, ctx, event_tx).await
                        } else {
                            Message::capability_result(&invocation.call_id, DEFERRED_RESULT, false)
                        };
                        active.messages.push(result);
                        if event_tx.is_closed() {
                            return Flow::Disconnected;
                        }
                    }
                    state.deferred.extend(deferred);
                }
                RoutingDecision::ClientAction { local } => {
                    remember_text(state, &output.text);
                    state.deferred.extend(local);
                    if self.should_reprompt(state) {
                        active.messages.push(output.to_message());
                        for invocation in &output.invocations {
                            active.messages.push(Message::capability_result(
                                &invocation.call_id,
                                DEFERRED_RESULT,
                                false,
                            ));
                        }
                        self.nudge(&mut active, state);
                        continue;
                    }
                    return Flow::Done(self.finish(ctx, state, None));
                }
                RoutingDecision::Delegate {
                    target,
                    instruction,
                    expanded,
                } => {
                    info!(subsystem = %target, "delegating to action stage");
                    active = self.action_stage(ctx, extra, &instruction, &expanded);
                }
                RoutingDecision::Search { query } => {
                    let _ = event_tx.send(TurnEvent::StageStart {
                        stage: Stage::Search,
                    });
                    return match self.search(&query).await {
                        Ok(text) => Flow::Done(self.finish(ctx, state, Some(linkify_bare_urls(&text)))),
                        Err(e) => {
                            warn!(error = %e, "search backend failed");
                            state.degraded = true;
                            Flow::Done(self.fallback(ctx, state))
                        }
                    };
                }
                RoutingDecision::Terminate { text } => {
                    remember_text(state, &text);
                    if self.should_reprompt(state) {
                        active.messages.push(output.to_message());
                        self.nudge(&mut active, state);
                        continue;
                    }
                    return Flow::Done(self.finish(ctx, state, Some(text)));
                }
            }
        }
    }

    fn route_context<'a>(&'a self, ctx: &'a TurnContext) -> RouteContext<'a> {
        RouteContext {
            registry: self.selector.registry(),
            parser: &self.parser,
            search_handoff: &self.config.capability_names.search_handoff,
            local_prefix: &self.config.local_prefix,
            utterance: &ctx.utterance,
        }
    }

    fn initial_stage(&self, ctx: &TurnContext, extra: &[String]) -> ActiveStage {
        let messages = ctx.to_messages(self.config.max_history);
        match self.config.topology {
            Topology::Split => {
                // The router sees only the search handoff.
                let mut capabilities = CapabilitySet::new();
                if let Some(handoff) = self
                    .selector
                    .registry()
                    .lookup(&self.config.capability_names.search_handoff)
                {
                    capabilities.insert(handoff);
                }
                ActiveStage {
                    stage: Stage::Router,
                    backend: self.config.backends.router.clone(),
                    system: router_directive(ctx, &self.parser.subsystem_names(), extra),
                    capabilities,
                    messages,
                }
            }
            Topology::Single => ActiveStage {
                stage: Stage::ReasonAct,
                backend: self.config.backends.reason_act.clone(),
                system: action_directive(ctx, &self.config.capability_names, None, extra),
                capabilities: self
                    .selector
                    .select(&ctx.utterance, self.config.reason_act_k),
                messages,
            },
        }
    }

    fn action_stage(
        &self,
        ctx: &TurnContext,
        extra: &[String],
        instruction: &str,
        expanded: &str,
    ) -> ActiveStage {
        let backend = match self.config.topology {
            Topology::Split => self.config.backends.action.clone(),
            Topology::Single => self.config.backends.reason_act.clone(),
        };
        ActiveStage {
            stage: Stage::Action,
            backend,
            system: action_directive(
                ctx,
                &self.config.capability_names,
                Some(instruction),
                extra,
            ),
            capabilities: self.selector.select(expanded, self.config.action_k),
            messages: ctx.to_messages(self.config.max_history),
        }
    }

    fn should_reprompt(&self, state: &TurnState) -> bool {
        self.config.critical_policy == CriticalReminderPolicy::Reprompt
            && !state.reprompted
            && state.tracker.missing_alarms() > 0
    }

    fn nudge(&self, active: &mut ActiveStage, state: &mut TurnState) {
        let missing = state.tracker.missing_alarms();
        info!(missing, "critical reminder without alarm, re-prompting once");
        state.reprompted = true;
        active.messages.push(Message::user(missing_alarm_nudge(
            &self.config.capability_names,
            missing,
        )));
    }

    /// Terminal output from `text` (else the last stage text) plus any deferred actions.
    fn finish(&self, ctx: &TurnContext, state: &TurnState, text: Option<String>) -> TerminalOutput {
        let text = text
            .filter(|t| !t.trim().is_empty())
            .or_else(|| (!state.last_text.is_empty()).then(|| state.last_text.clone()));

        if state.deferred.is_empty() {
            return TerminalOutput::reply(text.unwrap_or_else(|| self.config.fallback_reply.clone()));
        }
        let cx = self.route_context(ctx);
        TerminalOutput::ClientAction {
            actions: state.deferred.iter().map(|i| cx.client_action(i)).collect(),
            text,
        }
    }

    /// Apology after a failed backend; device actions already requested still reach the client.
    fn fallback(&self, ctx: &TurnContext, state: &TurnState) -> TerminalOutput {
        self.finish(ctx, state, Some(self.config.fallback_reply.clone()))
    }

    async fn reason(
        &self,
        active: &ActiveStage,
        event_tx: &mpsc::UnboundedSender<TurnEvent>,
    ) -> DexResult<ReasoningOutput> {
        let backend = self.backends.get(&active.backend)?;
        let request = ReasoningRequest::new(active.messages.clone(), active.system.clone())
            .with_capabilities(active.capabilities.clone());
        let stage = active.stage;

        debug!(
            stage = ?stage,
            backend = backend.name(),
            capabilities = ?active.capabilities.names(),
            "invoking reasoning backend"
        );

        let message = self
            .with_retry(backend.name(), || {
                let backend = Arc::clone(&backend);
                let request = request.clone();
                let event_tx = event_tx.clone();
                async move {
                    let (delta_tx, mut delta_rx) = mpsc::unbounded_channel();
                    let delta_forwarder = tokio::spawn(async move {
                        while let Some(delta) = delta_rx.recv().await {
                            let _ = event_tx.send(TurnEvent::Delta { stage, delta });
                        }
                    });
                    let result = backend.stream(&request, delta_tx).await;
                    delta_forwarder.await.ok();
                    result
                }
            })
            .await?;
        Ok(ReasoningOutput::from_message(&message))
    }

    async fn search(&self, query: &str) -> DexResult<String> {
        let backend = self.backends.get_search(&self.config.backends.search)?;
        info!(query, backend = backend.name(), "routing to search");
        self.with_retry(backend.name(), || {
            let backend = Arc::clone(&backend);
            let query = query.to_string();
            async move { backend.search(&query, SEARCH_DIRECTIVE).await }
        })
        .await
    }

    /// Bounded wait per attempt; transport failures get one identical retry.
    async fn with_retry<T, F, Fut>(&self, label: &str, mut attempt_fn: F) -> DexResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DexResult<T>>,
    {
        let limit = Duration::from_millis(self.config.backend_timeout_ms);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(limit, attempt_fn()).await {
                Ok(result) => result,
                Err(_) => Err(DexError::Timeout {
                    backend: label.to_string(),
                    after_ms: self.config.backend_timeout_ms,
                }),
            };
            match result {
                Err(e) if e.is_transport() && attempt < MAX_ATTEMPTS => {
                    warn!(backend = label, attempt, error = %e, "transport failure, retrying");
                }
                other => return other,
            }
        }
    }

    /// Execute one remote invocation; failures become the result text.
    async fn execute(
        &self,
        invocation: &CapabilityInvocation,
        ctx: &TurnContext,
        event_tx: &mpsc::UnboundedSender<TurnEvent>,
    ) -> Message {
        let _ = event_tx.send(TurnEvent::CapabilityStart {
            call_id: invocation.call_id.clone(),
            name: invocation.name.clone(),
            arguments: invocation.arguments.clone(),
        });

        let (content, is_error) = match self.run_capability(invocation, &ctx.user_id).await {
            Ok(text) => (text, false),
            Err(e) => {
                warn!(capability = %invocation.name, error = %e, "capability failed");
                (format!("Error: {e}"), true)
            }
        };

        let _ = event_tx.send(TurnEvent::CapabilityEnd {
            call_id: invocation.call_id.clone(),
            name: invocation.name.clone(),
            output: content.clone(),
            is_error,
        });
        Message::capability_result(&invocation.call_id, content, is_error)
    }

    async fn run_capability(&self, invocation: &CapabilityInvocation, user_id: &str) -> DexResult<String> {
        let descriptor = self
            .selector
            .registry()
            .lookup(&invocation.name)
            .ok_or_else(|| DexError::UnknownCapability {
                name: invocation.name.clone(),
            })?;
        descriptor
            .validate_arguments(&invocation.arguments)
            .map_err(|message| DexError::CapabilityExecution {
                capability: invocation.name.clone(),
                message,
            })?;

        let limit = Duration::from_millis(self.config.capability_timeout_ms);
        match tokio::time::timeout(limit, self.executors.execute(&descriptor, invocation, user_id)).await {
            Ok(result) => result,
            Err(_) => Err(DexError::Timeout {
                backend: invocation.name.clone(),
                after_ms: self.config.capability_timeout_ms,
            }),
        }
    }

    /// Log the completed turn and hand it to fact extraction in the background.
    async fn record(&self, ctx: &TurnContext, terminal: &TerminalOutput, degraded: bool) {
        let record = TurnRecord::new(&ctx.user_id, &ctx.utterance, terminal.log_text());

        if let Some(log) = &self.log {
            if let Err(e) = log.append(&record).await {
                warn!(user_id = %ctx.user_id, error = %e, "failed to append conversation log");
            }
        }

        if degraded || !self.config.extract_facts {
            return;
        }
        if let Some(extractor) = &self.fact_extractor {
            let extractor = Arc::clone(extractor);
            tokio::spawn(async move {
                if let Err(e) = extractor.extract(&record).await {
                    warn!(user_id = %record.user_id, error = %e, "fact extraction failed");
                }
            });
        }
    }
}

fn remember_text(state: &mut TurnState, text: &str) {
    if !text.trim().is_empty() {
        state.last_text = text.to_string();
    }
}
