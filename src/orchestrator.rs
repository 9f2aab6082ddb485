//! The orchestration loop.
//!
//! What this module provides
//! - `Orchestrator`, a `tower::Service<HandleMessage>` that carries one
//!   user message through classification, routing, agent invocation,
//!   handoff processing, and persistence
//! - `OrchestratorBuilder` for assembly
//!
//! Implementation strategy
//! - One async `handle` per turn, entered under a per-session lock so
//!   concurrent turns for the same session serialize; turns for different
//!   sessions proceed independently
//! - Every failure mode short of a persistence double-fault degrades to an
//!   answer: unresolvable agents fall back, timeouts fall back, a missing
//!   classifier keeps the current agent. The only hard error a caller sees
//!   is `SessionStoreWriteFailure` after the save retry also fails
//! - The handoff loop is bounded by `max_handoffs` counted over the whole
//!   session chain, not per turn
//!
//! Testing strategy
//! - End-to-end scenarios live in `tests/orchestrator_scenarios.rs` with
//!   `tower::service_fn` fakes for agents and classifier

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tower::{BoxError, Service};
use tracing::{debug, error, info, instrument, warn};

use crate::agent::{
    agent_fn, invoke_with_deadline, AgentInvocation, AgentOutput, AgentReply, AgentSvc,
};
use crate::breaker::CircuitBreaker;
use crate::classify::{decide_route, passes_gate, Classification, ClassifierAdapter, SwitchReason};
use crate::config::OrchestratorConfig;
use crate::enrich::ContextEnricher;
use crate::error::{OrchestratorError, Result};
use crate::events::{emit, tracing_sink, EventSink, HopEvent, HopOutcome};
use crate::registry::AgentRegistry;
use crate::session::{Session, SessionId};
use crate::store::{InMemorySessionStore, SessionLockMap, SessionStoreHandle};

/// One user turn.
#[derive(Debug, Clone)]
pub struct HandleMessage {
    pub session_id: SessionId,
    pub message: String,
    /// Pre-computed classification. When absent and a classifier is
    /// configured, the orchestrator classifies the message itself.
    pub classification: Option<Classification>,
    /// Explicit agent choice; bypasses the routing gate.
    pub forced_agent: Option<String>,
}

impl HandleMessage {
    pub fn new(session_id: impl Into<SessionId>, message: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            message: message.into(),
            classification: None,
            forced_agent: None,
        }
    }

    pub fn with_classification(mut self, cls: Classification) -> Self {
        self.classification = Some(cls);
        self
    }

    pub fn with_forced_agent(mut self, agent: impl Into<String>) -> Self {
        self.forced_agent = Some(agent.into());
        self
    }
}

/// Result of one turn: the answer plus the persisted session snapshot.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub output: AgentOutput,
    pub session: Session,
}

/// The orchestrator service. Cheap to clone: the registry and handles box
/// their services, and the breaker and lock map are shared behind `Arc`s.
/// Lock map entries live only while a turn holds them.
#[derive(Clone)]
pub struct Orchestrator {
    registry: AgentRegistry,
    fallback: AgentSvc,
    store: SessionStoreHandle,
    breaker: Arc<CircuitBreaker>,
    enricher: ContextEnricher,
    sink: EventSink,
    classifier: Option<ClassifierAdapter>,
    cfg: OrchestratorConfig,
    locks: SessionLockMap,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Archive a session at conversation end. Idempotent; a missing session
    /// is a no-op.
    pub async fn archive_session(&mut self, session_id: SessionId) -> Result<()> {
        let lock = self.locks.acquire(&session_id);
        let _guard = lock.lock().await;
        self.store
            .archive(session_id)
            .await
            .map_err(|e| OrchestratorError::SessionStoreWriteFailure(e.to_string()))
    }

    /// Process one user turn end to end.
    #[instrument(skip_all, fields(session_id = %req.session_id))]
    async fn handle(mut self, req: HandleMessage) -> Result<TurnOutcome> {
        if req.session_id.as_str().is_empty() {
            return Err(OrchestratorError::Other(
                "empty session_id".to_string(),
            ));
        }

        let lock = self.locks.acquire(&req.session_id);
        let _guard = lock.lock().await;

        let mut session = match self.store.load(req.session_id.clone()).await {
            Ok(Some(s)) => s,
            Ok(None) => Session::new(req.session_id.clone()),
            Err(e) => {
                error!(error = %e, "session load failed; starting fresh");
                Session::new(req.session_id.clone())
            }
        };

        // Breaker open: automatic routing is suspended. The session's
        // current agent (or the fallback) still answers, and the chain is
        // left untouched.
        if !self.breaker.is_routing_allowed() {
            info!("circuit breaker open; routing suspended for this turn");
            return self.handle_pinned(req, session).await;
        }

        let classification = match req.classification.clone() {
            Some(cls) => Some(cls),
            None => match &mut self.classifier {
                Some(adapter) => adapter.classify(&req.message).await,
                None => None,
            },
        };

        // Work out where this turn should go before folding the fresh
        // classification into the session record.
        let (target, reason) = self.routing_target(&session, &req, classification.as_ref()).await;

        if let Some(cls) = &classification {
            session.domain = Some(cls.domain.clone());
            session.last_confidence = Some(cls.confidence);
        }

        if let Some(target) = target {
            self.apply_switch(&mut session, &target, reason).await;
        }

        // Invocation loop: follow handoff declarations until an agent
        // answers without one, or a bound trips.
        let mut last_output: Option<AgentOutput> = None;
        let mut turn_failed = false;
        loop {
            let Some(current) = session.current_agent.clone() else {
                break;
            };
            let Some((_, mut svc)) = self.registry.resolve_svc(&current) else {
                warn!(agent = %current, "current agent not registered; falling back");
                self.emit_event(&req.session_id, &current, HopOutcome::NotFound, Instant::now())
                    .await;
                break;
            };

            let invocation = AgentInvocation {
                session_id: req.session_id.clone(),
                agent: current.clone(),
                message: req.message.clone(),
                context: session.context.clone(),
            };
            let started = Instant::now();
            match invoke_with_deadline(&mut svc, invocation, self.cfg.agent_timeout).await {
                Ok(reply) => {
                    self.emit_event(&req.session_id, &current, HopOutcome::Success, started)
                        .await;
                    last_output = Some(reply.output);
                    let Some(decl) = reply.handoff else { break };

                    if decl.to_agent == current {
                        warn!(agent = %current, "self-handoff rejected");
                        self.emit_event(
                            &req.session_id,
                            &current,
                            HopOutcome::LoopRejected,
                            started,
                        )
                        .await;
                        break;
                    }
                    if self.registry.resolve(&decl.to_agent).is_none() {
                        warn!(
                            from = %current,
                            to = %decl.to_agent,
                            "handoff target not registered; keeping current agent's reply"
                        );
                        self.emit_event(
                            &req.session_id,
                            &decl.to_agent,
                            HopOutcome::NotFound,
                            started,
                        )
                        .await;
                        break;
                    }
                    if session.handoff_chain.len() + 1 > self.cfg.max_handoffs {
                        error!(
                            chain = ?session.handoff_chain,
                            rejected = %decl.to_agent,
                            max = self.cfg.max_handoffs,
                            "handoff chain limit reached; rejecting declaration"
                        );
                        self.emit_event(
                            &req.session_id,
                            &decl.to_agent,
                            HopOutcome::MaxHandoffs,
                            started,
                        )
                        .await;
                        break;
                    }

                    self.enricher.merge(&mut session.context, &decl.payload);
                    debug!(from = %current, to = %decl.to_agent, reason = ?decl.reason, "handoff accepted");
                    session.push_agent(decl.to_agent);
                }
                Err(e) => {
                    let outcome = match &e {
                        OrchestratorError::AgentInvocationTimeout { .. } => HopOutcome::Timeout,
                        _ => HopOutcome::Error,
                    };
                    warn!(agent = %current, error = %e, "agent invocation failed");
                    self.emit_event(&req.session_id, &current, outcome, started).await;
                    if e.is_breaker_failure() {
                        self.breaker.record_failure();
                        turn_failed = true;
                    }
                    break;
                }
            }
        }

        let output = match last_output {
            Some(out) => out,
            None => self.invoke_fallback(&req, &session).await,
        };

        if !turn_failed {
            self.breaker.record_success();
        }

        session.touch();
        self.persist(session.clone()).await?;
        Ok(TurnOutcome { output, session })
    }

    /// Turn handling while the breaker is open: no classification, no
    /// routing, no chain mutation, no breaker bookkeeping.
    async fn handle_pinned(
        mut self,
        req: HandleMessage,
        mut session: Session,
    ) -> Result<TurnOutcome> {
        let output = match session
            .current_agent
            .clone()
            .and_then(|name| self.registry.resolve_svc(&name))
        {
            Some((descriptor, mut svc)) => {
                let invocation = AgentInvocation {
                    session_id: req.session_id.clone(),
                    agent: descriptor.name.clone(),
                    message: req.message.clone(),
                    context: session.context.clone(),
                };
                let started = Instant::now();
                match invoke_with_deadline(&mut svc, invocation, self.cfg.agent_timeout).await {
                    Ok(reply) => {
                        if reply.handoff.is_some() {
                            debug!(agent = %descriptor.name, "ignoring handoff declaration while breaker is open");
                        }
                        self.emit_event(
                            &req.session_id,
                            &descriptor.name,
                            HopOutcome::Success,
                            started,
                        )
                        .await;
                        reply.output
                    }
                    Err(e) => {
                        warn!(agent = %descriptor.name, error = %e, "pinned agent failed; falling back");
                        let outcome = match &e {
                            OrchestratorError::AgentInvocationTimeout { .. } => HopOutcome::Timeout,
                            _ => HopOutcome::Error,
                        };
                        self.emit_event(&req.session_id, &descriptor.name, outcome, started)
                            .await;
                        self.invoke_fallback(&req, &session).await
                    }
                }
            }
            None => self.invoke_fallback(&req, &session).await,
        };

        session.touch();
        self.persist(session.clone()).await?;
        Ok(TurnOutcome { output, session })
    }

    /// Resolve the routing target for this turn, if any.
    async fn routing_target(
        &mut self,
        session: &Session,
        req: &HandleMessage,
        classification: Option<&Classification>,
    ) -> (Option<String>, SwitchReason) {
        if let Some(forced) = &req.forced_agent {
            if self.registry.resolve(forced).is_none() {
                warn!(agent = %forced, "forced agent not registered; ignoring override");
                self.emit_event(&req.session_id, forced, HopOutcome::NotFound, Instant::now())
                    .await;
                return (None, SwitchReason::None);
            }
            if session.current_agent.as_deref() == Some(forced.as_str()) {
                return (None, SwitchReason::None);
            }
            return (Some(forced.clone()), SwitchReason::UserOverride);
        }

        let Some(cls) = classification else {
            return (None, SwitchReason::None);
        };
        if !passes_gate(cls, &self.cfg) {
            debug!(
                domain = %cls.domain,
                confidence = cls.confidence,
                complexity = cls.complexity,
                "classification below routing gate"
            );
            return (None, SwitchReason::None);
        }
        let Some(descriptor) = self.registry.agent_for_domain(&cls.domain) else {
            warn!(domain = %cls.domain, "no agent serves classified domain; keeping current agent");
            return (None, SwitchReason::None);
        };
        let decision = decide_route(session, cls, descriptor.name.clone(), &self.cfg);
        if decision.should_route {
            (decision.target_agent, decision.switch_reason)
        } else {
            (None, SwitchReason::None)
        }
    }

    /// Mutate the session for an accepted switch, enriching context with a
    /// record of the transfer when one agent hands to another.
    async fn apply_switch(&mut self, session: &mut Session, target: &str, reason: SwitchReason) {
        if session.handoff_chain.len() + 1 > self.cfg.max_handoffs {
            warn!(
                chain = ?session.handoff_chain,
                target = %target,
                "chain limit reached; routing switch suppressed"
            );
            return;
        }
        if let Some(prev) = session.current_agent.clone() {
            let note: Value = json!({
                "handoff": {
                    "from": prev,
                    "reason": serde_json::to_value(reason).unwrap_or(Value::Null),
                }
            });
            self.enricher.merge(&mut session.context, &note);
        }
        info!(target = %target, reason = ?reason, "routing switch");
        session.last_switch_reason = Some(reason);
        session.push_agent(target);
    }

    /// The fallback always answers; if the configured fallback service
    /// itself fails, a canned reply is synthesized.
    async fn invoke_fallback(&mut self, req: &HandleMessage, session: &Session) -> AgentOutput {
        let invocation = AgentInvocation {
            session_id: req.session_id.clone(),
            agent: "fallback".to_string(),
            message: req.message.clone(),
            context: session.context.clone(),
        };
        let started = Instant::now();
        let mut svc = self.fallback.clone();
        let output = match invoke_with_deadline(&mut svc, invocation, self.cfg.agent_timeout).await
        {
            Ok(reply) => reply.output,
            Err(e) => {
                error!(error = %e, "fallback agent failed; synthesizing reply");
                AgentOutput {
                    agent: "fallback".to_string(),
                    content: "I can't reach a specialist right now, but I'm still here to help."
                        .to_string(),
                }
            }
        };
        self.emit_event(&req.session_id, &output.agent, HopOutcome::Fallback, started)
            .await;
        output
    }

    async fn emit_event(
        &mut self,
        session_id: &SessionId,
        agent: &str,
        outcome: HopOutcome,
        started: Instant,
    ) {
        let event = HopEvent::new(
            session_id.clone(),
            agent,
            outcome,
            started.elapsed(),
            self.breaker.current_state(),
        );
        emit(&mut self.sink, event).await;
    }

    /// Persist with one retry. A second failure is the turn's only hard
    /// error.
    async fn persist(&mut self, session: Session) -> Result<()> {
        let first = self.store.save(session.clone()).await;
        let Err(e) = first else { return Ok(()) };
        warn!(error = %e, "session save failed; retrying once");
        tokio::time::sleep(self.cfg.save_retry_backoff).await;
        self.store
            .save(session)
            .await
            .map_err(|e| OrchestratorError::SessionStoreWriteFailure(e.to_string()))
    }
}

impl Service<HandleMessage> for Orchestrator {
    type Response = TurnOutcome;
    type Error = BoxError;
    type Future = BoxFuture<'static, std::result::Result<TurnOutcome, BoxError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: HandleMessage) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { this.handle(req).await.map_err(Into::into) })
    }
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    registry: AgentRegistry,
    fallback: Option<AgentSvc>,
    store: Option<SessionStoreHandle>,
    breaker: Option<Arc<CircuitBreaker>>,
    sink: Option<EventSink>,
    classifier: Option<ClassifierAdapter>,
    cfg: OrchestratorConfig,
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            registry: AgentRegistry::new(),
            fallback: None,
            store: None,
            breaker: None,
            sink: None,
            classifier: None,
            cfg: OrchestratorConfig::default(),
        }
    }

    pub fn config(mut self, cfg: OrchestratorConfig) -> Self {
        self.cfg = cfg;
        self
    }

    pub fn agent(mut self, descriptor: crate::registry::AgentDescriptor, svc: AgentSvc) -> Self {
        self.registry.register(descriptor, svc);
        self
    }

    pub fn fallback(mut self, svc: AgentSvc) -> Self {
        self.fallback = Some(svc);
        self
    }

    pub fn store(mut self, store: SessionStoreHandle) -> Self {
        self.store = Some(store);
        self
    }

    pub fn breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn event_sink(mut self, sink: EventSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn classifier(mut self, classifier: ClassifierAdapter) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn build(self) -> Orchestrator {
        let breaker = self
            .breaker
            .unwrap_or_else(|| Arc::new(CircuitBreaker::new(self.cfg.breaker)));
        Orchestrator {
            registry: self.registry,
            fallback: self.fallback.unwrap_or_else(default_fallback),
            store: self
                .store
                .unwrap_or_else(|| InMemorySessionStore::new().handle()),
            breaker,
            enricher: ContextEnricher::new(self.cfg.context_caps),
            sink: self.sink.unwrap_or_else(tracing_sink),
            classifier: self.classifier,
            cfg: self.cfg,
            locks: SessionLockMap::new(),
        }
    }
}

fn default_fallback() -> AgentSvc {
    agent_fn(|inv: AgentInvocation| async move {
        Ok(AgentReply::message(
            inv.agent,
            "I couldn't route your request to a specialist, but I can still help generally.",
        ))
    })
}
