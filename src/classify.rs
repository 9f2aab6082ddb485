//! Message classification and routing decisions.
//!
//! What this module provides
//! - The `Classification` produced per user message and the pure decision
//!   logic that turns it into a routing outcome
//! - A classifier adapter that treats the classifier as best-effort: any
//!   error or deadline expiry degrades to "no classification" and the turn
//!   continues with the session's current agent
//!
//! Exports
//! - `Classification { domain, confidence, complexity }`
//! - `SwitchReason`, `RoutingDecision`
//! - `passes_gate`, `decide_route`
//! - `ClassifierAdapter` wrapping any `Service<String, Response = Classification>`
//!
//! Implementation strategy
//! - Decision logic is pure functions over the session snapshot and the
//!   classification, so every branch is unit-testable without a runtime
//! - The adapter owns its deadline; classifier unavailability is logged at
//!   warn and never surfaces as an error to the caller

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tower::util::BoxCloneService;
use tower::{BoxError, Service, ServiceExt};
use tracing::warn;

use crate::config::OrchestratorConfig;
use crate::session::Session;

/// Classifier verdict for one user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// Domain label, matched against agent capability tags.
    pub domain: String,
    /// Confidence in `[0.0, 1.0]`.
    pub confidence: f64,
    /// Complexity on a 1-10 scale.
    pub complexity: u8,
}

/// Why responsibility moved (or did not) on this turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchReason {
    /// No switch this turn.
    None,
    /// First routed agent of a fresh session.
    NewSession,
    /// Classification crossed the domain-switch margin.
    DomainSwitch,
    /// Caller forced the agent, bypassing the gate.
    UserOverride,
}

/// Outcome of the routing decision for one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingDecision {
    pub should_route: bool,
    pub target_agent: Option<String>,
    pub switch_reason: SwitchReason,
}

impl RoutingDecision {
    /// Keep the current agent; no routing action.
    pub fn stay() -> Self {
        Self {
            should_route: false,
            target_agent: None,
            switch_reason: SwitchReason::None,
        }
    }
}

/// The routing gate: both thresholds are strict (exactly-at-threshold does
/// not route).
pub fn passes_gate(cls: &Classification, cfg: &OrchestratorConfig) -> bool {
    cls.confidence > cfg.route_confidence && cls.complexity > cfg.route_complexity
}

/// Decide whether this turn switches agents. Assumes [`passes_gate`] has
/// already admitted the classification and `target_agent` resolves the
/// classified domain.
///
/// A session with no current agent always routes. A session already held by
/// the target stays put. An established session switches only when the new
/// confidence clears the absolute gate and exceeds the stored confidence by
/// more than the configured margin; anything weaker keeps the current agent
/// to avoid ping-ponging on ambiguous messages.
pub fn decide_route(
    session: &Session,
    cls: &Classification,
    target_agent: String,
    cfg: &OrchestratorConfig,
) -> RoutingDecision {
    match &session.current_agent {
        None => RoutingDecision {
            should_route: true,
            target_agent: Some(target_agent),
            switch_reason: SwitchReason::NewSession,
        },
        Some(current) if *current == target_agent => RoutingDecision::stay(),
        Some(_) => {
            let margin_cleared = cls.confidence - session.last_confidence.unwrap_or(0.0)
                > cfg.switch_margin;
            if cls.confidence > cfg.route_confidence && margin_cleared {
                RoutingDecision {
                    should_route: true,
                    target_agent: Some(target_agent),
                    switch_reason: SwitchReason::DomainSwitch,
                }
            } else {
                RoutingDecision::stay()
            }
        }
    }
}

/// Boxed classifier service type alias.
pub type ClassifierSvc = BoxCloneService<String, Classification, BoxError>;

/// Best-effort classifier front-end.
///
/// The orchestrator must never fail a turn because classification is slow
/// or down, so this adapter absorbs every failure mode into `None`.
#[derive(Clone)]
pub struct ClassifierAdapter {
    inner: ClassifierSvc,
    timeout: Duration,
}

impl ClassifierAdapter {
    pub fn new(inner: ClassifierSvc, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    /// Classify `message`, or `None` if the classifier errs or misses its
    /// deadline.
    pub async fn classify(&mut self, message: &str) -> Option<Classification> {
        let mut svc = self.inner.clone();
        let msg = message.to_string();
        match tokio::time::timeout(self.timeout, async {
            svc.ready().await?.call(msg).await
        })
        .await
        {
            Ok(Ok(cls)) => Some(cls),
            Ok(Err(e)) => {
                warn!(error = %e, "classifier failed; continuing without classification");
                None
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    "classifier missed its deadline; continuing without classification"
                );
                None
            }
        }
    }
}

/// Build a [`ClassifierSvc`] from an async closure.
pub fn classifier_fn<F, Fut>(f: F) -> ClassifierSvc
where
    F: Fn(String) -> Fut + Clone + Send + 'static,
    Fut: std::future::Future<Output = std::result::Result<Classification, BoxError>>
        + Send
        + 'static,
{
    BoxCloneService::new(tower::service_fn(f))
}
