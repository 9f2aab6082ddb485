//! Agent invocation modeling.
//!
//! Agents are opaque, named capability modules exposed to the orchestrator
//! as Tower services: `Service<AgentInvocation, Response = AgentReply>`.
//! A reply carries the agent's output plus at most one
//! [`HandoffDeclaration`], which the orchestrator consumes immediately;
//! only its effect (chain mutation and context merge) is ever persisted.
//!
//! Invocation is a plain call with an explicit deadline
//! ([`invoke_with_deadline`]) rather than an implicit event loop, which
//! keeps timeout and cancellation semantics testable.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower::util::BoxCloneService;
use tower::{BoxError, Service, ServiceExt};

use crate::error::{OrchestratorError, Result};
use crate::session::{ContextEntry, SessionId};

/// Uniform request passed to agent services.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub session_id: SessionId,
    /// Name under which the agent was resolved.
    pub agent: String,
    /// The user message for this turn.
    pub message: String,
    /// Enrichment context accumulated across prior handoffs, oldest first.
    pub context: Vec<ContextEntry>,
}

/// Output produced by an agent for one hop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutput {
    pub agent: String,
    pub content: String,
}

/// A declared transfer of conversational responsibility, emitted by an
/// active agent. Ephemeral: never persisted standalone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffDeclaration {
    pub from_agent: String,
    pub to_agent: String,
    /// Free-text justification, kept for audit only and never parsed.
    pub reason: Option<String>,
    /// Enrichment data to carry forward, size-limited on merge.
    pub payload: Value,
}

impl HandoffDeclaration {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from_agent: from.into(),
            to_agent: to.into(),
            reason: None,
            payload: Value::Null,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// One agent reply: output plus an optional handoff declaration.
#[derive(Debug, Clone)]
pub struct AgentReply {
    pub output: AgentOutput,
    pub handoff: Option<HandoffDeclaration>,
}

impl AgentReply {
    /// Reply with output only.
    pub fn message(agent: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            output: AgentOutput {
                agent: agent.into(),
                content: content.into(),
            },
            handoff: None,
        }
    }

    /// Reply that also declares a handoff.
    pub fn with_handoff(mut self, handoff: HandoffDeclaration) -> Self {
        self.handoff = Some(handoff);
        self
    }
}

/// Boxed agent service type alias.
pub type AgentSvc = BoxCloneService<AgentInvocation, AgentReply, BoxError>;

/// DX sugar: build an [`AgentSvc`] from an async closure.
pub fn agent_fn<F, Fut>(f: F) -> AgentSvc
where
    F: Fn(AgentInvocation) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = std::result::Result<AgentReply, BoxError>> + Send + 'static,
{
    BoxCloneService::new(tower::service_fn(f))
}

/// Invoke an agent service with a bounded deadline.
///
/// Deadline expiry cancels the in-flight call and maps to
/// [`OrchestratorError::AgentInvocationTimeout`]; any other agent error is
/// surfaced as [`OrchestratorError::Other`]. Caller cancellation propagates
/// by dropping the returned future.
pub async fn invoke_with_deadline(
    svc: &mut AgentSvc,
    invocation: AgentInvocation,
    deadline: Duration,
) -> Result<AgentReply> {
    let agent = invocation.agent.clone();
    match tokio::time::timeout(deadline, async {
        svc.ready().await?.call(invocation).await
    })
    .await
    {
        Ok(Ok(reply)) => Ok(reply),
        Ok(Err(e)) => Err(OrchestratorError::Other(format!(
            "agent {} failed: {}",
            agent, e
        ))),
        Err(_) => Err(OrchestratorError::AgentInvocationTimeout {
            agent,
            timeout_ms: deadline.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tower::Service;

    fn invocation() -> AgentInvocation {
        AgentInvocation {
            session_id: SessionId::from("s1"),
            agent: "echo".to_string(),
            message: "hello".to_string(),
            context: vec![],
        }
    }

    #[tokio::test]
    async fn agent_fn_produces_a_callable_service() {
        let mut svc = agent_fn(|inv: AgentInvocation| async move {
            Ok(AgentReply::message(inv.agent, format!("echo: {}", inv.message)))
        });
        let reply = svc.ready().await.unwrap().call(invocation()).await.unwrap();
        assert_eq!(reply.output.content, "echo: hello");
        assert!(reply.handoff.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expiry_maps_to_timeout_error() {
        let mut svc = agent_fn(|inv: AgentInvocation| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(AgentReply::message(inv.agent, "late"))
        });
        let err = invoke_with_deadline(&mut svc, invocation(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::AgentInvocationTimeout { .. }
        ));
    }

    #[tokio::test]
    async fn agent_error_is_not_a_timeout() {
        let mut svc =
            agent_fn(|_inv: AgentInvocation| async move { Err::<AgentReply, BoxError>("boom".into()) });
        let err = invoke_with_deadline(&mut svc, invocation(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Other(_)));
        assert!(err.is_breaker_failure());
    }

    #[test]
    fn handoff_declaration_builder() {
        let decl = HandoffDeclaration::new("finops_agent", "security_specialist")
            .with_reason("credential leak suspected")
            .with_payload(json!({"severity": "high"}));
        assert_eq!(decl.from_agent, "finops_agent");
        assert_eq!(decl.to_agent, "security_specialist");
        assert_eq!(decl.reason.as_deref(), Some("credential leak suspected"));
        assert_eq!(decl.payload["severity"], "high");
    }

    #[test]
    fn handoff_declaration_serialization() {
        let decl = HandoffDeclaration::new("a", "b").with_reason("test");
        let text = serde_json::to_string(&decl).unwrap();
        let back: HandoffDeclaration = serde_json::from_str(&text).unwrap();
        assert_eq!(back.from_agent, decl.from_agent);
        assert_eq!(back.to_agent, decl.to_agent);
        assert_eq!(back.reason, decl.reason);
    }
}
