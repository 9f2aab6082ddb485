//! Switchboard: automatic multi-agent handoff orchestration over Tower.
//!
//! The orchestrator carries each user message through classification,
//! confidence-gated routing, agent invocation with deadlines, bounded
//! handoff chains, context enrichment, and atomic session persistence.
//! Agents, the classifier, session stores, and the event sink are all
//! plain `tower::Service`s, so any of them can be swapped or wrapped with
//! layers.
//!
//! # Example
//!
//! ```
//! use switchboard::{
//!     agent_fn, AgentDescriptor, AgentReply, Classification, HandleMessage,
//!     InMemorySessionStore, Orchestrator, Service, ServiceExt,
//! };
//!
//! # async fn demo() -> Result<(), tower::BoxError> {
//! let mut orchestrator = Orchestrator::builder()
//!     .agent(
//!         AgentDescriptor::new("security_specialist").with_capability("security"),
//!         agent_fn(|inv| async move {
//!             Ok(AgentReply::message(inv.agent, "rotating the leaked keys now"))
//!         }),
//!     )
//!     .store(InMemorySessionStore::new().handle())
//!     .build();
//!
//! let turn = orchestrator
//!     .ready()
//!     .await?
//!     .call(
//!         HandleMessage::new("conv-1", "I think my API key leaked").with_classification(
//!             Classification {
//!                 domain: "security".to_string(),
//!                 confidence: 0.91,
//!                 complexity: 7,
//!             },
//!         ),
//!     )
//!     .await?;
//!
//! assert_eq!(turn.output.agent, "security_specialist");
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod breaker;
pub mod classify;
pub mod config;
pub mod enrich;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod registry;
pub mod session;
pub mod sqlite_store;
pub mod store;

pub use agent::{
    agent_fn, invoke_with_deadline, AgentInvocation, AgentOutput, AgentReply, AgentSvc,
    HandoffDeclaration,
};
pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use classify::{
    classifier_fn, decide_route, passes_gate, Classification, ClassifierAdapter, ClassifierSvc,
    RoutingDecision, SwitchReason,
};
pub use config::{ConfigBuilder, OrchestratorConfig};
pub use enrich::{ContextCaps, ContextEnricher};
pub use error::{OrchestratorError, Result};
pub use events::{noop_sink, tracing_sink, EventSink, HopEvent, HopOutcome};
pub use orchestrator::{HandleMessage, Orchestrator, OrchestratorBuilder, TurnOutcome};
pub use registry::{AgentDescriptor, AgentEntry, AgentRegistry};
pub use session::{ContextEntry, Session, SessionId, SESSION_SCHEMA_VERSION};
pub use sqlite_store::SqliteSessionStore;
pub use store::{
    ArchiveSession, FileSessionStore, InMemorySessionStore, LoadSession, SaveSession,
    SessionStoreHandle,
};

// Re-export the Tower vocabulary callers need to drive the services.
pub use tower::{BoxError, Layer, Service, ServiceExt};
