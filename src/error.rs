//! Error types for the orchestrator.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Main error type for the orchestrator.
///
/// Most variants describe recoverable conditions that the orchestrator
/// absorbs internally (fallback handler, fresh session). The only variant
/// surfaced to callers of `HandleMessage` is `SessionStoreWriteFailure`,
/// raised after the single save retry has also failed.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Target agent cannot be resolved by the registry.
    #[error("agent not found: {name}")]
    AgentNotFound { name: String },

    /// Agent invocation exceeded its deadline.
    #[error("agent invocation timed out after {timeout_ms}ms: {agent}")]
    AgentInvocationTimeout { agent: String, timeout_ms: u64 },

    /// Applying a handoff would push the chain past the configured bound.
    #[error("maximum handoffs exceeded: {max_handoffs} (chain: {chain:?})")]
    MaxHandoffsExceeded {
        max_handoffs: usize,
        chain: Vec<String>,
    },

    /// An agent declared a handoff to itself.
    #[error("circular handoff rejected: {from} -> {to}")]
    CircularHandoffRejected { from: String, to: String },

    /// A persisted session failed schema validation on load.
    #[error("session record corrupt: {0}")]
    SessionStoreCorrupt(String),

    /// Session save failed twice; state for this turn is in-memory only.
    #[error("session write failed after retry: {0}")]
    SessionStoreWriteFailure(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Other errors.
    #[error("{0}")]
    Other(String),
}

impl OrchestratorError {
    /// Whether this condition counts as a circuit-breaker failure.
    ///
    /// Not-found agents and the max-handoffs bound are expected, recoverable
    /// conditions (the safety bound working as intended); only invocation
    /// timeouts and unexpected agent errors feed the breaker.
    pub fn is_breaker_failure(&self) -> bool {
        matches!(
            self,
            OrchestratorError::AgentInvocationTimeout { .. } | OrchestratorError::Other(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OrchestratorError::MaxHandoffsExceeded {
            max_handoffs: 5,
            chain: vec!["a".into(), "b".into()],
        };
        assert!(err.to_string().starts_with("maximum handoffs exceeded: 5"));

        let err = OrchestratorError::AgentInvocationTimeout {
            agent: "finops_agent".into(),
            timeout_ms: 1000,
        };
        assert_eq!(
            err.to_string(),
            "agent invocation timed out after 1000ms: finops_agent"
        );
    }

    #[test]
    fn test_breaker_failure_classification() {
        assert!(OrchestratorError::AgentInvocationTimeout {
            agent: "a".into(),
            timeout_ms: 1
        }
        .is_breaker_failure());

        assert!(!OrchestratorError::AgentNotFound { name: "ghost".into() }.is_breaker_failure());
        assert!(!OrchestratorError::MaxHandoffsExceeded {
            max_handoffs: 5,
            chain: vec![]
        }
        .is_breaker_failure());
    }

    #[test]
    fn test_error_from_serde() {
        let serde_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: OrchestratorError = serde_err.into();
        assert!(matches!(err, OrchestratorError::Serialization(_)));
    }
}
