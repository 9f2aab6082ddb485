//! Hop events for observability.
//!
//! Every invocation attempt produces exactly one [`HopEvent`], pushed into
//! a pluggable [`EventSink`] service. Emission is fire-and-forget: sink
//! failures are logged at debug and never affect the turn.

use std::time::Duration;

use serde::Serialize;
use tower::util::BoxCloneService;
use tower::{BoxError, Service, ServiceExt};
use tracing::{debug, info};
use uuid::Uuid;

use crate::breaker::BreakerState;
use crate::session::SessionId;

/// How an invocation attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HopOutcome {
    /// Agent replied within its deadline.
    Success,
    /// Agent missed its deadline.
    Timeout,
    /// Invocation failed for a reason other than the deadline.
    Error,
    /// Target or declared agent was not in the registry.
    NotFound,
    /// Handoff rejected because the chain was at its limit.
    MaxHandoffs,
    /// Self-handoff rejected.
    LoopRejected,
    /// Fallback agent served the turn.
    Fallback,
}

/// One per invocation attempt, successful or not.
#[derive(Debug, Clone, Serialize)]
pub struct HopEvent {
    pub event_id: String,
    pub session_id: SessionId,
    pub agent: String,
    pub outcome: HopOutcome,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub breaker_state: BreakerState,
}

impl HopEvent {
    pub fn new(
        session_id: SessionId,
        agent: impl Into<String>,
        outcome: HopOutcome,
        duration: Duration,
        breaker_state: BreakerState,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            session_id,
            agent: agent.into(),
            outcome,
            duration,
            breaker_state,
        }
    }
}

mod duration_ms {
    use super::Duration;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u64(d.as_millis() as u64)
    }
}

/// Boxed event sink type alias.
pub type EventSink = BoxCloneService<HopEvent, (), BoxError>;

/// Sink that logs each event as a structured tracing record.
pub fn tracing_sink() -> EventSink {
    BoxCloneService::new(tower::service_fn(|event: HopEvent| async move {
        info!(
            event_id = %event.event_id,
            session_id = %event.session_id,
            agent = %event.agent,
            outcome = ?event.outcome,
            duration_ms = event.duration.as_millis() as u64,
            breaker_state = ?event.breaker_state,
            "hop"
        );
        Ok(())
    }))
}

/// Sink that discards events, for tests and embedding.
pub fn noop_sink() -> EventSink {
    BoxCloneService::new(tower::service_fn(|_event: HopEvent| async move { Ok(()) }))
}

/// Emit an event into the sink, swallowing sink errors.
pub async fn emit(sink: &mut EventSink, event: HopEvent) {
    let id = event.event_id.clone();
    if let Err(e) = async { sink.ready().await?.call(event).await }.await {
        debug!(event_id = %id, error = %e, "event sink rejected hop event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn event(outcome: HopOutcome) -> HopEvent {
        HopEvent::new(
            SessionId::from("s1"),
            "security_specialist",
            outcome,
            Duration::from_millis(42),
            BreakerState::Closed,
        )
    }

    #[test]
    fn events_serialize_with_millisecond_durations() {
        let e = event(HopOutcome::Success);
        let v: serde_json::Value = serde_json::to_value(&e).unwrap();
        assert_eq!(v["outcome"], "success");
        assert_eq!(v["duration"], 42);
        assert_eq!(v["breaker_state"], "closed");
    }

    #[tokio::test]
    async fn sink_errors_do_not_propagate() {
        let mut sink: EventSink = BoxCloneService::new(tower::service_fn(
            |_e: HopEvent| async move { Err::<(), BoxError>("sink down".into()) },
        ));
        // Must not panic or return an error.
        emit(&mut sink, event(HopOutcome::Timeout)).await;
    }

    #[tokio::test]
    async fn collecting_sink_sees_every_event() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let mut sink: EventSink = BoxCloneService::new(tower::service_fn(move |e: HopEvent| {
            let seen = seen2.clone();
            async move {
                seen.lock().unwrap().push(e.outcome);
                Ok(())
            }
        }));
        emit(&mut sink, event(HopOutcome::Success)).await;
        emit(&mut sink, event(HopOutcome::Fallback)).await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![HopOutcome::Success, HopOutcome::Fallback]
        );
    }
}
