//! Process-wide circuit breaker gating automatic routing.
//!
//! What this module provides
//! - A single stateful gate that disables automatic routing after repeated
//!   orchestration failures and re-enables it after a cooldown
//!
//! Exports
//! - `BreakerConfig { failure_threshold, window, cooldown }`
//! - `BreakerState::{Closed, Open, HalfOpen}`
//! - `CircuitBreaker` with `is_routing_allowed()`, `record_success()`,
//!   `record_failure()`
//!
//! Implementation strategy
//! - One `std::sync::Mutex` around the whole state; failure events are rare
//!   so contention is negligible and no lock-free structure is warranted
//! - Failures are counted in a rolling window anchored at `window_start`;
//!   a failure after the window expires resets the count to 1
//! - `open -> half_open` happens lazily inside `is_routing_allowed` once the
//!   cooldown has elapsed; no background timer is needed. Only one trial
//!   runs at a time while half-open; other callers are refused until the
//!   trial records an outcome
//! - Time is `tokio::time::Instant` so tests can pause and advance the clock
//!
//! Testing strategy
//! - `#[tokio::test(start_paused = true)]` with `tokio::time::advance` to
//!   exercise window expiry and cooldown without wall-clock sleeps

use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

/// Breaker thresholds. Defaults: 3 failures within 5 minutes open the
/// breaker; it half-opens after a 10 minute cooldown.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub window: Duration,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            window: Duration::from_secs(5 * 60),
            cooldown: Duration::from_secs(10 * 60),
        }
    }
}

/// Public view of the breaker state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    window_start: Instant,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Process-wide breaker. This component is the only one permitted to mutate
/// the breaker state; the orchestrator reads it via [`is_routing_allowed`]
/// before every routing attempt.
///
/// [`is_routing_allowed`]: CircuitBreaker::is_routing_allowed
#[derive(Debug)]
pub struct CircuitBreaker {
    cfg: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self {
            cfg,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                window_start: Instant::now(),
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Whether automatic routing may run. Promotes `Open` to `HalfOpen`
    /// once the cooldown has elapsed. `HalfOpen` permits a single trial at
    /// a time: the caller that gets `true` owns the trial, and everyone
    /// else is refused until that trial records an outcome.
    pub fn is_routing_allowed(&self) -> bool {
        let mut g = self.inner.lock().unwrap();
        match g.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => {
                if g.trial_in_flight {
                    false
                } else {
                    g.trial_in_flight = true;
                    true
                }
            }
            BreakerState::Open => {
                let expired = g
                    .opened_at
                    .map(|t| t.elapsed() >= self.cfg.cooldown)
                    .unwrap_or(true);
                if expired {
                    g.state = BreakerState::HalfOpen;
                    g.trial_in_flight = true;
                    info!("circuit breaker half-open: cooldown elapsed, permitting trial");
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful orchestration attempt.
    pub fn record_success(&self) {
        let mut g = self.inner.lock().unwrap();
        match g.state {
            BreakerState::HalfOpen => {
                g.state = BreakerState::Closed;
                g.failure_count = 0;
                g.opened_at = None;
                g.trial_in_flight = false;
                info!("circuit breaker closed: trial attempt succeeded");
            }
            BreakerState::Closed => {
                g.failure_count = 0;
            }
            BreakerState::Open => {}
        }
    }

    /// Record a failed orchestration attempt.
    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut g = self.inner.lock().unwrap();
        match g.state {
            BreakerState::HalfOpen => {
                g.state = BreakerState::Open;
                g.opened_at = Some(now);
                g.trial_in_flight = false;
                warn!("circuit breaker re-opened: trial attempt failed");
            }
            BreakerState::Open => {}
            BreakerState::Closed => {
                if now.duration_since(g.window_start) > self.cfg.window {
                    g.window_start = now;
                    g.failure_count = 1;
                } else {
                    g.failure_count += 1;
                }
                if g.failure_count >= self.cfg.failure_threshold {
                    g.state = BreakerState::Open;
                    g.opened_at = Some(now);
                    warn!(
                        failures = g.failure_count,
                        "circuit breaker opened: automatic routing disabled"
                    );
                }
            }
        }
    }

    /// Snapshot of the current state, for event emission.
    pub fn current_state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }

    /// Failures observed in the current window.
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().unwrap().failure_count
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
